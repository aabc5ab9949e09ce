//! Transport-level scenarios driven end to end through the mock provider.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use nvme_fabrics::{
    DataTransfer, FabricsCommandType, GenericStatusCode, NvmeCmd, NvmeCpl,
    RdmaAcceptPrivateData, RdmaRejectPrivateData, RdmaRequestPrivateData, SglDescriptor,
    SglSubtype, OPC_FABRIC,
};
use nvmf_rdma::{
    BackendDisposition, NvmfBackend, NvmfRequest, RdmaConn, RdmaTransport, Session, SlotState,
    TransportOpts,
};
use rdma_core::mock::MockProvider;
use rdma_core::{CmEventKind, CmId, PortSpace, WcStatus};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

const OPC_FLUSH: u8 = 0x00;
const OPC_WRITE: u8 = 0x01;
const OPC_READ: u8 = 0x02;

#[derive(Default)]
struct TestBackend {
    /// (slot, opcode) of every execution, in order.
    executed: Vec<(u16, u8)>,
    /// Payload snapshots of host-to-controller executions.
    received_data: Vec<Vec<u8>>,
    /// Bytes to produce for controller-to-host executions.
    c2h_fill: Option<Vec<u8>>,
    /// Report every execution as pending instead of completing inline.
    pending_mode: bool,
    pending_slots: Vec<u16>,
}

impl NvmfBackend for TestBackend {
    fn execute(&mut self, req: NvmfRequest<'_>) -> BackendDisposition {
        self.executed.push((req.slot, req.cmd.opc));
        match req.xfer {
            DataTransfer::HostToController => self.received_data.push(req.data.to_vec()),
            DataTransfer::ControllerToHost => {
                if let Some(fill) = &self.c2h_fill {
                    req.data.copy_from_slice(fill);
                }
            }
            _ => {}
        }
        if self.pending_mode {
            self.pending_slots.push(req.slot);
            BackendDisposition::Pending
        } else {
            BackendDisposition::Complete
        }
    }
}

fn setup(opts: TransportOpts) -> (Rc<RefCell<MockProvider>>, RdmaTransport) {
    let mock = Rc::new(RefCell::new(MockProvider::with_device()));
    let mut transport = RdmaTransport::init(mock.clone(), opts);
    let addr: SocketAddr = "127.0.0.1:4420".parse().unwrap();
    transport.acceptor_init(addr).unwrap();
    (mock, transport)
}

fn connect_private_data(hrqsize: u16, hsqsize: u16) -> Vec<u8> {
    let mut data = RdmaRequestPrivateData::new_zeroed();
    data.hrqsize.set(hrqsize);
    data.hsqsize.set(hsqsize);
    data.as_bytes().to_vec()
}

fn capsule(cmd: &NvmeCmd, data: &[u8]) -> Vec<u8> {
    let mut bytes = cmd.as_bytes().to_vec();
    bytes.extend_from_slice(data);
    bytes
}

fn connect_capsule(cid: u16) -> Vec<u8> {
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_FABRIC;
    cmd.cid.set(cid);
    cmd.nsid.set(FabricsCommandType::Connect as u32);
    cmd.dptr = SglDescriptor::in_capsule(0, 1024);
    capsule(&cmd, &[0u8; 1024])
}

fn parse_cpl(bytes: &[u8]) -> NvmeCpl {
    *LayoutVerified::<&[u8], NvmeCpl>::new(bytes).unwrap().into_ref()
}

/// Connect a host, run the NVMe-oF CONNECT capsule through the pending poll
/// and hand the matured connection back.
fn establish(
    mock: &Rc<RefCell<MockProvider>>, transport: &mut RdmaTransport,
    backend: &mut TestBackend, hrqsize: u16, hsqsize: u16, initiator_depth: u8,
) -> (CmId, RdmaConn) {
    let private_data = connect_private_data(hrqsize, hsqsize);
    let id = mock.borrow_mut().connect(&private_data, initiator_depth, PortSpace::Ib);
    let matured = transport.acceptor_poll(backend, &mut |_| {}).unwrap();
    assert!(matured.is_empty());
    mock.borrow_mut().host_send(id, &connect_capsule(0)).unwrap();
    let mut matured = transport.acceptor_poll(backend, &mut |_| {}).unwrap();
    assert_eq!(matured.len(), 1);
    (id, matured.pop().unwrap())
}

fn finish(transport: &RdmaTransport, conn: RdmaConn, session: Session) {
    // the pool's memory region lives on the connection's device
    transport.session_fini(session);
    transport.conn_fini(conn);
}

#[test]
fn small_write_in_capsule() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let mut session = transport.session_init(&conn).unwrap();

    let payload = vec![0xc7u8; 512];
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(1);
    cmd.dptr = SglDescriptor::in_capsule(0, 512);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &payload)).unwrap();

    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 1);
    assert_eq!(backend.executed.len(), 2); // CONNECT, then the write
    assert_eq!(backend.executed[1].1, OPC_WRITE);
    assert_eq!(backend.received_data[1], payload);
    // no data transfer was needed
    let stats = mock.borrow().stats(id);
    assert_eq!(stats.rdma_reads, 0);
    assert_eq!(stats.rdma_writes, 0);

    let sent = mock.borrow().sent(id).to_vec();
    assert_eq!(sent.len(), 2);
    let cpl = parse_cpl(&sent[1]);
    assert!(cpl.is_success());
    assert_eq!(cpl.cid.get(), 1);

    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.active_slots(), 0);
    finish(&transport, conn, session);
}

#[test]
fn large_write_through_session_pool() {
    let opts = TransportOpts { max_queue_depth: 8, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 8, 8, 8);
    let mut session = transport.session_init(&conn).unwrap();
    assert_eq!(session.pool_total(), 8);

    let pattern = vec![0x5au8; 65536];
    let (host_addr, rkey) = mock.borrow_mut().register_host_memory(pattern.clone());
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(2);
    cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, host_addr, 65536, rkey);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();

    // first turn: the capsule arrives, a chunk is taken, the READ goes out
    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 0);
    assert_eq!(session.pool_available(), 7);
    assert_eq!(mock.borrow().stats(id).rdma_reads, 1);
    assert_eq!(conn.cur_queue_depth(), 1);
    assert_eq!(conn.active_slots(), 1);

    // second turn: the READ completed, the backend runs, the chunk returns
    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 1);
    assert_eq!(backend.received_data[1], pattern);
    assert_eq!(session.pool_available(), 8);
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.cur_rdma_rw_depth(), 0);
    finish(&transport, conn, session);
}

#[test]
fn large_read_writes_host_memory() {
    let opts = TransportOpts { max_queue_depth: 8, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 8, 8, 8);
    let mut session = transport.session_init(&conn).unwrap();

    backend.c2h_fill = Some(vec![0x3cu8; 16384]);
    let (host_addr, rkey) = mock.borrow_mut().register_host_memory(vec![0u8; 16384]);
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_READ;
    cmd.cid.set(3);
    cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, host_addr, 16384, rkey);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();

    // the backend runs right away and its data goes out as an RDMA WRITE
    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 1);
    assert_eq!(mock.borrow().stats(id).rdma_writes, 1);
    assert_eq!(mock.borrow().host_memory(rkey), &vec![0x3cu8; 16384][..]);

    // WRITE completion, then the completion capsule and its acknowledgement
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(session.pool_available(), 8);
    finish(&transport, conn, session);
}

#[test]
fn rw_credit_starvation_serializes_reads() {
    let opts = TransportOpts { max_queue_depth: 8, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    // initiator depth 1 negotiates the RDMA READ/WRITE depth down to 1
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 8, 8, 1);
    let mut session = transport.session_init(&conn).unwrap();
    assert_eq!(conn.max_rw_depth(), 1);
    mock.borrow_mut().auto_complete = false;

    let (addr_a, rkey_a) = mock.borrow_mut().register_host_memory(vec![0xaau8; 16384]);
    let (addr_b, rkey_b) = mock.borrow_mut().register_host_memory(vec![0xbbu8; 16384]);
    for (cid, (addr, rkey)) in [(1u16, (addr_a, rkey_a)), (2u16, (addr_b, rkey_b))] {
        let mut cmd = NvmeCmd::new_zeroed();
        cmd.opc = OPC_WRITE;
        cmd.cid.set(cid);
        cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 16384, rkey);
        mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();
    }

    // exactly one READ goes out; the second slot queues on the credit
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(mock.borrow().stats(id).rdma_reads, 1);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(conn.pending_rdma_rw_len(), 1);
    assert_eq!(conn.cur_queue_depth(), 2);

    // nothing moves while the first READ is outstanding
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(mock.borrow().stats(id).rdma_reads, 1);

    // the moment it completes, the queued READ is posted
    mock.borrow_mut().complete_sq(id, 1);
    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 1);
    assert_eq!(mock.borrow().stats(id).rdma_reads, 2);
    assert_eq!(conn.pending_rdma_rw_len(), 0);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(backend.received_data[1], vec![0xaau8; 16384]);

    // drain the rest of the pipeline
    while conn.cur_queue_depth() > 0 {
        mock.borrow_mut().complete_sq(id, 8);
        transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    }
    assert_eq!(backend.received_data[2], vec![0xbbu8; 16384]);
    assert_eq!(session.pool_available(), 8);
    assert_eq!(conn.cur_rdma_rw_depth(), 0);
    finish(&transport, conn, session);
}

#[test]
fn buffer_starvation_across_connections() {
    let opts = TransportOpts { max_queue_depth: 2, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id1, mut conn1) = establish(&mock, &mut transport, &mut backend, 2, 2, 2);
    let (id2, mut conn2) = establish(&mock, &mut transport, &mut backend, 2, 2, 2);
    // one session, one two-chunk pool, shared by both connections
    let mut session = transport.session_init(&conn1).unwrap();
    assert_eq!(session.pool_total(), 2);
    mock.borrow_mut().auto_complete = false;

    let send_write = |id: CmId, cid: u16, fill: u8| {
        let (addr, rkey) = mock.borrow_mut().register_host_memory(vec![fill; 16384]);
        let mut cmd = NvmeCmd::new_zeroed();
        cmd.opc = OPC_WRITE;
        cmd.cid.set(cid);
        cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 16384, rkey);
        mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();
    };
    send_write(id1, 1, 0x11);
    send_write(id1, 2, 0x22);
    send_write(id2, 3, 0x33);

    // the first connection takes both chunks
    transport.conn_poll(&mut conn1, Some(&mut session), &mut backend).unwrap();
    assert_eq!(session.pool_available(), 0);
    assert_eq!(mock.borrow().stats(id1).rdma_reads, 2);

    // the second connection's request parks on the buffer queue
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn2.pending_data_buf_len(), 1);
    let starved = (0..conn2.max_queue_depth())
        .find(|idx| conn2.slot_state(*idx) == Some(SlotState::NeedBuffer));
    assert!(starved.is_some());

    // and stays parked while the chunks are held
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn2.pending_data_buf_len(), 1);
    assert_eq!(mock.borrow().stats(id2).rdma_reads, 0);

    // completing the first connection's requests returns the chunks
    mock.borrow_mut().complete_sq(id1, 2);
    transport.conn_poll(&mut conn1, Some(&mut session), &mut backend).unwrap();
    assert_eq!(session.pool_available(), 2);

    // the parked host-to-controller request resumes through the RDMA queue
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn2.pending_data_buf_len(), 0);
    assert_eq!(mock.borrow().stats(id2).rdma_reads, 1);

    mock.borrow_mut().complete_sq(id2, 1);
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(backend.received_data.last().unwrap(), &vec![0x33u8; 16384]);

    // retire everything
    for (id, conn) in [(id1, &mut conn1), (id2, &mut conn2)] {
        while conn.cur_queue_depth() > 0 {
            mock.borrow_mut().complete_sq(id, 8);
            transport.conn_poll(conn, Some(&mut session), &mut backend).unwrap();
        }
    }
    assert_eq!(session.pool_available(), 2);
    transport.session_fini(session);
    transport.conn_fini(conn1);
    transport.conn_fini(conn2);
}

#[test]
fn buffer_starved_read_resumes_to_backend() {
    let opts = TransportOpts { max_queue_depth: 2, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id1, mut conn1) = establish(&mock, &mut transport, &mut backend, 2, 2, 2);
    let (id2, mut conn2) = establish(&mock, &mut transport, &mut backend, 2, 2, 2);
    let mut session = transport.session_init(&conn1).unwrap();
    mock.borrow_mut().auto_complete = false;

    for cid in [1u16, 2] {
        let (addr, rkey) = mock.borrow_mut().register_host_memory(vec![0x44; 16384]);
        let mut cmd = NvmeCmd::new_zeroed();
        cmd.opc = OPC_WRITE;
        cmd.cid.set(cid);
        cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 16384, rkey);
        mock.borrow_mut().host_send(id1, &capsule(&cmd, &[])).unwrap();
    }
    transport.conn_poll(&mut conn1, Some(&mut session), &mut backend).unwrap();
    assert_eq!(session.pool_available(), 0);

    // a controller-to-host request starves on the pool
    backend.c2h_fill = Some(vec![0x77u8; 16384]);
    let (addr, rkey) = mock.borrow_mut().register_host_memory(vec![0u8; 16384]);
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_READ;
    cmd.cid.set(3);
    cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 16384, rkey);
    mock.borrow_mut().host_send(id2, &capsule(&cmd, &[])).unwrap();
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn2.pending_data_buf_len(), 1);
    let executed_before = backend.executed.len();

    mock.borrow_mut().complete_sq(id1, 2);
    transport.conn_poll(&mut conn1, Some(&mut session), &mut backend).unwrap();

    // on resume the request goes straight to the backend, then WRITEs out
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(backend.executed.len(), executed_before + 1);
    assert_eq!(mock.borrow().stats(id2).rdma_writes, 1);
    mock.borrow_mut().complete_sq(id2, 1);
    transport.conn_poll(&mut conn2, Some(&mut session), &mut backend).unwrap();
    assert_eq!(mock.borrow().host_memory(rkey), &vec![0x77u8; 16384][..]);

    for (id, conn) in [(id1, &mut conn1), (id2, &mut conn2)] {
        while conn.cur_queue_depth() > 0 {
            mock.borrow_mut().complete_sq(id, 8);
            transport.conn_poll(conn, Some(&mut session), &mut backend).unwrap();
        }
    }
    transport.session_fini(session);
    transport.conn_fini(conn1);
    transport.conn_fini(conn2);
}

#[test]
fn malformed_sgl_is_reported_in_the_completion() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let mut session = transport.session_init(&conn).unwrap();
    let recvs_before = mock.borrow().outstanding_recvs(id);

    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(9);
    cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, 0x1000, 4096, 1);
    cmd.dptr.id = 0x70; // reserved descriptor type
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();

    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 0);
    let stats = mock.borrow().stats(id);
    assert_eq!(stats.rdma_reads, 0);
    assert_eq!(stats.rdma_writes, 0);

    let sent = mock.borrow().sent(id).to_vec();
    let cpl = parse_cpl(sent.last().unwrap());
    assert_eq!(cpl.cid.get(), 9);
    assert_eq!(cpl.status_code(), GenericStatusCode::SglDescriptorTypeInvalid as u8);
    assert_eq!(cpl.status_code_type(), 0);

    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(mock.borrow().outstanding_recvs(id), recvs_before);
    finish(&transport, conn, session);
}

#[test]
fn disconnect_before_connect_tears_down_in_place() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let id = mock.borrow_mut().connect(&connect_private_data(8, 8), 8, PortSpace::Ib);
    let matured = transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    assert!(matured.is_empty());
    assert!(mock.borrow().accepted_param(id).is_some());

    mock.borrow_mut().disconnect(id);
    let mut dispatched = Vec::new();
    let matured = transport
        .acceptor_poll(&mut backend, &mut |id| dispatched.push(id))
        .unwrap();
    assert!(matured.is_empty());
    // torn down right here, with no cross-executor dispatch
    assert!(dispatched.is_empty());
    assert!(!mock.borrow().has_conn(id));
}

#[test]
fn disconnect_of_a_bound_connection_is_dispatched() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let session = transport.session_init(&conn).unwrap();

    mock.borrow_mut().disconnect(id);
    let mut dispatched = Vec::new();
    transport.acceptor_poll(&mut backend, &mut |id| dispatched.push(id)).unwrap();
    assert_eq!(dispatched, vec![id]);

    finish(&transport, conn, session);
}

#[test]
fn negotiation_takes_the_smallest_limit() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    // device allows 1024/16; the host offers 64/100 and initiator depth 4
    let (id, conn) = establish(&mock, &mut transport, &mut backend, 64, 100, 4);
    assert_eq!(conn.max_queue_depth(), 64);
    assert_eq!(conn.max_rw_depth(), 4);

    let mock_ref = mock.borrow();
    let param = mock_ref.accepted_param(id).unwrap();
    assert_eq!(param.rnr_retry_count, 7);
    let accept = LayoutVerified::<&[u8], RdmaAcceptPrivateData>::new_from_prefix(
        param.private_data.as_slice(),
    )
    .unwrap()
    .0
    .into_ref();
    assert_eq!(accept.recfmt.get(), 0);
    assert_eq!(accept.crqsize.get(), 64);
    drop(mock_ref);
    transport.conn_fini(conn);
}

#[test]
fn short_private_data_is_ignored() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let id = mock.borrow_mut().connect(&[0u8; 8], 8, PortSpace::Ib);
    let matured = transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    assert!(matured.is_empty());
    mock.borrow_mut().host_send(id, &connect_capsule(0)).unwrap();
    let mut matured = transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    let conn = matured.pop().unwrap();
    // only the target default and the device caps apply
    assert_eq!(conn.max_queue_depth(), 128);
    assert_eq!(conn.max_rw_depth(), 8);
    transport.conn_fini(conn);
}

#[test]
fn tcp_port_space_accept_overrides() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let id = mock
        .borrow_mut()
        .connect(&connect_private_data(32, 32), 4, PortSpace::Tcp);
    transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    let mock_ref = mock.borrow();
    let param = mock_ref.accepted_param(id).unwrap();
    assert_eq!(param.responder_resources, 0);
    assert_eq!(param.initiator_depth, 4);
    drop(mock_ref);
    transport.acceptor_fini();
}

#[test]
fn failed_negotiation_rejects_with_internal_error() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    // hsqsize 0 negotiates the queue depth to zero, which cannot be built
    let id = mock.borrow_mut().connect(&connect_private_data(8, 0), 8, PortSpace::Ib);
    let matured = transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    assert!(matured.is_empty());
    let mock_ref = mock.borrow();
    let reject = mock_ref.rejected_data(id).unwrap();
    let reject = LayoutVerified::<&[u8], RdmaRejectPrivateData>::new(reject)
        .unwrap()
        .into_ref();
    assert_eq!(reject.recfmt.get(), 0);
    assert_eq!(reject.sts.get(), GenericStatusCode::InternalDeviceError as u16);
}

#[test]
fn unknown_cm_events_are_ignored() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let id = mock.borrow_mut().connect(&connect_private_data(8, 8), 8, PortSpace::Ib);
    transport.acceptor_poll(&mut backend, &mut |_| {}).unwrap();
    let acked = mock.borrow().acked_events();

    mock.borrow_mut().push_event(id, CmEventKind::Established);
    let mut dispatched = Vec::new();
    let matured = transport
        .acceptor_poll(&mut backend, &mut |id| dispatched.push(id))
        .unwrap();
    assert!(matured.is_empty());
    assert!(dispatched.is_empty());
    assert!(mock.borrow().has_conn(id));
    assert_eq!(mock.borrow().acked_events(), acked + 1);
    transport.acceptor_fini();
}

#[test]
fn pending_backend_completion_resumes_the_request() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let mut session = transport.session_init(&conn).unwrap();

    backend.pending_mode = true;
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(5);
    cmd.dptr = SglDescriptor::in_capsule(0, 256);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[0x9du8; 256])).unwrap();

    let invoked = transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap();
    assert_eq!(invoked, 1);
    let slot = *backend.pending_slots.last().unwrap();
    assert_eq!(conn.slot_state(slot), Some(SlotState::Executing));
    assert_eq!(mock.borrow().sent(id).len(), 1); // only the CONNECT response so far

    transport
        .req_complete(&mut conn, Some(&mut session), &mut backend, slot)
        .unwrap();
    assert_eq!(mock.borrow().sent(id).len(), 2);
    let cpl = parse_cpl(mock.borrow().sent(id).last().unwrap());
    assert_eq!(cpl.cid.get(), 5);

    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    finish(&transport, conn, session);
}

#[test]
fn released_request_sends_no_completion() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let mut session = transport.session_init(&conn).unwrap();
    let recvs_before = mock.borrow().outstanding_recvs(id);

    backend.pending_mode = true;
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(6);
    cmd.dptr = SglDescriptor::in_capsule(0, 64);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[1u8; 64])).unwrap();
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    let slot = *backend.pending_slots.last().unwrap();

    transport.req_release(&mut conn, Some(&mut session), slot).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.slot_state(slot), Some(SlotState::Posted));
    assert_eq!(mock.borrow().sent(id).len(), 1);
    assert_eq!(mock.borrow().outstanding_recvs(id), recvs_before);
    finish(&transport, conn, session);
}

#[test]
fn failed_work_completion_is_fatal() {
    let opts = TransportOpts { max_queue_depth: 8, max_io_size: 65536, in_capsule_data_size: 4096 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 8, 8, 8);
    let mut session = transport.session_init(&conn).unwrap();
    mock.borrow_mut().auto_complete = false;

    let (addr, rkey) = mock.borrow_mut().register_host_memory(vec![0u8; 16384]);
    let mut cmd = NvmeCmd::new_zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid.set(1);
    cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 16384, rkey);
    mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();

    assert!(mock.borrow_mut().fail_sq(id, WcStatus::RemoteAccessError));
    transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap_err();
    finish(&transport, conn, session);
}

#[test]
fn runt_capsule_is_fatal() {
    let (mock, mut transport) = setup(TransportOpts::default());
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 128, 128, 8);
    let mut session = transport.session_init(&conn).unwrap();

    mock.borrow_mut().host_send(id, &[0u8; 16]).unwrap();
    transport
        .conn_poll(&mut conn, Some(&mut session), &mut backend)
        .unwrap_err();
    finish(&transport, conn, session);
}

#[test]
fn sq_head_wraps_and_is_stamped() {
    let opts = TransportOpts { max_queue_depth: 4, ..Default::default() };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 4, 4, 4);
    let mut session = transport.session_init(&conn).unwrap();
    // the CONNECT advanced sq_head once for its send and once for its ack
    transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    assert_eq!(conn.sq_head(), 2);

    for cid in 1..=3u16 {
        let mut cmd = NvmeCmd::new_zeroed();
        cmd.opc = OPC_FLUSH;
        cmd.cid.set(cid);
        mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();
        transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
        transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
    }

    // four completed requests, eight advances over the ring 0..=3
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.sq_head(), 0);
    let sent = mock.borrow().sent(id).to_vec();
    let stamped: Vec<u16> = sent.iter().map(|cpl| parse_cpl(cpl).sqhd.get()).collect();
    assert_eq!(stamped, vec![1, 3, 1, 3]);
    finish(&transport, conn, session);
}

#[test]
fn depth_invariants_hold_under_load() {
    let opts = TransportOpts { max_queue_depth: 4, max_io_size: 32768, in_capsule_data_size: 1024 };
    let (mock, mut transport) = setup(opts);
    let mut backend = TestBackend::default();
    let (id, mut conn) = establish(&mock, &mut transport, &mut backend, 4, 4, 2);
    let mut session = transport.session_init(&conn).unwrap();
    mock.borrow_mut().auto_complete = false;

    for cid in 1..=4u16 {
        let (addr, rkey) = mock.borrow_mut().register_host_memory(vec![cid as u8; 8192]);
        let mut cmd = NvmeCmd::new_zeroed();
        cmd.opc = OPC_WRITE;
        cmd.cid.set(cid);
        cmd.dptr = SglDescriptor::keyed(SglSubtype::Address, addr, 8192, rkey);
        mock.borrow_mut().host_send(id, &capsule(&cmd, &[])).unwrap();
    }

    let check = |conn: &RdmaConn, session: &Session| {
        assert!(conn.cur_queue_depth() <= conn.max_queue_depth());
        assert!(conn.cur_rdma_rw_depth() <= conn.max_rw_depth());
        assert_eq!(conn.active_slots(), usize::from(conn.cur_queue_depth()));
        let held = usize::from(conn.cur_queue_depth());
        assert!(session.pool_available() + held >= session.pool_total());
    };

    for _ in 0..16 {
        transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
        check(&conn, &session);
        mock.borrow_mut().complete_sq(id, 1);
    }
    while conn.cur_queue_depth() > 0 {
        mock.borrow_mut().complete_sq(id, 8);
        transport.conn_poll(&mut conn, Some(&mut session), &mut backend).unwrap();
        check(&conn, &session);
    }
    assert_eq!(session.pool_available(), session.pool_total());
    assert_eq!(backend.received_data.len(), 5); // CONNECT data plus four writes
    finish(&transport, conn, session);
}
