//! An in-process provider for tests and demos.
//!
//! The mock keeps the host side of every connection in ordinary memory: tests
//! inject connection requests and command capsules, registered "host" buffers
//! stand in for the initiator's memory, and posted SEND/READ/WRITE work
//! requests move bytes immediately or when the test steps them with
//! [`MockProvider::complete_sq`].

use std::collections::{HashMap, VecDeque};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::ptr;

use log::warn;

use crate::{
    AccessFlags, CmEvent, CmEventKind, CmId, ConnParam, ConnectRequestData, DeviceAttr,
    MemoryRegion, PortSpace, QpInitAttr, RdmaProvider, RecvWr, SendOpcode, SendWr,
    WcOpcode, WcStatus, WorkCompletion,
};

const HOST_BASE: u64 = 0x4000_0000;

#[derive(Debug, Default, Clone, Copy)]
pub struct MockConnStats {
    pub sends: usize,
    pub rdma_reads: usize,
    pub rdma_writes: usize,
    pub recvs_posted: usize,
}

struct MockMr {
    addr: u64,
    len: usize,
    region: MemoryRegion,
}

#[derive(Default)]
struct MockConn {
    qp: Option<QpInitAttr>,
    cq_nonblocking: bool,
    mrs: Vec<MockMr>,
    recv_wrs: VecDeque<RecvWr>,
    sq_pending: VecDeque<SendWr>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
    accepted: Option<ConnParam>,
    sent: Vec<Vec<u8>>,
    stats: MockConnStats,
}

impl MockConn {
    fn covers(&self, addr: u64, len: usize) -> bool {
        self.mrs.iter().any(|mr| {
            addr >= mr.addr && addr + len as u64 <= mr.addr + mr.len as u64
        })
    }
}

struct HostMemory {
    base: u64,
    data: Vec<u8>,
}

pub struct MockProvider {
    devices: Vec<DeviceAttr>,
    next_id: u32,
    next_key: u32,
    event_channel_open: bool,
    listener: Option<CmId>,
    events: VecDeque<CmEvent>,
    acked_events: usize,
    conns: HashMap<CmId, MockConn>,
    // survives teardown of the id so tests can still inspect it
    rejections: HashMap<CmId, Vec<u8>>,
    host_memory: HashMap<u32, HostMemory>,
    /// Complete send-queue work requests at post time. Switch off to step
    /// completions manually with [`complete_sq`](Self::complete_sq).
    pub auto_complete: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_id: 1,
            next_key: 1,
            event_channel_open: false,
            listener: None,
            events: VecDeque::new(),
            acked_events: 0,
            conns: HashMap::new(),
            rejections: HashMap::new(),
            host_memory: HashMap::new(),
            auto_complete: true,
        }
    }

    /// A provider with one reasonably capable device.
    pub fn with_device() -> Self {
        let mut mock = Self::new();
        mock.add_device(DeviceAttr {
            name: "mock0".into(),
            fw_ver: "1.0.0".into(),
            phys_port_cnt: 1,
            max_qp_wr: 1024,
            max_qp_rd_atom: 16,
        });
        mock
    }

    pub fn add_device(&mut self, attr: DeviceAttr) {
        self.devices.push(attr);
    }

    fn alloc_id(&mut self) -> CmId {
        let id = CmId(self.next_id);
        self.next_id += 1;
        id
    }

    fn conn_mut(&mut self, id: CmId) -> Result<&mut MockConn> {
        self.conns
            .get_mut(&id)
            .ok_or_else(|| Error::from(ErrorKind::NotConnected))
    }

    // ---- the host side of the wire, driven by tests and demos ----

    /// A host asks for a connection; returns the CM id the request arrives on.
    pub fn connect(
        &mut self, private_data: &[u8], initiator_depth: u8, port_space: PortSpace,
    ) -> CmId {
        let id = self.alloc_id();
        self.conns.insert(id, MockConn::default());
        self.events.push_back(CmEvent {
            id,
            kind: CmEventKind::ConnectRequest(ConnectRequestData {
                initiator_depth,
                responder_resources: 0,
                port_space,
                private_data: private_data.to_vec(),
            }),
        });
        id
    }

    /// The host side of a connection goes away.
    pub fn disconnect(&mut self, id: CmId) {
        self.events.push_back(CmEvent { id, kind: CmEventKind::Disconnected, });
    }

    /// Inject an arbitrary CM event.
    pub fn push_event(&mut self, id: CmId, kind: CmEventKind) {
        self.events.push_back(CmEvent { id, kind, });
    }

    /// Register a buffer on the host side; keyed SGLs reference it through the
    /// returned address and key.
    pub fn register_host_memory(&mut self, data: Vec<u8>) -> (u64, u32) {
        let key = self.next_key;
        self.next_key += 1;
        let base = HOST_BASE + (u64::from(key) << 32);
        self.host_memory.insert(key, HostMemory { base, data, });
        (base, key)
    }

    pub fn host_memory(&self, key: u32) -> &[u8] {
        &self.host_memory[&key].data
    }

    /// The host transmits a message; it lands in the oldest posted receive
    /// work request and produces a receive completion.
    pub fn host_send(&mut self, id: CmId, payload: &[u8]) -> Result<()> {
        let conn = self.conn_mut(id)?;
        let wr = conn
            .recv_wrs
            .pop_front()
            .ok_or_else(|| Error::from(ErrorKind::WouldBlock))?;
        let capacity: u64 = wr.sg_list.iter().map(|sge| u64::from(sge.length)).sum();
        if (payload.len() as u64) > capacity {
            return Err(Error::from(ErrorKind::InvalidInput));
        }
        let mut off = 0;
        for sge in &wr.sg_list {
            if off >= payload.len() {
                break;
            }
            let n = payload.len().min(off + sge.length as usize) - off;
            if !conn.covers(sge.addr, n) {
                return Err(Error::from(ErrorKind::PermissionDenied));
            }
            copy_to_local(sge.addr, &payload[off..off + n]);
            off += n;
        }
        conn.recv_cq.push_back(WorkCompletion {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: payload.len() as u32,
        });
        Ok(())
    }

    /// Complete up to `n` outstanding send-queue work requests, in order.
    /// Returns how many were completed.
    pub fn complete_sq(&mut self, id: CmId, n: usize) -> usize {
        let Some(conn) = self.conns.get_mut(&id) else { return 0 };
        let mut done = 0;
        while done < n {
            let Some(wr) = conn.sq_pending.pop_front() else { break };
            let wc = execute_sq_op(conn, &mut self.host_memory, wr);
            conn.send_cq.push_back(wc);
            done += 1;
        }
        done
    }

    /// Complete the next outstanding send-queue work request with the given
    /// status, without moving any data.
    pub fn fail_sq(&mut self, id: CmId, status: WcStatus) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else { return false };
        let Some(wr) = conn.sq_pending.pop_front() else { return false };
        conn.send_cq.push_back(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: match wr.op {
                SendOpcode::Send => WcOpcode::Send,
                SendOpcode::RdmaRead { .. } => WcOpcode::RdmaRead,
                SendOpcode::RdmaWrite { .. } => WcOpcode::RdmaWrite,
            },
            byte_len: 0,
        });
        true
    }

    // ---- observation points ----

    pub fn has_conn(&self, id: CmId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn accepted_param(&self, id: CmId) -> Option<&ConnParam> {
        self.conns.get(&id).and_then(|conn| conn.accepted.as_ref())
    }

    pub fn rejected_data(&self, id: CmId) -> Option<&[u8]> {
        self.rejections.get(&id).map(Vec::as_slice)
    }

    /// Capsules the target has transmitted with SEND, oldest first.
    pub fn sent(&self, id: CmId) -> &[Vec<u8>] {
        self.conns.get(&id).map(|conn| conn.sent.as_slice()).unwrap_or(&[])
    }

    pub fn stats(&self, id: CmId) -> MockConnStats {
        self.conns.get(&id).map(|conn| conn.stats).unwrap_or_default()
    }

    pub fn outstanding_recvs(&self, id: CmId) -> usize {
        self.conns.get(&id).map(|conn| conn.recv_wrs.len()).unwrap_or(0)
    }

    pub fn outstanding_sq(&self, id: CmId) -> usize {
        self.conns.get(&id).map(|conn| conn.sq_pending.len()).unwrap_or(0)
    }

    pub fn registered_mrs(&self, id: CmId) -> usize {
        self.conns.get(&id).map(|conn| conn.mrs.len()).unwrap_or(0)
    }

    pub fn qp_attr(&self, id: CmId) -> Option<QpInitAttr> {
        self.conns.get(&id).and_then(|conn| conn.qp)
    }

    pub fn cq_nonblocking(&self, id: CmId) -> bool {
        self.conns.get(&id).map(|conn| conn.cq_nonblocking).unwrap_or(false)
    }

    pub fn acked_events(&self) -> usize {
        self.acked_events
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RdmaProvider for MockProvider {
    fn device_list(&self) -> Vec<DeviceAttr> {
        self.devices.clone()
    }

    fn device_attr(&self, _id: CmId) -> Result<DeviceAttr> {
        self.devices
            .first()
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::NotFound))
    }

    fn open_event_channel(&mut self) -> Result<()> {
        self.event_channel_open = true;
        Ok(())
    }

    fn listen(&mut self, _addr: SocketAddr, _backlog: i32) -> Result<CmId> {
        if !self.event_channel_open {
            return Err(Error::from(ErrorKind::NotConnected));
        }
        let id = self.alloc_id();
        self.listener = Some(id);
        Ok(id)
    }

    fn get_cm_event(&mut self) -> Result<Option<CmEvent>> {
        if !self.event_channel_open {
            return Err(Error::from(ErrorKind::NotConnected));
        }
        Ok(self.events.pop_front())
    }

    fn ack_cm_event(&mut self, _event: &CmEvent) {
        self.acked_events += 1;
    }

    fn accept(&mut self, id: CmId, param: ConnParam) -> Result<()> {
        self.conn_mut(id)?.accepted = Some(param);
        Ok(())
    }

    fn reject(&mut self, id: CmId, private_data: &[u8]) -> Result<()> {
        self.rejections.insert(id, private_data.to_vec());
        Ok(())
    }

    fn destroy_id(&mut self, id: CmId) -> Result<()> {
        if self.listener == Some(id) {
            self.listener = None;
            return Ok(());
        }
        self.conns.remove(&id);
        Ok(())
    }

    fn create_qp(&mut self, id: CmId, attr: &QpInitAttr) -> Result<()> {
        self.conn_mut(id)?.qp = Some(*attr);
        Ok(())
    }

    fn destroy_qp(&mut self, id: CmId) -> Result<()> {
        let conn = self.conn_mut(id)?;
        conn.qp = None;
        conn.recv_wrs.clear();
        conn.sq_pending.clear();
        Ok(())
    }

    fn set_cq_nonblocking(&mut self, id: CmId) -> Result<()> {
        self.conn_mut(id)?.cq_nonblocking = true;
        Ok(())
    }

    fn reg_mr(
        &mut self, id: CmId, addr: u64, len: usize, _access: AccessFlags,
    ) -> Result<MemoryRegion> {
        let key = self.next_key;
        self.next_key += 1;
        let region = MemoryRegion { lkey: key, rkey: key, };
        self.conn_mut(id)?.mrs.push(MockMr { addr, len, region, });
        Ok(region)
    }

    fn dereg_mr(&mut self, id: CmId, mr: MemoryRegion) -> Result<()> {
        let conn = self.conn_mut(id)?;
        match conn.mrs.iter().position(|m| m.region == mr) {
            Some(pos) => {
                conn.mrs.remove(pos);
                Ok(())
            }
            None => Err(Error::from(ErrorKind::NotFound)),
        }
    }

    fn post_send(&mut self, id: CmId, wr: SendWr) -> Result<()> {
        let auto = self.auto_complete;
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or_else(|| Error::from(ErrorKind::NotConnected))?;
        if conn.qp.is_none() {
            return Err(Error::from(ErrorKind::NotConnected));
        }
        if !conn.covers(wr.sge.addr, wr.sge.length as usize) {
            return Err(Error::from(ErrorKind::PermissionDenied));
        }
        match wr.op {
            SendOpcode::Send => conn.stats.sends += 1,
            SendOpcode::RdmaRead { .. } => conn.stats.rdma_reads += 1,
            SendOpcode::RdmaWrite { .. } => conn.stats.rdma_writes += 1,
        }
        if auto {
            let wc = execute_sq_op(conn, &mut self.host_memory, wr);
            conn.send_cq.push_back(wc);
        } else {
            conn.sq_pending.push_back(wr);
        }
        Ok(())
    }

    fn post_recv(&mut self, id: CmId, wr: RecvWr) -> Result<()> {
        let conn = self.conn_mut(id)?;
        conn.stats.recvs_posted += 1;
        conn.recv_wrs.push_back(wr);
        Ok(())
    }

    fn poll_send_cq(&mut self, id: CmId, max: usize) -> Result<Vec<WorkCompletion>> {
        let conn = self.conn_mut(id)?;
        let n = conn.send_cq.len().min(max);
        Ok(conn.send_cq.drain(..n).collect())
    }

    fn poll_recv_cq(&mut self, id: CmId, max: usize) -> Result<Vec<WorkCompletion>> {
        let conn = self.conn_mut(id)?;
        let n = conn.recv_cq.len().min(max);
        Ok(conn.recv_cq.drain(..n).collect())
    }
}

/// Move the bytes of one send-queue work request and build its completion.
fn execute_sq_op(
    conn: &mut MockConn, host_memory: &mut HashMap<u32, HostMemory>, wr: SendWr,
) -> WorkCompletion {
    let len = wr.sge.length as usize;
    let mut wc = WorkCompletion {
        wr_id: wr.wr_id,
        status: WcStatus::Success,
        opcode: WcOpcode::Send,
        byte_len: wr.sge.length,
    };
    match wr.op {
        SendOpcode::Send => {
            conn.sent.push(read_local(wr.sge.addr, len));
        }
        SendOpcode::RdmaRead { remote_addr, rkey } => {
            wc.opcode = WcOpcode::RdmaRead;
            match host_range(host_memory, rkey, remote_addr, len) {
                Some(range) => {
                    let bytes = host_memory[&rkey].data[range].to_vec();
                    copy_to_local(wr.sge.addr, &bytes);
                }
                None => {
                    warn!("RDMA READ outside host memory, key {rkey:#x}");
                    wc.status = WcStatus::RemoteAccessError;
                }
            }
        }
        SendOpcode::RdmaWrite { remote_addr, rkey } => {
            wc.opcode = WcOpcode::RdmaWrite;
            match host_range(host_memory, rkey, remote_addr, len) {
                Some(range) => {
                    let bytes = read_local(wr.sge.addr, len);
                    host_memory.get_mut(&rkey).unwrap().data[range].copy_from_slice(&bytes);
                }
                None => {
                    warn!("RDMA WRITE outside host memory, key {rkey:#x}");
                    wc.status = WcStatus::RemoteAccessError;
                }
            }
        }
    }
    wc
}

fn host_range(
    host_memory: &HashMap<u32, HostMemory>, rkey: u32, remote_addr: u64, len: usize,
) -> Option<std::ops::Range<usize>> {
    let mem = host_memory.get(&rkey)?;
    let start = remote_addr.checked_sub(mem.base)? as usize;
    let end = start.checked_add(len)?;
    (end <= mem.data.len()).then_some(start..end)
}

fn copy_to_local(addr: u64, data: &[u8]) {
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    }
}

fn read_local(addr: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    unsafe {
        ptr::copy_nonoverlapping(addr as *const u8, data.as_mut_ptr(), len);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PinnedBuffer, QpCap, QpType, Sge};

    fn connected_mock() -> (MockProvider, CmId) {
        let mut mock = MockProvider::with_device();
        mock.open_event_channel().unwrap();
        let id = mock.connect(&[], 4, PortSpace::Ib);
        mock.create_qp(
            id,
            &QpInitAttr {
                qp_type: QpType::ReliableConnected,
                cap: QpCap {
                    max_send_wr: 8,
                    max_recv_wr: 4,
                    max_send_sge: 1,
                    max_recv_sge: 2,
                    max_inline_data: 0,
                },
            },
        )
        .unwrap();
        (mock, id)
    }

    #[test]
    fn connect_event_flow() {
        let mut mock = MockProvider::with_device();
        mock.open_event_channel().unwrap();
        let id = mock.connect(&[1, 2, 3], 7, PortSpace::Tcp);
        let event = mock.get_cm_event().unwrap().unwrap();
        assert_eq!(event.id, id);
        match &event.kind {
            CmEventKind::ConnectRequest(request) => {
                assert_eq!(request.initiator_depth, 7);
                assert_eq!(request.private_data, vec![1, 2, 3]);
                assert_eq!(request.port_space, PortSpace::Tcp);
            }
            other => panic!("unexpected event {other:?}"),
        }
        mock.ack_cm_event(&event);
        assert_eq!(mock.acked_events(), 1);
        assert!(mock.get_cm_event().unwrap().is_none());
    }

    #[test]
    fn recv_scatters_across_two_segments() {
        let (mut mock, id) = connected_mock();
        let buf = PinnedBuffer::new(4096, 4096).unwrap();
        let mr = mock
            .reg_mr(id, buf.addr(), buf.len(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        mock.post_recv(
            id,
            RecvWr {
                wr_id: 9,
                sg_list: vec![
                    Sge { addr: buf.addr(), length: 4, lkey: mr.lkey, },
                    Sge { addr: buf.addr() + 4, length: 8, lkey: mr.lkey, },
                ],
            },
        )
        .unwrap();
        mock.host_send(id, &[0xaa; 6]).unwrap();
        let wcs = mock.poll_recv_cq(id, 16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 9);
        assert_eq!(wcs[0].byte_len, 6);
        assert_eq!(&buf.as_slice()[..6], &[0xaa; 6]);
        assert_eq!(buf.as_slice()[6], 0);
    }

    #[test]
    fn rdma_read_and_write_move_data() {
        let (mut mock, id) = connected_mock();
        let mut buf = PinnedBuffer::new(4096, 4096).unwrap();
        let mr = mock
            .reg_mr(id, buf.addr(), buf.len(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let (host_addr, rkey) = mock.register_host_memory(vec![0x5a; 64]);

        mock.post_send(
            id,
            SendWr {
                wr_id: 1,
                sge: Sge { addr: buf.addr(), length: 64, lkey: mr.lkey, },
                op: SendOpcode::RdmaRead { remote_addr: host_addr, rkey, },
            },
        )
        .unwrap();
        let wcs = mock.poll_send_cq(id, 16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].opcode, WcOpcode::RdmaRead);
        assert!(wcs[0].is_valid());
        assert_eq!(&buf.as_slice()[..64], &[0x5a; 64]);

        buf.as_mut_slice()[..32].fill(0x11);
        mock.post_send(
            id,
            SendWr {
                wr_id: 2,
                sge: Sge { addr: buf.addr(), length: 32, lkey: mr.lkey, },
                op: SendOpcode::RdmaWrite { remote_addr: host_addr + 32, rkey, },
            },
        )
        .unwrap();
        mock.poll_send_cq(id, 16).unwrap();
        assert_eq!(&mock.host_memory(rkey)[32..64], &[0x11; 32]);
    }

    #[test]
    fn manual_completion_stepping() {
        let (mut mock, id) = connected_mock();
        mock.auto_complete = false;
        let buf = PinnedBuffer::new(4096, 4096).unwrap();
        let mr = mock
            .reg_mr(id, buf.addr(), buf.len(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        for wr_id in 0..3 {
            mock.post_send(
                id,
                SendWr {
                    wr_id,
                    sge: Sge { addr: buf.addr(), length: 16, lkey: mr.lkey, },
                    op: SendOpcode::Send,
                },
            )
            .unwrap();
        }
        assert_eq!(mock.outstanding_sq(id), 3);
        assert!(mock.poll_send_cq(id, 16).unwrap().is_empty());
        assert_eq!(mock.complete_sq(id, 2), 2);
        let wcs = mock.poll_send_cq(id, 16).unwrap();
        assert_eq!(wcs.len(), 2);
        assert_eq!(wcs[0].wr_id, 0);
        assert_eq!(wcs[1].wr_id, 1);
        assert_eq!(mock.sent(id).len(), 2);
    }
}
