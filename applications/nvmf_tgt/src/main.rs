//! Runs the NVMe-oF RDMA transport end to end against the in-process mock
//! provider and a RAM-disk backend: a scripted host connects, issues an
//! in-capsule write, a large write (RDMA READ) and a large read (RDMA WRITE),
//! and the completions are printed.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::process;
use std::rc::Rc;

use getopts::Options;
use log::{LevelFilter, Metadata, Record};
use nvme_fabrics::{
    DataTransfer, DiscoveryLogEntry, FabricsCommandType, GenericStatusCode, NvmeCmd, NvmeCpl,
    RdmaRequestPrivateData, SglDescriptor, SglSubtype, StatusCodeType, OPC_FABRIC,
};
use nvmf_rdma::{
    BackendDisposition, NvmfBackend, NvmfRequest, RdmaTransport, TransportOpts,
};
use rdma_core::mock::MockProvider;
use rdma_core::PortSpace;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

const OPC_WRITE: u8 = 0x01;
const OPC_READ: u8 = 0x02;
const BLOCK_SIZE: usize = 512;

struct StdoutLogger;

impl log::Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

/// A RAM disk that answers fabrics commands inline.
struct RamBackend {
    disk: Vec<u8>,
}

impl RamBackend {
    fn new(size: usize) -> Self {
        Self { disk: vec![0; size] }
    }

    fn block_range(&self, cmd: &NvmeCmd, len: usize) -> Option<std::ops::Range<usize>> {
        let slba = u64::from(cmd.cdw10.get()) | u64::from(cmd.cdw11.get()) << 32;
        let start = usize::try_from(slba).ok()?.checked_mul(BLOCK_SIZE)?;
        let end = start.checked_add(len)?;
        (end <= self.disk.len()).then_some(start..end)
    }
}

impl NvmfBackend for RamBackend {
    fn execute(&mut self, req: NvmfRequest<'_>) -> BackendDisposition {
        match req.cmd.opc {
            OPC_FABRIC => match FabricsCommandType::from_repr(req.cmd.fctype()) {
                Some(FabricsCommandType::Connect) => {
                    log::info!("host CONNECT, {} bytes of connect data", req.data.len());
                }
                Some(other) => log::info!("fabrics command {other:?}"),
                None => req.rsp.set_status(
                    StatusCodeType::Generic, GenericStatusCode::InvalidField as u8,
                ),
            },
            OPC_WRITE if req.xfer == DataTransfer::HostToController => {
                match self.block_range(req.cmd, req.data.len()) {
                    Some(range) => self.disk[range].copy_from_slice(req.data),
                    None => req.rsp.set_status(
                        StatusCodeType::Generic, GenericStatusCode::InvalidField as u8,
                    ),
                }
            }
            OPC_READ if req.xfer == DataTransfer::ControllerToHost => {
                match self.block_range(req.cmd, req.data.len()) {
                    Some(range) => req.data.copy_from_slice(&self.disk[range]),
                    None => req.rsp.set_status(
                        StatusCodeType::Generic, GenericStatusCode::InvalidField as u8,
                    ),
                }
            }
            _ => req.rsp.set_status(
                StatusCodeType::Generic, GenericStatusCode::InvalidOpcode as u8,
            ),
        }
        BackendDisposition::Complete
    }
}

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {program} [options]");
    print!("{}", opts.usage(&brief));
}

fn capsule(cmd: &NvmeCmd, data: &[u8]) -> Vec<u8> {
    let mut bytes = cmd.as_bytes().to_vec();
    bytes.extend_from_slice(data);
    bytes
}

fn print_completion(what: &str, bytes: &[u8]) {
    let cpl = LayoutVerified::<&[u8], NvmeCpl>::new(bytes).unwrap().into_ref();
    println!(
        "{what}: cid {}, sqhd {}, status 0x{:x}",
        cpl.cid.get(), cpl.sqhd.get(), cpl.status.get(),
    );
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    let mut opts = Options::new();
    opts.optopt("q", "queue-depth", "maximum queue depth, e.g. 64", "DEPTH");
    opts.optopt("i", "io-size", "maximum I/O size in bytes, e.g. 65536", "BYTES");
    opts.optflag("v", "verbose", "log at trace level");
    opts.optflag("h", "help", "print this help menu");
    let matches = opts.parse(&args[1..]).map_err(|e| e.to_string())?;
    if matches.opt_present("h") {
        print_usage(&args[0], opts);
        process::exit(0);
    }

    log::set_logger(&LOGGER).map_err(|e| e.to_string())?;
    log::set_max_level(if matches.opt_present("v") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });
    let mut transport_opts = TransportOpts::default();
    if let Some(depth) = matches.opt_str("q") {
        transport_opts.max_queue_depth = depth.parse().map_err(|_| "bad queue depth")?;
    }
    if let Some(size) = matches.opt_str("i") {
        transport_opts.max_io_size = size.parse().map_err(|_| "bad I/O size")?;
    }

    let mock = Rc::new(RefCell::new(MockProvider::with_device()));
    let mut transport = RdmaTransport::init(mock.clone(), transport_opts);
    let addr: SocketAddr = "127.0.0.1:4420".parse().unwrap();
    transport.acceptor_init(addr).map_err(|e| e.to_string())?;

    let mut entry = DiscoveryLogEntry::new_zeroed();
    RdmaTransport::listen_addr_discover(&addr, &mut entry);
    println!(
        "discovery entry: trtype {}, adrfam {}, trsvcid '{}'",
        entry.trtype, entry.adrfam,
        String::from_utf8_lossy(&entry.trsvcid).trim_end(),
    );

    let mut backend = RamBackend::new(1 << 20);

    // the scripted host: connect with queue sizes in the private data
    let mut private_data = RdmaRequestPrivateData::new_zeroed();
    private_data.hrqsize.set(64);
    private_data.hsqsize.set(64);
    let id = mock
        .borrow_mut()
        .connect(private_data.as_bytes(), 8, PortSpace::Ib);
    transport
        .acceptor_poll(&mut backend, &mut |_| {})
        .map_err(|e| e.to_string())?;

    let mut connect = NvmeCmd::new_zeroed();
    connect.opc = OPC_FABRIC;
    connect.nsid.set(FabricsCommandType::Connect as u32);
    connect.dptr = SglDescriptor::in_capsule(0, 1024);
    mock.borrow_mut()
        .host_send(id, &capsule(&connect, &[0; 1024]))
        .map_err(|e| e.to_string())?;
    let mut matured = transport
        .acceptor_poll(&mut backend, &mut |_| {})
        .map_err(|e| e.to_string())?;
    let mut conn = matured.pop().ok_or("the CONNECT did not mature")?;
    println!(
        "connection established: queue depth {}, rw depth {}",
        conn.max_queue_depth(), conn.max_rw_depth(),
    );
    let mut session = transport.session_init(&conn).map_err(|e| e.to_string())?;

    // a small write travels inside the capsule
    let mut write = NvmeCmd::new_zeroed();
    write.opc = OPC_WRITE;
    write.cid.set(1);
    write.dptr = SglDescriptor::in_capsule(0, 512);
    mock.borrow_mut()
        .host_send(id, &capsule(&write, &[0xabu8; 512]))
        .map_err(|e| e.to_string())?;

    // a large write arrives with a keyed SGL and travels by RDMA READ
    let big = vec![0x17u8; 32768];
    let (host_addr, rkey) = mock.borrow_mut().register_host_memory(big);
    let mut write_big = NvmeCmd::new_zeroed();
    write_big.opc = OPC_WRITE;
    write_big.cid.set(2);
    write_big.cdw10.set(16); // block 16
    write_big.dptr = SglDescriptor::keyed(SglSubtype::Address, host_addr, 32768, rkey);
    mock.borrow_mut()
        .host_send(id, &capsule(&write_big, &[]))
        .map_err(|e| e.to_string())?;

    // drive the connection until both writes retired
    for _ in 0..8 {
        transport
            .conn_poll(&mut conn, Some(&mut session), &mut backend)
            .map_err(|e| e.to_string())?;
        if conn.cur_queue_depth() == 0 {
            break;
        }
    }
    if conn.cur_queue_depth() != 0 {
        return Err("write requests did not retire".into());
    }

    // now read the large block back; it returns by RDMA WRITE
    let (read_addr, read_rkey) = mock.borrow_mut().register_host_memory(vec![0u8; 32768]);
    let mut read_big = NvmeCmd::new_zeroed();
    read_big.opc = OPC_READ;
    read_big.cid.set(3);
    read_big.cdw10.set(16);
    read_big.dptr = SglDescriptor::keyed(SglSubtype::Address, read_addr, 32768, read_rkey);
    mock.borrow_mut()
        .host_send(id, &capsule(&read_big, &[]))
        .map_err(|e| e.to_string())?;
    for _ in 0..8 {
        transport
            .conn_poll(&mut conn, Some(&mut session), &mut backend)
            .map_err(|e| e.to_string())?;
        if conn.cur_queue_depth() == 0 {
            break;
        }
    }
    if conn.cur_queue_depth() != 0 {
        return Err("the read request did not retire".into());
    }

    let sent = mock.borrow().sent(id).to_vec();
    for (what, bytes) in ["CONNECT", "write 512B", "write 32KiB", "read 32KiB"]
        .iter()
        .zip(&sent)
    {
        print_completion(what, bytes);
    }
    let read_back = mock.borrow().host_memory(read_rkey).to_vec();
    if read_back != vec![0x17u8; 32768] {
        return Err("read data does not match what was written".into());
    }
    println!("32 KiB round trip verified");
    let stats = mock.borrow().stats(id);
    println!(
        "transport ops: {} sends, {} RDMA reads, {} RDMA writes, pool {}/{} free",
        stats.sends, stats.rdma_reads, stats.rdma_writes,
        session.pool_available(), session.pool_total(),
    );

    transport.session_fini(session);
    transport.conn_fini(conn);
    transport.acceptor_fini();
    transport.fini();
    Ok(())
}
