//! RDMA transport for an NVMe-over-Fabrics target.
//!
//! Hosts connect through the RDMA connection manager; each connection carries
//! NVMe command capsules over a reliable-connection queue pair. The transport
//! negotiates per-queue resources, receives capsules, moves request payloads
//! with RDMA READ/WRITE, hands prepared requests to a [`NvmfBackend`] and
//! returns completion capsules.
//!
//! Everything runs on poll-driven, single-executor cooperative scheduling:
//! nothing here blocks, and waits are expressed by parking a request slot on
//! a pending queue until the next poll turn finds a free credit or buffer.

#[macro_use] extern crate log;

mod acceptor;
mod connection;
mod poller;
mod request;
mod session;

use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;

use nvme_fabrics::{
    set_discovery_str, DiscoveryLogEntry, RdmaCms, RdmaProviderType, RdmaQpServiceType,
    TransportRequirements, TransportType,
};
use rdma_core::{CmId, SharedProvider};

pub use crate::connection::RdmaConn;
pub use crate::request::{BackendDisposition, NvmfBackend, NvmfRequest, SlotState};
pub use crate::session::Session;

/// Target-wide defaults; the per-connection values are negotiated down from
/// these at CONNECT time.
#[derive(Debug, Clone)]
pub struct TransportOpts {
    pub max_queue_depth: u16,
    pub max_io_size: u32,
    pub in_capsule_data_size: u32,
}

impl Default for TransportOpts {
    fn default() -> Self {
        Self {
            max_queue_depth: 128,
            max_io_size: 131072,
            in_capsule_data_size: 4096,
        }
    }
}

/// The transport context: the provider, the negotiated defaults, the listener
/// and the connections that have not yet processed their NVMe-oF CONNECT.
pub struct RdmaTransport {
    pub(crate) provider: SharedProvider,
    pub(crate) opts: TransportOpts,
    pub(crate) num_devices: usize,
    pub(crate) listener: Option<CmId>,
    pub(crate) pending: Vec<RdmaConn>,
}

impl RdmaTransport {
    /// Enumerate the RDMA devices, log their capabilities and record the
    /// defaults. With zero usable devices the acceptor stays inert.
    pub fn init(provider: SharedProvider, opts: TransportOpts) -> Self {
        let devices = provider.borrow().device_list();
        for device in &devices {
            info!(
                "found RDMA device '{}': fw {}, {} port(s), max_qp_wr {}, max_qp_rd_atom {}",
                device.name, device.fw_ver, device.phys_port_cnt, device.max_qp_wr,
                device.max_qp_rd_atom,
            );
        }
        if devices.is_empty() {
            warn!("no usable RDMA devices found");
        }
        Self {
            provider,
            opts,
            num_devices: devices.len(),
            listener: None,
            pending: Vec::new(),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    pub fn opts(&self) -> &TransportOpts {
        &self.opts
    }

    /// Nothing to tear down at the transport level; the acceptor is shut down
    /// separately through [`acceptor_fini`](Self::acceptor_fini).
    pub fn fini(self) {}

    /// First connection of a session: set up the session's data buffer pool
    /// on that connection's device.
    pub fn session_init(&self, conn: &RdmaConn) -> Result<Session> {
        Session::new(self.provider.clone(), conn, &self.opts)
    }

    pub fn session_fini(&self, mut session: Session) {
        session.destroy();
    }

    /// Drive one connection for one turn. Returns the number of backend
    /// invocations; on error the connection is unusable and must be passed to
    /// [`conn_fini`](Self::conn_fini).
    pub fn conn_poll(
        &self, conn: &mut RdmaConn, session: Option<&mut Session>,
        backend: &mut dyn NvmfBackend,
    ) -> Result<u32> {
        conn.poll(session, backend)
    }

    pub fn conn_fini(&self, mut conn: RdmaConn) {
        conn.destroy();
    }

    /// Finish a request the backend reported as pending. The slot must still
    /// be executing.
    pub fn req_complete(
        &self, conn: &mut RdmaConn, mut session: Option<&mut Session>,
        backend: &mut dyn NvmfBackend, slot: u16,
    ) -> Result<()> {
        if conn.slot_state(slot) != Some(SlotState::Executing) {
            return Err(Error::from(ErrorKind::InvalidInput));
        }
        conn.request_complete(slot, session.as_deref_mut())?;
        conn.drain_pending(session, backend)?;
        Ok(())
    }

    /// Abandon a request without sending a completion.
    pub fn req_release(
        &self, conn: &mut RdmaConn, session: Option<&mut Session>, slot: u16,
    ) -> Result<()> {
        if conn.slot_state(slot).is_none() {
            return Err(Error::from(ErrorKind::InvalidInput));
        }
        conn.release_request(slot, session)
    }

    /// Describe a listening address as a discovery log entry.
    pub fn listen_addr_discover(addr: &SocketAddr, entry: &mut DiscoveryLogEntry) {
        entry.trtype = TransportType::Rdma as u8;
        entry.adrfam = nvme_fabrics::AddressFamily::Ipv4 as u8;
        entry.treq = TransportRequirements::NotSpecified as u8;
        set_discovery_str(&mut entry.trsvcid, &addr.port().to_string());
        set_discovery_str(&mut entry.traddr, &addr.ip().to_string());
        entry.tsas.qptype = RdmaQpServiceType::ReliableConnected as u8;
        entry.tsas.prtype = RdmaProviderType::None as u8;
        entry.tsas.cms = RdmaCms::RdmaCm as u8;
    }
}
