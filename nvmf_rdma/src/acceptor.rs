//! This module consists of the connection-management side of the transport:
//! polling the CM event channel, negotiating and accepting connection
//! requests, handling disconnects, and driving connections that have not yet
//! processed their first capsule.

use std::io::Result;
use std::mem::size_of;

use nvme_fabrics::{
    GenericStatusCode, RdmaAcceptPrivateData, RdmaRejectPrivateData, RdmaRequestPrivateData,
};
use rdma_core::{CmEventKind, CmId, ConnParam, ConnectRequestData, PortSpace};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::connection::RdmaConn;
use crate::request::NvmfBackend;
use crate::RdmaTransport;

const LISTEN_BACKLOG: i32 = 10;

impl RdmaTransport {
    /// Create the CM event channel, bind the listener and start listening.
    ///
    /// Without a usable RDMA device the acceptor stays inert.
    pub fn acceptor_init(&mut self, addr: std::net::SocketAddr) -> Result<()> {
        if self.num_devices == 0 {
            warn!("no RDMA devices available, the acceptor is inert");
            return Ok(());
        }
        let listener = {
            let mut provider = self.provider.borrow_mut();
            provider.open_event_channel()?;
            provider.listen(addr, LISTEN_BACKLOG)?
        };
        self.listener = Some(listener);
        info!("listening for NVMe-oF hosts on {addr}");
        Ok(())
    }

    /// Tear the acceptor down: destroy every pending connection and the
    /// listener.
    pub fn acceptor_fini(&mut self) {
        for mut conn in self.pending.drain(..) {
            conn.destroy();
        }
        if let Some(listener) = self.listener.take() {
            if let Err(e) = self.provider.borrow_mut().destroy_id(listener) {
                warn!("failed to destroy the listener: {e}");
            }
        }
    }

    /// Poll the CM event channel and give every pending connection one turn.
    ///
    /// Connections that processed their first capsule (the NVMe-oF CONNECT)
    /// are returned to the caller, which binds them to their session.
    /// Disconnects of connections already handed out are reported through
    /// `on_disconnect`; the owning executor runs the actual teardown.
    pub fn acceptor_poll(
        &mut self, backend: &mut dyn NvmfBackend, on_disconnect: &mut dyn FnMut(CmId),
    ) -> Result<Vec<RdmaConn>> {
        if self.listener.is_none() {
            return Ok(Vec::new());
        }

        loop {
            let event = self.provider.borrow_mut().get_cm_event()?;
            let Some(event) = event else { break };
            match &event.kind {
                CmEventKind::ConnectRequest(request) => {
                    let request = request.clone();
                    self.provider.borrow_mut().ack_cm_event(&event);
                    self.handle_connect_request(event.id, &request);
                }
                CmEventKind::Disconnected
                | CmEventKind::AddressChange
                | CmEventKind::DeviceRemoval
                | CmEventKind::TimewaitExit => {
                    // ack before any teardown touches the id
                    self.provider.borrow_mut().ack_cm_event(&event);
                    self.handle_disconnect(event.id, on_disconnect);
                }
                other => {
                    self.provider.borrow_mut().ack_cm_event(&event);
                    debug!("ignoring CM event {other:?} on {:?}", event.id);
                }
            }
        }

        let mut matured = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].poll(None, backend) {
                Ok(invoked) if invoked > 0 => matured.push(self.pending.remove(i)),
                Ok(_) => i += 1,
                Err(e) => {
                    error!("pending connection {:?} failed: {e}", self.pending[i].cm_id());
                    let mut conn = self.pending.remove(i);
                    conn.destroy();
                }
            }
        }
        Ok(matured)
    }

    fn handle_connect_request(&mut self, id: CmId, request: &ConnectRequestData) {
        if let Err(e) = self.try_accept(id, request) {
            warn!("rejecting connection request {id:?}: {e}");
            let mut reject = RdmaRejectPrivateData::new_zeroed();
            reject.sts.set(GenericStatusCode::InternalDeviceError as u16);
            let mut provider = self.provider.borrow_mut();
            if let Err(e) = provider.reject(id, reject.as_bytes()) {
                warn!("failed to reject {id:?}: {e}");
            }
            if let Err(e) = provider.destroy_id(id) {
                warn!("failed to destroy CM id {id:?}: {e}");
            }
        }
    }

    /// Negotiate the queue and RDMA READ/WRITE depths, create the connection
    /// and accept.
    fn try_accept(&mut self, id: CmId, request: &ConnectRequestData) -> Result<()> {
        let device = self.provider.borrow().device_attr(id)?;

        let mut max_queue_depth = u32::from(self.opts.max_queue_depth).min(device.max_qp_wr);
        let mut max_rw_depth = u32::from(self.opts.max_queue_depth)
            .min(u32::from(device.max_qp_rd_atom))
            .min(u32::from(request.initiator_depth));
        if let Some((data, _)) = LayoutVerified::<&[u8], RdmaRequestPrivateData>::new_from_prefix(
            request.private_data.as_slice(),
        ) {
            let data = data.into_ref();
            max_queue_depth = max_queue_depth
                .min(u32::from(data.hrqsize.get()))
                .min(u32::from(data.hsqsize.get()));
        } else if !request.private_data.is_empty() {
            debug!(
                "connection request {id:?} carries {} bytes of private data, expected {}",
                request.private_data.len(),
                size_of::<RdmaRequestPrivateData>(),
            );
        }
        info!(
            "connection request {id:?}: queue depth {max_queue_depth}, rw depth {max_rw_depth}",
        );

        let mut conn = RdmaConn::new(
            self.provider.clone(), id, max_queue_depth as u16, max_rw_depth as u16, &self.opts,
        )?;

        let mut accept = RdmaAcceptPrivateData::new_zeroed();
        accept.crqsize.set(max_queue_depth as u16);
        let mut param = ConnParam {
            rnr_retry_count: 7,
            private_data: accept.as_bytes().to_vec(),
            ..Default::default()
        };
        if request.port_space == PortSpace::Tcp {
            // The target never reads from the host side.
            param.responder_resources = 0;
            param.initiator_depth = max_rw_depth as u8;
        }
        if let Err(e) = self.provider.borrow_mut().accept(id, param) {
            conn.destroy();
            return Err(e);
        }
        self.pending.push(conn);
        Ok(())
    }

    fn handle_disconnect(&mut self, id: CmId, on_disconnect: &mut dyn FnMut(CmId)) {
        if let Some(pos) = self.pending.iter().position(|conn| conn.cm_id() == id) {
            debug!("disconnect for pending connection {id:?}");
            let mut conn = self.pending.remove(pos);
            conn.destroy();
        } else {
            // The connection belongs to a session on another executor; hand
            // the teardown over.
            on_disconnect(id);
        }
    }
}
