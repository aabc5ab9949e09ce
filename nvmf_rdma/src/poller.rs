//! This module consists of the per-connection poll function that harvests
//! both completion queues and feeds the request state machine.

use std::io::{Error, ErrorKind, Result};

use rdma_core::WcOpcode;

use crate::connection::RdmaConn;
use crate::request::NvmfBackend;
use crate::session::Session;

/// Completions harvested per poll call.
const MAX_WC_PER_POLL: usize = 32;

impl RdmaConn {
    /// Drive the connection for one turn: drain the send completion queue,
    /// then harvest receives while queue depth allows.
    ///
    /// Returns the number of backend invocations. An error is fatal to the
    /// connection; the caller destroys it.
    pub(crate) fn poll(
        &mut self, mut session: Option<&mut Session>, backend: &mut dyn NvmfBackend,
    ) -> Result<u32> {
        let mut invoked = 0;

        // Another connection of the session may have freed the chunk or
        // credit a queued slot waits for.
        invoked += self.drain_pending(session.as_deref_mut(), backend)?;

        loop {
            let wcs = {
                let cm_id = self.cm_id();
                self.provider().borrow_mut().poll_send_cq(cm_id, MAX_WC_PER_POLL)?
            };
            if wcs.is_empty() {
                break;
            }
            for wc in wcs {
                if let Some(status) = wc.error() {
                    error!(
                        "send-side work completion failed on {:?}: {status:?}", self.cm_id(),
                    );
                    return Err(Error::from(ErrorKind::Other));
                }
                let idx = self.slot_of(wc.wr_id)?;
                match wc.opcode {
                    WcOpcode::Send => self.ack_completion(idx)?,
                    WcOpcode::RdmaWrite => {
                        self.rw_credit_release()?;
                        self.send_completion(idx, session.as_deref_mut())?;
                        invoked += self.drain_pending(session.as_deref_mut(), backend)?;
                    }
                    WcOpcode::RdmaRead => {
                        self.rw_credit_release()?;
                        invoked += self.execute_backend(idx, session.as_deref_mut(), backend)?;
                        invoked += self.drain_pending(session.as_deref_mut(), backend)?;
                    }
                    WcOpcode::Recv => {
                        error!("receive completion on the send queue of {:?}", self.cm_id());
                        return Err(Error::from(ErrorKind::InvalidData));
                    }
                }
            }
        }

        while self.cur_queue_depth < self.max_queue_depth() {
            let headroom =
                usize::from(self.max_queue_depth() - self.cur_queue_depth).min(MAX_WC_PER_POLL);
            let wcs = {
                let cm_id = self.cm_id();
                self.provider().borrow_mut().poll_recv_cq(cm_id, headroom)?
            };
            if wcs.is_empty() {
                break;
            }
            for wc in wcs {
                if let Some(status) = wc.error() {
                    error!(
                        "receive work completion failed on {:?}: {status:?}", self.cm_id(),
                    );
                    return Err(Error::from(ErrorKind::Other));
                }
                if wc.opcode != WcOpcode::Recv {
                    error!("{:?} completion on the receive queue of {:?}", wc.opcode, self.cm_id());
                    return Err(Error::from(ErrorKind::InvalidData));
                }
                let idx = self.slot_of(wc.wr_id)?;
                invoked += self.handle_recv(idx, wc.byte_len, session.as_deref_mut(), backend)?;
            }
            // A completion in the batch may have freed a chunk some queued
            // slot is waiting for.
            invoked += self.drain_pending(session.as_deref_mut(), backend)?;
        }

        Ok(invoked)
    }
}
