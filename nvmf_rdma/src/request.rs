//! The per-slot request state machine: capsule preparation from SGL
//! descriptors, host/target data transfers, completion sends, and the pending
//! queues that express buffer and RDMA READ/WRITE flow control.

use std::io::{Error, ErrorKind, Result};

use nvme_fabrics::{
    DataTransfer, GenericStatusCode, NvmeCmd, NvmeCpl, SglSubtype, SglType, StatusCodeType,
    CAPSULE_RSP_SIZE,
};
use rdma_core::{CmId, SendOpcode, SendWr, Sge};

use crate::connection::RdmaConn;
use crate::session::{DataBuf, Session};

/// Where a request slot is in its life cycle.
///
/// A slot that is not `Posted` is uniquely identified by its work-request
/// cookie, which is the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Receive posted, waiting for a capsule.
    Posted,
    /// Waiting on `pending_data_buf_queue` for a session pool chunk.
    NeedBuffer,
    /// Waiting on `pending_rdma_rw_queue` for an RDMA READ/WRITE credit.
    PendingTransfer,
    /// RDMA READ or WRITE posted.
    Transferring,
    /// Handed to the backend.
    Executing,
    /// Completion SEND posted, waiting for its acknowledgement.
    Completing,
}

/// One request slot. Owned by its connection for the connection's lifetime;
/// borrows either the slot's in-capsule buffer or a session pool chunk.
pub(crate) struct RdmaRequest {
    pub(crate) idx: u16,
    pub(crate) state: SlotState,
    pub(crate) xfer: DataTransfer,
    pub(crate) data_addr: u64,
    pub(crate) data_lkey: u32,
    pub(crate) length: u32,
    pub(crate) pool_buf: Option<DataBuf>,
    pub(crate) remote_addr: u64,
    pub(crate) rkey: u32,
}

impl RdmaRequest {
    pub(crate) fn new(idx: u16) -> Self {
        Self {
            idx,
            state: SlotState::Posted,
            xfer: DataTransfer::None,
            data_addr: 0,
            data_lkey: 0,
            length: 0,
            pool_buf: None,
            remote_addr: 0,
            rkey: 0,
        }
    }

    fn reset_data(&mut self) {
        self.xfer = DataTransfer::None;
        self.data_addr = 0;
        self.data_lkey = 0;
        self.length = 0;
        self.remote_addr = 0;
        self.rkey = 0;
    }
}

/// How the backend reports the outcome of `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendDisposition {
    /// The response is filled in; the transport finishes the request now.
    Complete,
    /// The backend keeps the request and finishes it later through
    /// [`RdmaTransport::req_complete`](crate::RdmaTransport::req_complete).
    Pending,
}

/// The prepared request as the backend sees it.
pub struct NvmfRequest<'a> {
    pub conn: CmId,
    pub slot: u16,
    pub cmd: &'a NvmeCmd,
    pub rsp: &'a mut NvmeCpl,
    /// Transfer payload: already host-filled for host-to-controller requests,
    /// to be filled by the backend for controller-to-host ones. Empty when the
    /// command moves no data.
    pub data: &'a mut [u8],
    pub xfer: DataTransfer,
}

/// The command execution layer above the transport.
pub trait NvmfBackend {
    fn execute(&mut self, req: NvmfRequest<'_>) -> BackendDisposition;
}

pub(crate) enum PrepOutcome {
    Ready,
    PendingBuffer,
    PendingData,
    Error(GenericStatusCode),
}

impl RdmaConn {
    /// A capsule arrived: account for it, prepare it and route it onward.
    /// Returns the number of backend invocations (0 or 1).
    pub(crate) fn handle_recv(
        &mut self, idx: u16, byte_len: u32, mut session: Option<&mut Session>,
        backend: &mut dyn NvmfBackend,
    ) -> Result<u32> {
        if (byte_len as usize) < nvme_fabrics::CAPSULE_CMD_SIZE {
            error!(
                "runt capsule of {byte_len} bytes on {:?}, slot {idx}", self.cm_id(),
            );
            return Err(Error::from(ErrorKind::InvalidData));
        }
        if self.reqs[usize::from(idx)].state != SlotState::Posted {
            error!("receive completion for busy slot {idx} on {:?}", self.cm_id());
            return Err(Error::from(ErrorKind::InvalidData));
        }
        self.cur_queue_depth += 1;

        let cid = self.cmd(idx)?.cid.get();
        let rsp = self.rsp_mut(idx)?;
        rsp.clear();
        rsp.cid.set(cid);

        match self.prep(idx, session.as_deref_mut())? {
            PrepOutcome::Ready => self.execute_backend(idx, session, backend),
            PrepOutcome::PendingBuffer => {
                trace!("slot {idx} waiting for a data buffer");
                self.reqs[usize::from(idx)].state = SlotState::NeedBuffer;
                self.pending_data_buf_queue.push_back(idx);
                Ok(0)
            }
            PrepOutcome::PendingData => {
                self.transfer_data(idx)?;
                Ok(0)
            }
            PrepOutcome::Error(sc) => {
                debug!("slot {idx} failed preparation: {sc:?}");
                self.rsp_mut(idx)?.set_status(StatusCodeType::Generic, sc as u8);
                self.request_complete(idx, session)?;
                Ok(0)
            }
        }
    }

    /// Read the command's SGL descriptor and decide how its data moves.
    fn prep(&mut self, idx: u16, session: Option<&mut Session>) -> Result<PrepOutcome> {
        let cmd = *self.cmd(idx)?;
        let max_io_size = self.max_io_size();
        let in_capsule_size = self.in_capsule_data_size();
        let in_capsule_addr = self.in_capsule_buf_addr(idx);
        let bufs_lkey = self.bufs_lkey();

        let req = &mut self.reqs[usize::from(idx)];
        req.xfer = DataTransfer::of_cmd(&cmd);
        if req.xfer == DataTransfer::None {
            return Ok(PrepOutcome::Ready);
        }

        let sgl = cmd.dptr;
        match (sgl.sgl_type(), sgl.subtype()) {
            (Some(SglType::KeyedDataBlock), Some(SglSubtype::Address))
            | (Some(SglType::KeyedDataBlock), Some(SglSubtype::InvalidateKey)) => {
                let length = sgl.keyed_length();
                if length > max_io_size {
                    return Ok(PrepOutcome::Error(GenericStatusCode::DataSglLengthInvalid));
                }
                if length == 0 {
                    req.xfer = DataTransfer::None;
                    return Ok(PrepOutcome::Ready);
                }
                req.length = length;
                req.remote_addr = sgl.address.get();
                req.rkey = sgl.key();
                if length > in_capsule_size {
                    match session.and_then(|s| s.pool.acquire()) {
                        Some(buf) => {
                            req.data_addr = buf.addr;
                            req.data_lkey = buf.lkey;
                            req.pool_buf = Some(buf);
                        }
                        None => return Ok(PrepOutcome::PendingBuffer),
                    }
                } else {
                    req.data_addr = in_capsule_addr;
                    req.data_lkey = bufs_lkey;
                }
                if req.xfer == DataTransfer::HostToController {
                    Ok(PrepOutcome::PendingData)
                } else {
                    Ok(PrepOutcome::Ready)
                }
            }
            (Some(SglType::DataBlock), Some(SglSubtype::Offset)) => {
                let offset = sgl.address.get();
                if offset > u64::from(in_capsule_size) {
                    return Ok(PrepOutcome::Error(GenericStatusCode::InvalidSglOffset));
                }
                let length = sgl.unkeyed_length();
                if length > in_capsule_size - offset as u32 {
                    return Ok(PrepOutcome::Error(GenericStatusCode::DataSglLengthInvalid));
                }
                if length == 0 {
                    req.xfer = DataTransfer::None;
                    return Ok(PrepOutcome::Ready);
                }
                req.length = length;
                req.data_addr = in_capsule_addr + offset;
                req.data_lkey = bufs_lkey;
                Ok(PrepOutcome::Ready)
            }
            _ => Ok(PrepOutcome::Error(GenericStatusCode::SglDescriptorTypeInvalid)),
        }
    }

    /// Post the RDMA READ (host-to-controller) or WRITE (controller-to-host)
    /// of a slot, or queue the slot if the RDMA READ/WRITE credits are
    /// exhausted.
    pub(crate) fn transfer_data(&mut self, idx: u16) -> Result<()> {
        if self.cur_rdma_rw_depth == self.max_rw_depth() {
            trace!("slot {idx} waiting for an RDMA READ/WRITE credit");
            self.reqs[usize::from(idx)].state = SlotState::PendingTransfer;
            self.pending_rdma_rw_queue.push_back(idx);
            return Ok(());
        }
        let req = &self.reqs[usize::from(idx)];
        let op = match req.xfer {
            DataTransfer::HostToController => SendOpcode::RdmaRead {
                remote_addr: req.remote_addr,
                rkey: req.rkey,
            },
            DataTransfer::ControllerToHost => SendOpcode::RdmaWrite {
                remote_addr: req.remote_addr,
                rkey: req.rkey,
            },
            _ => {
                error!("slot {idx} has no transfer direction");
                return Err(Error::from(ErrorKind::InvalidInput));
            }
        };
        let wr = SendWr {
            wr_id: u64::from(req.idx),
            sge: Sge { addr: req.data_addr, length: req.length, lkey: req.data_lkey, },
            op,
        };
        let cm_id = self.cm_id();
        self.provider().borrow_mut().post_send(cm_id, wr)?;
        self.cur_rdma_rw_depth += 1;
        self.reqs[usize::from(idx)].state = SlotState::Transferring;
        Ok(())
    }

    /// Hand a prepared request to the backend. Returns 1, the number of
    /// backend invocations.
    pub(crate) fn execute_backend(
        &mut self, idx: u16, session: Option<&mut Session>, backend: &mut dyn NvmfBackend,
    ) -> Result<u32> {
        let i = usize::from(idx);
        self.reqs[i].state = SlotState::Executing;
        let (data_addr, length, xfer) = {
            let req = &self.reqs[i];
            (req.data_addr, req.length, req.xfer)
        };
        let conn = self.cm_id();
        let disposition = {
            // The payload lives in pinned memory (the slot's in-capsule
            // buffer or a session pool chunk) that only this request may
            // touch while it executes.
            let data: &mut [u8] = if data_addr == 0 || length == 0 {
                &mut []
            } else {
                unsafe {
                    core::slice::from_raw_parts_mut(data_addr as *mut u8, length as usize)
                }
            };
            let cmd = self.cmd(idx)?;
            let rsp = unsafe { &mut *(self.cpl_addr(idx) as *mut NvmeCpl) };
            backend.execute(NvmfRequest { conn, slot: idx, cmd, rsp, data, xfer, })
        };
        match disposition {
            BackendDisposition::Complete => self.request_complete(idx, session)?,
            BackendDisposition::Pending => {}
        }
        Ok(1)
    }

    /// The backend finished a request: write data back to the host if there
    /// is any, otherwise send the completion.
    pub(crate) fn request_complete(
        &mut self, idx: u16, session: Option<&mut Session>,
    ) -> Result<()> {
        let success = self.rsp(idx)?.is_success();
        let req = &self.reqs[usize::from(idx)];
        if req.xfer == DataTransfer::ControllerToHost && success && req.length > 0 {
            self.transfer_data(idx)
        } else {
            self.send_completion(idx, session)
        }
    }

    /// Return any pool chunk, advance the submission queue head, stamp it
    /// into the completion capsule, re-post the slot's RECV and post the SEND
    /// of the completion.
    pub(crate) fn send_completion(
        &mut self, idx: u16, session: Option<&mut Session>,
    ) -> Result<()> {
        let i = usize::from(idx);
        if let Some(buf) = self.reqs[i].pool_buf.take() {
            match session {
                Some(session) => session.pool.release(buf),
                None => warn!(
                    "slot {idx} on {:?} held a pool chunk but no session was given", self.cm_id(),
                ),
            }
        }
        self.advance_sq_head();
        let sq_head = self.sq_head();
        self.rsp_mut(idx)?.sqhd.set(sq_head);
        self.reqs[i].reset_data();
        self.post_slot_recv(idx)?;
        let wr = SendWr {
            wr_id: u64::from(idx),
            sge: Sge {
                addr: self.cpl_addr(idx),
                length: CAPSULE_RSP_SIZE as u32,
                lkey: self.cpls_lkey(),
            },
            op: SendOpcode::Send,
        };
        let cm_id = self.cm_id();
        self.provider().borrow_mut().post_send(cm_id, wr)?;
        self.reqs[i].state = SlotState::Completing;
        Ok(())
    }

    /// The completion SEND was acknowledged: advance the submission queue
    /// head a second time and retire the request.
    ///
    /// The second advance matches what hosts expect from this transport on
    /// the wire.
    pub(crate) fn ack_completion(&mut self, idx: u16) -> Result<()> {
        let i = usize::from(idx);
        if self.reqs[i].state != SlotState::Completing {
            error!("send completion for idle slot {idx} on {:?}", self.cm_id());
            return Err(Error::from(ErrorKind::InvalidData));
        }
        if self.cur_queue_depth == 0 {
            error!("queue depth underflow on {:?}", self.cm_id());
            return Err(Error::from(ErrorKind::InvalidData));
        }
        self.advance_sq_head();
        self.cur_queue_depth -= 1;
        self.reqs[i].state = SlotState::Posted;
        Ok(())
    }

    /// An RDMA READ or WRITE completed; give its credit back.
    pub(crate) fn rw_credit_release(&mut self) -> Result<()> {
        if self.cur_rdma_rw_depth == 0 {
            error!("RDMA READ/WRITE depth underflow on {:?}", self.cm_id());
            return Err(Error::from(ErrorKind::InvalidData));
        }
        self.cur_rdma_rw_depth -= 1;
        Ok(())
    }

    /// Resume queued slots after a buffer or credit became free: first match
    /// freed pool chunks with buffer-starved slots, then post transfers while
    /// RDMA READ/WRITE credits remain.
    pub(crate) fn drain_pending(
        &mut self, mut session: Option<&mut Session>, backend: &mut dyn NvmfBackend,
    ) -> Result<u32> {
        let mut invoked = 0;
        while !self.pending_data_buf_queue.is_empty() {
            let Some(buf) = session.as_deref_mut().and_then(|s| s.pool.acquire()) else {
                break;
            };
            let idx = self.pending_data_buf_queue.pop_front().unwrap();
            let host_to_controller = {
                let req = &mut self.reqs[usize::from(idx)];
                req.data_addr = buf.addr;
                req.data_lkey = buf.lkey;
                req.pool_buf = Some(buf);
                req.xfer == DataTransfer::HostToController
            };
            if host_to_controller {
                self.reqs[usize::from(idx)].state = SlotState::PendingTransfer;
                self.pending_rdma_rw_queue.push_back(idx);
            } else {
                invoked += self.execute_backend(idx, session.as_deref_mut(), backend)?;
            }
        }
        while self.cur_rdma_rw_depth < self.max_rw_depth() {
            let Some(idx) = self.pending_rdma_rw_queue.pop_front() else { break };
            self.transfer_data(idx)?;
        }
        Ok(invoked)
    }

    /// Drop a request without sending a response: return its chunk, re-post
    /// its RECV and retire it.
    pub(crate) fn release_request(
        &mut self, idx: u16, session: Option<&mut Session>,
    ) -> Result<()> {
        let i = usize::from(idx);
        if let Some(buf) = self.reqs[i].pool_buf.take() {
            if let Some(session) = session {
                session.pool.release(buf);
            }
        }
        if self.cur_queue_depth == 0 {
            return Err(Error::from(ErrorKind::InvalidData));
        }
        self.reqs[i].reset_data();
        self.post_slot_recv(idx)?;
        self.cur_queue_depth -= 1;
        self.reqs[i].state = SlotState::Posted;
        Ok(())
    }
}
