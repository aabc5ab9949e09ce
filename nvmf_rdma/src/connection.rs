//! This module consists of functions that create, work with and destroy the
//! per-connection RDMA resources: the queue pair, the pinned capsule and
//! in-capsule data arrays with their memory regions, the request slots and
//! the two flow-control counters.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};

use nvme_fabrics::{NvmeCmd, NvmeCpl, CAPSULE_CMD_SIZE, CAPSULE_RSP_SIZE};
use rdma_core::{
    AccessFlags, CmId, MemoryRegion, PinnedBuffer, QpCap, QpInitAttr, QpType, RecvWr, Sge,
    SharedProvider,
};

use crate::request::{RdmaRequest, SlotState};
use crate::TransportOpts;

/// Alignment of the pinned capsule and data arrays.
const ARRAY_ALIGN: usize = 4096;

/// One host connection: a reliable-connection queue pair plus the pinned
/// arrays every request slot points into.
///
/// `cur_queue_depth` counts requests from RECV completion until SEND
/// acknowledgement; `cur_rdma_rw_depth` counts posted RDMA READ/WRITE
/// operations that have not completed yet.
pub struct RdmaConn {
    provider: SharedProvider,
    cm_id: CmId,
    max_queue_depth: u16,
    max_rw_depth: u16,
    max_io_size: u32,
    in_capsule_data_size: u32,
    pub(crate) cur_queue_depth: u16,
    pub(crate) cur_rdma_rw_depth: u16,
    sq_head: u16,
    sq_head_max: u16,
    qp_created: bool,
    cmds: Option<PinnedBuffer>,
    cpls: Option<PinnedBuffer>,
    bufs: Option<PinnedBuffer>,
    cmds_mr: Option<MemoryRegion>,
    cpls_mr: Option<MemoryRegion>,
    bufs_mr: Option<MemoryRegion>,
    pub(crate) reqs: Vec<RdmaRequest>,
    pub(crate) pending_data_buf_queue: VecDeque<u16>,
    pub(crate) pending_rdma_rw_queue: VecDeque<u16>,
    destroyed: bool,
}

impl RdmaConn {
    /// Create a connection with the negotiated depths and bring every request
    /// slot into the posted-for-receive state.
    ///
    /// On any failure the partially constructed connection is rolled back
    /// through [`destroy`](Self::destroy).
    pub(crate) fn new(
        provider: SharedProvider, cm_id: CmId, max_queue_depth: u16, max_rw_depth: u16,
        opts: &TransportOpts,
    ) -> Result<Self> {
        let mut conn = Self {
            provider, cm_id, max_queue_depth, max_rw_depth,
            max_io_size: opts.max_io_size,
            in_capsule_data_size: opts.in_capsule_data_size,
            cur_queue_depth: 0, cur_rdma_rw_depth: 0,
            sq_head: 0, sq_head_max: max_queue_depth - 1,
            qp_created: false,
            cmds: None, cpls: None, bufs: None,
            cmds_mr: None, cpls_mr: None, bufs_mr: None,
            reqs: Vec::new(),
            pending_data_buf_queue: VecDeque::new(),
            pending_rdma_rw_queue: VecDeque::new(),
            destroyed: false,
        };
        if let Err(e) = conn.construct() {
            // roll back, but leave the CM id to the acceptor so it can still
            // send the rejection
            conn.teardown(false);
            return Err(e);
        }
        trace!(
            "created connection {:?}: queue depth {}, rw depth {}",
            conn.cm_id, conn.max_queue_depth, conn.max_rw_depth,
        );
        Ok(conn)
    }

    fn construct(&mut self) -> Result<()> {
        let depth = usize::from(self.max_queue_depth);
        if depth == 0 {
            return Err(Error::from(ErrorKind::InvalidInput));
        }

        // The send queue carries one SEND per slot plus concurrent
        // READ/WRITE work requests.
        let attr = QpInitAttr {
            qp_type: QpType::ReliableConnected,
            cap: QpCap {
                max_send_wr: 2 * u32::from(self.max_queue_depth),
                max_recv_wr: u32::from(self.max_queue_depth),
                max_send_sge: 1,
                max_recv_sge: 2,
                max_inline_data: 0,
            },
        };
        {
            let mut provider = self.provider.borrow_mut();
            provider.create_qp(self.cm_id, &attr)?;
            self.qp_created = true;
            provider.set_cq_nonblocking(self.cm_id)?;
        }

        let cmds = PinnedBuffer::new(depth * CAPSULE_CMD_SIZE, ARRAY_ALIGN)?;
        let cpls = PinnedBuffer::new(depth * CAPSULE_RSP_SIZE, ARRAY_ALIGN)?;
        let bufs = PinnedBuffer::new(depth * self.in_capsule_data_size as usize, ARRAY_ALIGN)?;
        {
            let mut provider = self.provider.borrow_mut();
            self.cmds_mr = Some(provider.reg_mr(
                self.cm_id, cmds.addr(), cmds.len(), AccessFlags::LOCAL_WRITE,
            )?);
            self.cpls_mr = Some(provider.reg_mr(
                self.cm_id, cpls.addr(), cpls.len(), AccessFlags::empty(),
            )?);
            self.bufs_mr = Some(provider.reg_mr(
                self.cm_id, bufs.addr(), bufs.len(), AccessFlags::LOCAL_WRITE,
            )?);
        }
        self.cmds = Some(cmds);
        self.cpls = Some(cpls);
        self.bufs = Some(bufs);

        self.reqs = (0..self.max_queue_depth).map(RdmaRequest::new).collect();
        for idx in 0..self.max_queue_depth {
            self.post_slot_recv(idx)?;
            self.reqs[usize::from(idx)].state = SlotState::Posted;
        }
        Ok(())
    }

    /// Post the receive work request of a slot: a two-segment scatter list of
    /// its command capsule and its in-capsule data buffer.
    pub(crate) fn post_slot_recv(&mut self, idx: u16) -> Result<()> {
        let wr = RecvWr {
            wr_id: u64::from(idx),
            sg_list: vec![
                Sge {
                    addr: self.cmd_addr(idx),
                    length: CAPSULE_CMD_SIZE as u32,
                    lkey: self.cmds_mr.unwrap().lkey,
                },
                Sge {
                    addr: self.in_capsule_buf_addr(idx),
                    length: self.in_capsule_data_size,
                    lkey: self.bufs_mr.unwrap().lkey,
                },
            ],
        };
        self.provider.borrow_mut().post_recv(self.cm_id, wr)
    }

    /// Tear the connection down. Tolerates partially-initialized state and
    /// repeated calls.
    pub(crate) fn destroy(&mut self) {
        self.teardown(true);
    }

    fn teardown(&mut self, destroy_cm_id: bool) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        trace!("destroying connection {:?}", self.cm_id);
        let mut provider = self.provider.borrow_mut();
        for mr in [self.cmds_mr.take(), self.cpls_mr.take(), self.bufs_mr.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = provider.dereg_mr(self.cm_id, mr) {
                warn!("failed to deregister a memory region of {:?}: {e}", self.cm_id);
            }
        }
        if self.qp_created {
            if let Err(e) = provider.destroy_qp(self.cm_id) {
                warn!("failed to destroy the queue pair of {:?}: {e}", self.cm_id);
            }
            self.qp_created = false;
        }
        if destroy_cm_id {
            if let Err(e) = provider.destroy_id(self.cm_id) {
                warn!("failed to destroy CM id {:?}: {e}", self.cm_id);
            }
        }
        self.cmds.take();
        self.cpls.take();
        self.bufs.take();
        self.reqs.clear();
        self.pending_data_buf_queue.clear();
        self.pending_rdma_rw_queue.clear();
    }

    pub fn cm_id(&self) -> CmId {
        self.cm_id
    }

    pub fn max_queue_depth(&self) -> u16 {
        self.max_queue_depth
    }

    pub fn max_rw_depth(&self) -> u16 {
        self.max_rw_depth
    }

    pub fn cur_queue_depth(&self) -> u16 {
        self.cur_queue_depth
    }

    pub fn cur_rdma_rw_depth(&self) -> u16 {
        self.cur_rdma_rw_depth
    }

    pub fn sq_head(&self) -> u16 {
        self.sq_head
    }

    /// Number of slots currently between RECV completion and SEND
    /// acknowledgement.
    pub fn active_slots(&self) -> usize {
        self.reqs.iter().filter(|req| req.state != SlotState::Posted).count()
    }

    pub fn slot_state(&self, idx: u16) -> Option<SlotState> {
        self.reqs.get(usize::from(idx)).map(|req| req.state)
    }

    pub fn pending_data_buf_len(&self) -> usize {
        self.pending_data_buf_queue.len()
    }

    pub fn pending_rdma_rw_len(&self) -> usize {
        self.pending_rdma_rw_queue.len()
    }

    pub(crate) fn max_io_size(&self) -> u32 {
        self.max_io_size
    }

    pub(crate) fn in_capsule_data_size(&self) -> u32 {
        self.in_capsule_data_size
    }

    pub(crate) fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    pub(crate) fn cmd_addr(&self, idx: u16) -> u64 {
        self.cmds.as_ref().unwrap().addr() + (usize::from(idx) * CAPSULE_CMD_SIZE) as u64
    }

    pub(crate) fn cpl_addr(&self, idx: u16) -> u64 {
        self.cpls.as_ref().unwrap().addr() + (usize::from(idx) * CAPSULE_RSP_SIZE) as u64
    }

    pub(crate) fn in_capsule_buf_addr(&self, idx: u16) -> u64 {
        self.bufs.as_ref().unwrap().addr()
            + (usize::from(idx) * self.in_capsule_data_size as usize) as u64
    }

    pub(crate) fn cpls_lkey(&self) -> u32 {
        self.cpls_mr.unwrap().lkey
    }

    pub(crate) fn bufs_lkey(&self) -> u32 {
        self.bufs_mr.unwrap().lkey
    }

    pub(crate) fn cmd(&self, idx: u16) -> Result<&NvmeCmd> {
        self.cmds
            .as_ref()
            .unwrap()
            .as_type(usize::from(idx) * CAPSULE_CMD_SIZE)
    }

    pub(crate) fn rsp_mut(&mut self, idx: u16) -> Result<&mut NvmeCpl> {
        self.cpls
            .as_mut()
            .unwrap()
            .as_type_mut(usize::from(idx) * CAPSULE_RSP_SIZE)
    }

    pub(crate) fn rsp(&self, idx: u16) -> Result<&NvmeCpl> {
        self.cpls
            .as_ref()
            .unwrap()
            .as_type(usize::from(idx) * CAPSULE_RSP_SIZE)
    }

    /// Map a work-request cookie back to its slot.
    pub(crate) fn slot_of(&self, wr_id: u64) -> Result<u16> {
        if wr_id < self.reqs.len() as u64 {
            Ok(wr_id as u16)
        } else {
            error!("work completion with unknown cookie {wr_id} on {:?}", self.cm_id);
            Err(Error::from(ErrorKind::InvalidData))
        }
    }

    pub(crate) fn advance_sq_head(&mut self) {
        self.sq_head = if self.sq_head == self.sq_head_max {
            0
        } else {
            self.sq_head + 1
        };
    }
}

impl Drop for RdmaConn {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!("connection {:?} dropped without being destroyed", self.cm_id);
        }
    }
}
