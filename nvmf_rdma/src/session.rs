//! This module consists of functions that create, work with and destroy the
//! per-session data buffer pool used for transfers larger than the in-capsule
//! data size.

use std::io::Result;

use rdma_core::{AccessFlags, CmId, MemoryRegion, PinnedBuffer, SharedProvider};

use crate::connection::RdmaConn;
use crate::TransportOpts;

const POOL_ALIGN: usize = 4096;

/// A chunk loaned out of the session pool. Holds the address and local key a
/// work request needs; returned through [`DataBufPool::release`].
#[derive(Debug)]
pub(crate) struct DataBuf {
    pub addr: u64,
    pub lkey: u32,
}

/// One large pinned allocation, registered once, carved into
/// `max_queue_depth` chunks of `max_io_size` bytes on a LIFO free stack.
///
/// Mutated only from the executor that owns the session.
pub(crate) struct DataBufPool {
    memory: Option<PinnedBuffer>,
    mr: Option<MemoryRegion>,
    free: Vec<DataBuf>,
    total: usize,
}

impl DataBufPool {
    fn new(provider: &SharedProvider, cm_id: CmId, opts: &TransportOpts) -> Result<Self> {
        let chunks = usize::from(opts.max_queue_depth);
        let chunk_size = opts.max_io_size as usize;
        let memory = PinnedBuffer::new(chunks * chunk_size, POOL_ALIGN)?;
        let mr = provider.borrow_mut().reg_mr(
            cm_id, memory.addr(), memory.len(), AccessFlags::LOCAL_WRITE,
        )?;
        let free = (0..chunks)
            .map(|chunk| DataBuf {
                addr: memory.addr() + (chunk * chunk_size) as u64,
                lkey: mr.lkey,
            })
            .collect();
        Ok(Self { memory: Some(memory), mr: Some(mr), free, total: chunks, })
    }

    pub(crate) fn acquire(&mut self) -> Option<DataBuf> {
        self.free.pop()
    }

    pub(crate) fn release(&mut self, buf: DataBuf) {
        self.free.push(buf);
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

/// Per-session transport state, created on the first connection of a session.
///
/// The pool is registered against that first connection's device; every
/// connection of the session is expected to use the same device.
pub struct Session {
    provider: SharedProvider,
    cm_id: CmId,
    pub(crate) pool: DataBufPool,
}

impl Session {
    pub(crate) fn new(
        provider: SharedProvider, conn: &RdmaConn, opts: &TransportOpts,
    ) -> Result<Self> {
        let cm_id = conn.cm_id();
        let pool = DataBufPool::new(&provider, cm_id, opts)?;
        trace!(
            "created session pool on {:?}: {} chunks of {} bytes",
            cm_id, pool.total, opts.max_io_size,
        );
        Ok(Self { provider, cm_id, pool, })
    }

    /// Deregister the pool and free it.
    pub(crate) fn destroy(&mut self) {
        if let Some(mr) = self.pool.mr.take() {
            if let Err(e) = self.provider.borrow_mut().dereg_mr(self.cm_id, mr) {
                warn!("failed to deregister the session pool on {:?}: {e}", self.cm_id);
            }
        }
        self.pool.memory.take();
        self.pool.free.clear();
    }

    /// Chunks currently on the free stack.
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Total chunks the pool was created with.
    pub fn pool_total(&self) -> usize {
        self.pool.total
    }
}
