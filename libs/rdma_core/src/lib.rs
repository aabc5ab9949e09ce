//! Userspace abstraction over the RDMA verbs and connection-management
//! interfaces.
//!
//! The operation surface is kept as one table, [`RdmaProvider`], with one
//! dispatch per verb; a provider backed by real hardware implements it over
//! rdma-core, while [`mock::MockProvider`] implements it entirely in process
//! for tests and demos.

pub mod mock;

use core::mem::size_of;
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::ptr::NonNull;
use std::rc::Rc;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 2;
        const REMOTE_READ = 4;
    }
}

/// Attributes of an RDMA device, as reported by a device query.
#[derive(Debug, Clone)]
pub struct DeviceAttr {
    pub name: String,
    pub fw_ver: String,
    pub phys_port_cnt: u8,
    /// maximum work requests per queue of a queue pair
    pub max_qp_wr: u32,
    /// maximum outstanding RDMA READ / atomic operations per queue pair
    pub max_qp_rd_atom: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    ReliableConnected,
    UnreliableConnected,
    UnreliableDatagram,
}

#[derive(Debug, Clone, Copy)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub cap: QpCap,
}

/// A registered memory region. The local key authorizes work requests on this
/// side; the remote key is handed to the peer for RDMA READ/WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub lkey: u32,
    pub rkey: u32,
}

/// A scatter/gather element of a work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum SendOpcode {
    Send,
    RdmaRead { remote_addr: u64, rkey: u32 },
    RdmaWrite { remote_addr: u64, rkey: u32 },
}

/// A work request for the send queue. The transport only ever posts single-SGE
/// sends and RDMA operations.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    pub op: SendOpcode,
}

/// A work request for the receive queue.
#[derive(Debug, Clone)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    GeneralError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// A harvested work completion.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Check if this work request completed successfully.
    pub fn is_valid(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// Returns the completion status if the work request did not complete
    /// successfully.
    pub fn error(&self) -> Option<WcStatus> {
        match self.status {
            WcStatus::Success => None,
            status => Some(status),
        }
    }
}

/// Identifier of a connection-management context (a listener or a connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmId(pub u32);

/// Service kind the connection request arrived on. TCP-style port spaces are
/// used by iWARP-capable providers and restrict what the responder may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Tcp,
    Ib,
}

#[derive(Debug, Clone)]
pub struct ConnectRequestData {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub port_space: PortSpace,
    pub private_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum CmEventKind {
    ConnectRequest(ConnectRequestData),
    Established,
    Disconnected,
    AddressChange,
    DeviceRemoval,
    TimewaitExit,
    ConnectError,
    Rejected,
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct CmEvent {
    pub id: CmId,
    pub kind: CmEventKind,
}

/// Parameters for accepting a connection request.
#[derive(Debug, Clone, Default)]
pub struct ConnParam {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub rnr_retry_count: u8,
    pub private_data: Vec<u8>,
}

/// The verbs/CM operation table.
///
/// Poll-style operations never block: `get_cm_event` returns `Ok(None)` and
/// the CQ polls return an empty vector when there is nothing to harvest.
pub trait RdmaProvider {
    /// Get the list of RDMA devices currently available.
    fn device_list(&self) -> Vec<DeviceAttr>;
    /// Query the device a CM id is bound to.
    fn device_attr(&self, id: CmId) -> Result<DeviceAttr>;
    /// Create the non-blocking CM event channel.
    fn open_event_channel(&mut self) -> Result<()>;
    /// Create a listening CM id, bind it and listen.
    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> Result<CmId>;
    /// Harvest one CM event, if any.
    fn get_cm_event(&mut self) -> Result<Option<CmEvent>>;
    /// Acknowledge a harvested CM event.
    fn ack_cm_event(&mut self, event: &CmEvent);
    fn accept(&mut self, id: CmId, param: ConnParam) -> Result<()>;
    fn reject(&mut self, id: CmId, private_data: &[u8]) -> Result<()>;
    fn destroy_id(&mut self, id: CmId) -> Result<()>;
    /// Create the queue pair of a connection.
    fn create_qp(&mut self, id: CmId, attr: &QpInitAttr) -> Result<()>;
    fn destroy_qp(&mut self, id: CmId) -> Result<()>;
    /// Switch both completion-queue channels of a connection to non-blocking.
    fn set_cq_nonblocking(&mut self, id: CmId) -> Result<()>;
    /// Register a memory region on the device of a connection.
    fn reg_mr(&mut self, id: CmId, addr: u64, len: usize, access: AccessFlags)
        -> Result<MemoryRegion>;
    fn dereg_mr(&mut self, id: CmId, mr: MemoryRegion) -> Result<()>;
    fn post_send(&mut self, id: CmId, wr: SendWr) -> Result<()>;
    fn post_recv(&mut self, id: CmId, wr: RecvWr) -> Result<()>;
    /// Poll up to `max` completions from the send completion queue.
    fn poll_send_cq(&mut self, id: CmId, max: usize) -> Result<Vec<WorkCompletion>>;
    /// Poll up to `max` completions from the receive completion queue.
    fn poll_recv_cq(&mut self, id: CmId, max: usize) -> Result<Vec<WorkCompletion>>;
}

/// All connection state lives on a single executor, so the provider is shared
/// without locking.
pub type SharedProvider = Rc<RefCell<dyn RdmaProvider>>;

/// A page-aligned, zeroed allocation that work requests reference by raw
/// address.
///
/// The device reads and writes this memory asynchronously, so it lives behind
/// a raw pointer and is only exposed through short-lived slices and typed
/// views.
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PinnedBuffer {
    pub fn new(len: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::from(ErrorKind::InvalidInput))?;
        if len == 0 {
            return Err(Error::from(ErrorKind::InvalidInput));
        }
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, layout, }),
            None => Err(Error::from(ErrorKind::OutOfMemory)),
        }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// Get a typed view of the bytes at `offset`.
    pub fn as_type<T: FromBytes>(&self, offset: usize) -> Result<&T> {
        let end = offset
            .checked_add(size_of::<T>())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| Error::from(ErrorKind::InvalidInput))?;
        LayoutVerified::<&[u8], T>::new(&self.as_slice()[offset..end])
            .map(LayoutVerified::into_ref)
            .ok_or_else(|| Error::from(ErrorKind::InvalidInput))
    }

    /// Get a mutable typed view of the bytes at `offset`.
    pub fn as_type_mut<T: FromBytes + AsBytes>(&mut self, offset: usize) -> Result<&mut T> {
        let end = offset
            .checked_add(size_of::<T>())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| Error::from(ErrorKind::InvalidInput))?;
        LayoutVerified::<&mut [u8], T>::new(&mut self.as_mut_slice()[offset..end])
            .map(LayoutVerified::into_mut)
            .ok_or_else(|| Error::from(ErrorKind::InvalidInput))
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_buffer_alignment_and_zeroing() {
        let buf = PinnedBuffer::new(8192, 4096).unwrap();
        assert_eq!(buf.addr() % 4096, 0);
        assert_eq!(buf.len(), 8192);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn pinned_buffer_typed_access() {
        let mut buf = PinnedBuffer::new(4096, 4096).unwrap();
        *buf.as_type_mut::<u8>(17).unwrap() = 0xa5;
        assert_eq!(*buf.as_type::<u8>(17).unwrap(), 0xa5);
        assert!(buf.as_type::<u8>(4096).is_err());
    }

    #[test]
    fn work_completion_status() {
        let wc = WorkCompletion {
            wr_id: 7,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 16,
        };
        assert!(wc.is_valid());
        assert_eq!(wc.error(), None);
        let wc = WorkCompletion { status: WcStatus::RemoteAccessError, ..wc };
        assert!(!wc.is_valid());
        assert_eq!(wc.error(), Some(WcStatus::RemoteAccessError));
    }
}
