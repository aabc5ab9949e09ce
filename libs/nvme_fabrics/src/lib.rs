//! This crate defines the NVMe and NVMe-over-Fabrics wire formats used by the
//! target: command and completion capsules, SGL descriptors, status codes,
//! fabrics command types, the RDMA connection-management private data blocks
//! and the discovery log page entry.
//!
//! Everything on the wire is little-endian.

use byteorder::LittleEndian;
use core::mem::size_of;
use strum_macros::FromRepr;
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

/// Opcode of a fabrics command capsule.
pub const OPC_FABRIC: u8 = 0x7f;

/// A 64-byte command capsule (submission queue entry).
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct NvmeCmd {
    pub opc: u8,
    /// fused bits 1:0, PRP/SGL selector bits 7:6
    pub fuse_psdt: u8,
    pub cid: U16<LittleEndian>,
    pub nsid: U32<LittleEndian>,
    pub rsvd2: U32<LittleEndian>,
    pub rsvd3: U32<LittleEndian>,
    pub mptr: U64<LittleEndian>,
    pub dptr: SglDescriptor,
    pub cdw10: U32<LittleEndian>,
    pub cdw11: U32<LittleEndian>,
    pub cdw12: U32<LittleEndian>,
    pub cdw13: U32<LittleEndian>,
    pub cdw14: U32<LittleEndian>,
    pub cdw15: U32<LittleEndian>,
}

impl NvmeCmd {
    /// The fabrics command type; only meaningful when `opc` is [`OPC_FABRIC`].
    ///
    /// Fabrics capsules put the command type in the byte right after the
    /// command identifier, where ordinary commands carry the namespace id.
    pub fn fctype(&self) -> u8 {
        (self.nsid.get() & 0xff) as u8
    }
}

/// A 16-byte completion capsule (completion queue entry).
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct NvmeCpl {
    pub cdw0: U32<LittleEndian>,
    pub rsvd1: U32<LittleEndian>,
    pub sqhd: U16<LittleEndian>,
    pub sqid: U16<LittleEndian>,
    pub cid: U16<LittleEndian>,
    /// phase tag bit 0, status code bits 8:1, status code type bits 11:9
    pub status: U16<LittleEndian>,
}

impl NvmeCpl {
    /// Zero every field of this completion.
    pub fn clear(&mut self) {
        *self = Self::new_zeroed();
    }

    pub fn set_status(&mut self, sct: StatusCodeType, sc: u8) {
        self.status.set(((sct as u16) << 9) | ((sc as u16) << 1));
    }

    pub fn status_code(&self) -> u8 {
        ((self.status.get() >> 1) & 0xff) as u8
    }

    pub fn status_code_type(&self) -> u8 {
        ((self.status.get() >> 9) & 0x7) as u8
    }

    pub fn is_success(&self) -> bool {
        self.status.get() & 0x0ffe == 0
    }
}

/// A 16-byte SGL descriptor.
///
/// The interpretation of the seven type-specific bytes depends on the
/// descriptor type: a plain data block carries a 4-byte length, a keyed data
/// block a 3-byte length followed by a 4-byte key.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct SglDescriptor {
    pub address: U64<LittleEndian>,
    specific: [u8; 7],
    /// descriptor type bits 7:4, subtype bits 3:0
    pub id: u8,
}

impl SglDescriptor {
    /// Build a keyed data block descriptor.
    pub fn keyed(subtype: SglSubtype, address: u64, length: u32, key: u32) -> Self {
        let mut sgl = Self::new_zeroed();
        sgl.id = ((SglType::KeyedDataBlock as u8) << 4) | subtype as u8;
        sgl.address.set(address);
        sgl.specific[0] = (length & 0xff) as u8;
        sgl.specific[1] = ((length >> 8) & 0xff) as u8;
        sgl.specific[2] = ((length >> 16) & 0xff) as u8;
        sgl.specific[3..7].copy_from_slice(&key.to_le_bytes());
        sgl
    }

    /// Build an in-capsule data block descriptor with the offset subtype.
    pub fn in_capsule(offset: u64, length: u32) -> Self {
        let mut sgl = Self::new_zeroed();
        sgl.id = ((SglType::DataBlock as u8) << 4) | SglSubtype::Offset as u8;
        sgl.address.set(offset);
        sgl.specific[0..4].copy_from_slice(&length.to_le_bytes());
        sgl
    }

    pub fn sgl_type(&self) -> Option<SglType> {
        SglType::from_repr(self.id >> 4)
    }

    pub fn subtype(&self) -> Option<SglSubtype> {
        SglSubtype::from_repr(self.id & 0xf)
    }

    /// Length field of a plain data block descriptor.
    pub fn unkeyed_length(&self) -> u32 {
        u32::from_le_bytes([
            self.specific[0], self.specific[1], self.specific[2], self.specific[3],
        ])
    }

    /// Length field of a keyed data block descriptor (24 bits).
    pub fn keyed_length(&self) -> u32 {
        u32::from(self.specific[0])
            | u32::from(self.specific[1]) << 8
            | u32::from(self.specific[2]) << 16
    }

    /// Remote key of a keyed data block descriptor.
    pub fn key(&self) -> u32 {
        u32::from_le_bytes([
            self.specific[3], self.specific[4], self.specific[5], self.specific[6],
        ])
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum SglType {
    DataBlock = 0x0,
    BitBucket = 0x1,
    Segment = 0x2,
    LastSegment = 0x3,
    KeyedDataBlock = 0x4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum SglSubtype {
    Address = 0x0,
    Offset = 0x1,
    InvalidateKey = 0xf,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodeType {
    Generic = 0,
    CommandSpecific = 1,
    MediaError = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum GenericStatusCode {
    Success = 0x00,
    InvalidOpcode = 0x01,
    InvalidField = 0x02,
    DataTransferError = 0x04,
    InternalDeviceError = 0x06,
    InvalidSglSegDescriptor = 0x0d,
    InvalidNumSglDescriptors = 0x0e,
    DataSglLengthInvalid = 0x0f,
    MetadataSglLengthInvalid = 0x10,
    SglDescriptorTypeInvalid = 0x11,
    InvalidSglOffset = 0x16,
}

/// Direction of the data transfer a command implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransfer {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataTransfer {
    /// For ordinary opcodes the direction is encoded in the two low bits.
    pub fn from_opcode(opc: u8) -> Self {
        match opc & 0x3 {
            1 => Self::HostToController,
            2 => Self::ControllerToHost,
            3 => Self::Bidirectional,
            _ => Self::None,
        }
    }

    pub fn of_cmd(cmd: &NvmeCmd) -> Self {
        if cmd.opc != OPC_FABRIC {
            return Self::from_opcode(cmd.opc);
        }
        match FabricsCommandType::from_repr(cmd.fctype()) {
            Some(FabricsCommandType::Connect)
            | Some(FabricsCommandType::AuthenticationSend) => Self::HostToController,
            Some(FabricsCommandType::PropertyGet)
            | Some(FabricsCommandType::AuthenticationRecv) => Self::ControllerToHost,
            _ => Self::None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum FabricsCommandType {
    PropertySet = 0x00,
    Connect = 0x01,
    PropertyGet = 0x04,
    AuthenticationSend = 0x05,
    AuthenticationRecv = 0x06,
}

/// Private data a host attaches to an RDMA connection request.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct RdmaRequestPrivateData {
    pub recfmt: U16<LittleEndian>,
    pub qid: U16<LittleEndian>,
    /// host receive queue size
    pub hrqsize: U16<LittleEndian>,
    /// host send queue size
    pub hsqsize: U16<LittleEndian>,
    pub cntlid: U16<LittleEndian>,
    pub reserved: [u8; 22],
}

/// Private data the target attaches when accepting a connection.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct RdmaAcceptPrivateData {
    pub recfmt: U16<LittleEndian>,
    /// controller receive queue size
    pub crqsize: U16<LittleEndian>,
    pub reserved: [u8; 28],
}

/// Private data the target attaches when rejecting a connection.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct RdmaRejectPrivateData {
    pub recfmt: U16<LittleEndian>,
    pub sts: U16<LittleEndian>,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum TransportType {
    Rdma = 1,
    FibreChannel = 2,
    Tcp = 3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
    InfiniBand = 3,
    FibreChannel = 4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum SubsystemType {
    Discovery = 1,
    Nvme = 2,
}

/// Secure-channel requirement advertised in a discovery entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum TransportRequirements {
    NotSpecified = 0,
    Required = 1,
    NotRequired = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum RdmaQpServiceType {
    ReliableConnected = 1,
    ReliableDatagram = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum RdmaProviderType {
    None = 1,
    InfiniBand = 2,
    RoceV1 = 3,
    RoceV2 = 4,
    Iwarp = 5,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum RdmaCms {
    RdmaCm = 1,
}

/// RDMA transport-specific address subtype of a discovery entry.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct RdmaTsas {
    pub qptype: u8,
    pub prtype: u8,
    pub cms: u8,
    pub rsvd3: [u8; 5],
    pub pkey: U16<LittleEndian>,
    pub rsvd10: [u8; 246],
}

/// One 1024-byte entry of the discovery log page.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C, packed)]
pub struct DiscoveryLogEntry {
    pub trtype: u8,
    pub adrfam: u8,
    pub subtype: u8,
    pub treq: u8,
    pub portid: U16<LittleEndian>,
    pub cntlid: U16<LittleEndian>,
    pub asqsz: U16<LittleEndian>,
    pub rsvd10: [u8; 22],
    pub trsvcid: [u8; 32],
    pub rsvd64: [u8; 192],
    pub subnqn: [u8; 256],
    pub traddr: [u8; 256],
    pub tsas: RdmaTsas,
}

/// Copy `s` into a fixed-size, space-padded field of a discovery entry.
pub fn set_discovery_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    for b in field[n..].iter_mut() {
        *b = b' ';
    }
}

pub const CAPSULE_CMD_SIZE: usize = size_of::<NvmeCmd>();
pub const CAPSULE_RSP_SIZE: usize = size_of::<NvmeCpl>();
