// SPDX-License-Identifier: Apache-2.0

//! Wire format of the vhost-user control channel: request codes, the fixed
//! 12-byte header and the per-request payload bodies.
//!
//! Every body is a `repr(C)` record without padding, moved on and off the
//! socket by copy through [`ByteValued`] rather than by overlaying structs
//! on raw buffers.

use vm_memory::ByteValued;

/// Largest permitted payload, header excluded.
pub const MAX_MSG_SIZE: usize = 0x1000;

/// Largest number of file descriptors a single message may carry. Bounded by
/// the maximum number of memory regions in a SET_MEM_TABLE request.
pub const MAX_ATTACHED_FD_ENTRIES: usize = 8;

/// Maximum number of memory regions in one table.
pub const MAX_MEMORY_REGIONS: usize = 8;

/// Mask extracting a queue index from a vring-fd message payload.
pub const VRING_IDX_MASK: u64 = 0xff;

/// Flag bit of a vring-fd message payload marking that no descriptor was
/// attached and the queue should be driven by polling.
pub const VRING_NOFD_MASK: u64 = 0x100;

/// Request codes sent by the client (device front-end) to the server.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Invalid request.
    Noop = 0,
    /// Get the feature bitmask from the server.
    GetFeatures = 1,
    /// Enable feature bits on the server.
    SetFeatures = 2,
    /// Mark the sender as the exclusive session owner.
    SetOwner = 3,
    /// Drop all session state and return to the initial state.
    ResetOwner = 4,
    /// Publish the shared-memory region table, one fd per region.
    SetMemTable = 5,
    /// Set the address of the dirty-page log.
    SetLogBase = 6,
    /// Set the fd used for logging, carried as ancillary data.
    SetLogFd = 7,
    /// Set the capacity of a queue.
    SetVringNum = 8,
    /// Set the addresses of a queue's rings.
    SetVringAddr = 9,
    /// Set the starting cursor of a queue.
    SetVringBase = 10,
    /// Stop a queue and fetch its current cursor.
    GetVringBase = 11,
    /// Set the kick event descriptor of a queue.
    SetVringKick = 12,
    /// Set the call event descriptor of a queue.
    SetVringCall = 13,
    /// Set the error event descriptor of a queue.
    SetVringErr = 14,
    /// Upper bound, not a valid request.
    MaxCmd = 15,
}

impl Request {
    /// Whether the raw code names a dispatchable request.
    pub fn is_valid_code(code: u32) -> bool {
        code > Request::Noop as u32 && code < Request::MaxCmd as u32
    }

    /// Decodes a raw request code.
    pub fn from_code(code: u32) -> Option<Request> {
        if !Self::is_valid_code(code) {
            return None;
        }
        Some(match code {
            1 => Request::GetFeatures,
            2 => Request::SetFeatures,
            3 => Request::SetOwner,
            4 => Request::ResetOwner,
            5 => Request::SetMemTable,
            6 => Request::SetLogBase,
            7 => Request::SetLogFd,
            8 => Request::SetVringNum,
            9 => Request::SetVringAddr,
            10 => Request::SetVringBase,
            11 => Request::GetVringBase,
            12 => Request::SetVringKick,
            13 => Request::SetVringCall,
            _ => Request::SetVringErr,
        })
    }

    /// Whether this request is allowed to carry attached file descriptors.
    pub fn may_carry_fds(&self) -> bool {
        matches!(
            self,
            Request::SetMemTable
                | Request::SetLogBase
                | Request::SetLogFd
                | Request::SetVringKick
                | Request::SetVringCall
                | Request::SetVringErr
        )
    }
}

impl From<Request> for u32 {
    fn from(req: Request) -> u32 {
        req as u32
    }
}

bitflags::bitflags! {
    /// Flag bits of the message header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// Lower two bits hold the protocol version, currently 0x1.
        const VERSION = 0x3;
        /// The message is a reply.
        const REPLY = 0x4;
        /// The sender expects a reply.
        const NEED_REPLY = 0x8;
    }
}

/// Protocol version carried in the low header-flag bits.
pub const VERSION: u32 = 0x1;

/// Fixed message header preceding every payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

// SAFETY: MsgHeader is repr(C) with three u32 fields and no padding.
unsafe impl ByteValued for MsgHeader {}

impl MsgHeader {
    /// Byte length of the encoded header.
    pub const SIZE: usize = 12;

    /// Creates a header for a fresh request.
    pub fn new(request: Request, extra_flags: HeaderFlags, size: u32) -> Self {
        MsgHeader {
            request: request.into(),
            flags: VERSION | extra_flags.bits(),
            size,
        }
    }

    /// Decoded request code, if valid.
    pub fn request(&self) -> Option<Request> {
        Request::from_code(self.request)
    }

    /// Raw request code.
    pub fn code(&self) -> u32 {
        self.request
    }

    /// Protocol version bits.
    pub fn version(&self) -> u32 {
        self.flags & HeaderFlags::VERSION.bits()
    }

    /// Whether the reply bit is set.
    pub fn is_reply(&self) -> bool {
        self.flags & HeaderFlags::REPLY.bits() != 0
    }

    /// Marks this header as a reply.
    pub fn set_reply(&mut self, reply: bool) {
        if reply {
            self.flags |= HeaderFlags::REPLY.bits();
        } else {
            self.flags &= !HeaderFlags::REPLY.bits();
        }
    }

    /// Whether the sender asked for an explicit acknowledgement.
    pub fn needs_reply(&self) -> bool {
        self.flags & HeaderFlags::NEED_REPLY.bits() != 0
    }

    /// Payload byte length announced by the sender.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether `self` is the reply matching the request header `req`: same
    /// request code, same version bits, reply bit set on `self` only.
    pub fn is_reply_for(&self, req: &MsgHeader) -> bool {
        self.is_reply()
            && !req.is_reply()
            && self.request == req.request
            && self.version() == req.version()
    }

    /// Structural validity of the header itself.
    pub fn is_valid(&self) -> bool {
        Request::is_valid_code(self.request)
            && self.version() == VERSION
            && self.flags & !(HeaderFlags::VERSION | HeaderFlags::REPLY | HeaderFlags::NEED_REPLY).bits() == 0
            && self.size as usize <= MAX_MSG_SIZE
    }
}

/// Payload bodies that can assert their own validity after decode.
pub trait MsgValidator {
    /// Structural validity of the decoded body.
    fn is_valid(&self) -> bool {
        true
    }
}

/// A single 64-bit payload, used for features, log base and the packed
/// vring-fd messages.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct U64Msg {
    /// The value.
    pub value: u64,
}

// SAFETY: repr(C) single u64, no padding.
unsafe impl ByteValued for U64Msg {}

impl U64Msg {
    /// Wraps a value.
    pub fn new(value: u64) -> Self {
        U64Msg { value }
    }

    /// Packs a queue index and fd-validity flag for a vring-fd message.
    pub fn vring_fd(queue_index: u8, has_fd: bool) -> Self {
        let mut value = u64::from(queue_index);
        if !has_fd {
            value |= VRING_NOFD_MASK;
        }
        U64Msg { value }
    }

    /// Queue index of a vring-fd payload.
    pub fn queue_index(&self) -> u8 {
        (self.value & VRING_IDX_MASK) as u8
    }

    /// Whether a vring-fd payload announced that no descriptor is attached.
    pub fn no_fd(&self) -> bool {
        self.value & VRING_NOFD_MASK != 0
    }
}

impl MsgValidator for U64Msg {}

/// Leading body of a SET_MEM_TABLE request, followed by `num_regions`
/// region descriptors.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryHeader {
    /// Number of region descriptors that follow.
    pub num_regions: u32,
    /// Reserved.
    pub padding: u32,
}

// SAFETY: repr(C), two u32 fields, no padding.
unsafe impl ByteValued for MemoryHeader {}

impl MsgValidator for MemoryHeader {
    fn is_valid(&self) -> bool {
        self.num_regions >= 1 && self.num_regions as usize <= MAX_MEMORY_REGIONS
    }
}

/// One shared-memory region entry of a SET_MEM_TABLE request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRegionDesc {
    /// Start of the region in the guest-physical space.
    pub guest_phys_addr: u64,
    /// Region length in bytes.
    pub memory_size: u64,
    /// Start of the region in the sender's address space.
    pub userspace_addr: u64,
    /// Offset into the attached descriptor where the mapping starts.
    pub mmap_offset: u64,
}

// SAFETY: repr(C), four u64 fields, no padding.
unsafe impl ByteValued for MemoryRegionDesc {}

impl MsgValidator for MemoryRegionDesc {
    fn is_valid(&self) -> bool {
        self.memory_size != 0
            && self.guest_phys_addr.checked_add(self.memory_size).is_some()
            && self.userspace_addr.checked_add(self.memory_size).is_some()
            && self.mmap_offset.checked_add(self.memory_size).is_some()
    }
}

/// Queue index plus a 32-bit quantity: capacity for SET_VRING_NUM, cursor
/// for SET_VRING_BASE and the GET_VRING_BASE reply.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VringStateMsg {
    /// Queue index.
    pub index: u32,
    /// Capacity or cursor value.
    pub num: u32,
}

// SAFETY: repr(C), two u32 fields, no padding.
unsafe impl ByteValued for VringStateMsg {}

impl MsgValidator for VringStateMsg {}

/// Ring addresses of one queue, in the sender's address space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VringAddrMsg {
    /// Queue index.
    pub index: u32,
    /// Option flags, unused here.
    pub flags: u32,
    /// Descriptor table address, 16-byte aligned.
    pub descriptor: u64,
    /// Used ring address, 4-byte aligned.
    pub used: u64,
    /// Available ring address, 2-byte aligned.
    pub available: u64,
    /// Dirty-log address, only meaningful with logging enabled.
    pub log: u64,
}

// SAFETY: repr(C); two u32 fields then four u64 fields, no padding.
unsafe impl ByteValued for VringAddrMsg {}

impl MsgValidator for VringAddrMsg {
    fn is_valid(&self) -> bool {
        self.descriptor & 0xf == 0 && self.used & 0x3 == 0 && self.available & 0x1 == 0
    }
}
