// SPDX-License-Identifier: Apache-2.0

//! Byte layout of the ring structures and of the per-queue shared segment.
//!
//! Offsets are computed once per capacity and every field is addressed
//! explicitly; nothing here assumes a C struct overlay over the mapping.

use vm_memory::ByteValued;

use crate::{Error, Result};

/// Sentinel descriptor index meaning "no next descriptor".
pub const DESC_NONE: u16 = 0xffff;

/// Descriptor flag: the buffer continues in the descriptor named by `next`.
pub const DESC_F_NEXT: u16 = 0x1;
/// Descriptor flag: the buffer is write-only for the consumer.
pub const DESC_F_WRITE: u16 = 0x2;
/// Descriptor flag: the buffer holds an indirect descriptor table.
pub const DESC_F_INDIRECT: u16 = 0x4;

/// Largest Ethernet frame carried on the data plane.
pub const FRAME_MAX_SIZE: usize = 1518;
/// Byte length of the virtio-net framing header preceding each frame.
pub const FRAME_HDR_SIZE: usize = 10;
/// Per-descriptor buffer slot: framing header plus one frame, 8-byte aligned.
pub const BUFFER_SIZE: usize = (FRAME_HDR_SIZE + FRAME_MAX_SIZE + 7) & !7;

/// Default queue capacity, negotiated away by SET_VRING_NUM.
pub const DEFAULT_QUEUE_CAPACITY: u16 = 256;

const PAGE_SIZE: usize = 4096;

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// One entry of the descriptor table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Buffer address in the guest-physical space.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// `DESC_F_*` bits.
    pub flags: u16,
    /// Next descriptor of the chain, or the free-list link.
    pub next: u16,
}

// SAFETY: repr(C) u64/u32/u16/u16, 16 bytes, no padding.
unsafe impl ByteValued for Descriptor {}

/// One entry of the used ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Head index of the consumed descriptor chain.
    pub id: u32,
    /// Total bytes written into the chain.
    pub len: u32,
}

// SAFETY: repr(C) two u32 fields, no padding.
unsafe impl ByteValued for UsedElem {}

/// The virtio-net header written in front of every frame. All fields stay
/// zero on this data plane; a nonzero header from the peer is reported.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Checksum/segmentation flags, unused.
    pub flags: u8,
    /// Segmentation type, unused.
    pub gso_type: u8,
    /// Header length hint.
    pub hdr_len: u16,
    /// Segment size hint.
    pub gso_size: u16,
    /// Checksum start offset.
    pub csum_start: u16,
    /// Checksum field offset.
    pub csum_offset: u16,
}

// SAFETY: repr(C) u8/u8/u16/u16/u16/u16, 10 bytes, no padding.
unsafe impl ByteValued for FrameHeader {}

impl FrameHeader {
    /// Whether every field is zero.
    pub fn is_zeroed(&self) -> bool {
        *self == FrameHeader::default()
    }
}

/// Offsets of the ring structures and the buffer pool within one per-queue
/// shared segment.
///
/// The descriptor table starts the segment, the available ring follows it,
/// the used ring starts on its own page and the buffer pool holds one
/// [`BUFFER_SIZE`] slot per descriptor.
#[derive(Clone, Copy, Debug)]
pub struct VringLayout {
    capacity: u16,
    avail_ring: usize,
    used_ring: usize,
    buffer_pool: usize,
    segment_size: usize,
}

impl VringLayout {
    /// Computes the layout for `capacity` descriptors.
    pub fn new(capacity: u16) -> Result<Self> {
        if capacity == 0 || capacity == DESC_NONE {
            return Err(Error::BadDescriptorIndex(capacity));
        }
        let cap = capacity as usize;
        let desc_table_size = cap * std::mem::size_of::<Descriptor>();
        let avail_ring = desc_table_size;
        let avail_ring_size = 4 + 2 * cap;
        let used_ring = align_up(avail_ring + avail_ring_size, PAGE_SIZE);
        let used_ring_size = 4 + std::mem::size_of::<UsedElem>() * cap;
        let buffer_pool = align_up(used_ring + used_ring_size, 8);
        let segment_size = align_up(buffer_pool + cap * BUFFER_SIZE, PAGE_SIZE);
        Ok(VringLayout {
            capacity,
            avail_ring,
            used_ring,
            buffer_pool,
            segment_size,
        })
    }

    /// Number of descriptors.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Total segment size in bytes.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Offset of the descriptor table.
    pub fn desc_table(&self) -> usize {
        0
    }

    /// Byte length of the descriptor table.
    pub fn desc_table_size(&self) -> usize {
        self.capacity as usize * std::mem::size_of::<Descriptor>()
    }

    /// Offset of the available ring.
    pub fn avail_ring(&self) -> usize {
        self.avail_ring
    }

    /// Byte length of the available ring.
    pub fn avail_ring_size(&self) -> usize {
        4 + 2 * self.capacity as usize
    }

    /// Offset of the used ring. Always page-aligned.
    pub fn used_ring(&self) -> usize {
        self.used_ring
    }

    /// Byte length of the used ring.
    pub fn used_ring_size(&self) -> usize {
        4 + std::mem::size_of::<UsedElem>() * self.capacity as usize
    }

    /// Offset of the buffer slot of descriptor `index`.
    pub fn buffer(&self, index: u16) -> Result<usize> {
        if index >= self.capacity {
            return Err(Error::BadDescriptorIndex(index));
        }
        Ok(self.buffer_pool + index as usize * BUFFER_SIZE)
    }
}
