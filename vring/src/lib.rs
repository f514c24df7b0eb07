// SPDX-License-Identifier: Apache-2.0

//! Shared-memory virtqueue engine.
//!
//! A queue is a descriptor table plus an available ring and a used ring, all
//! living in a shared-memory segment visible to both peer processes. The
//! producer publishes buffers through the available ring, the consumer
//! returns them through the used ring, and event descriptors ("kick" and
//! "call") wake the other side. All ring accesses go through an explicit
//! byte-layout layer with bounds and alignment checks; shared memory is
//! never overlaid with structs.

pub mod layout;
pub mod mem;
pub mod queue;
pub mod table;

pub use layout::{Descriptor, FrameHeader, UsedElem, VringLayout};
pub use mem::{Mapping, SharedSegment};
pub use queue::{seed_ring, Vring, VringTable};
pub use table::{AddrSpace, MemoryTable, RegionInfo};

/// Queue index of the receive ring, from the client's point of view.
pub const QUEUE_RX: usize = 0;
/// Queue index of the transmit ring, from the client's point of view.
pub const QUEUE_TX: usize = 1;
/// Number of queues per session.
pub const QUEUE_COUNT: usize = 2;

/// Errors of the virtqueue engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating the shared-memory segment failed.
    #[error("failed to create shared memory segment: {0}")]
    SegmentCreate(#[source] std::io::Error),
    /// Mapping a segment into the address space failed.
    #[error("failed to map shared memory: {0}")]
    SegmentMap(#[source] std::io::Error),
    /// Flushing a mapping to the other process failed.
    #[error("failed to sync shared memory: {0}")]
    SegmentSync(#[source] std::io::Error),
    /// An address was not covered by any negotiated region.
    #[error("address {addr:#x}+{len:#x} not covered by any memory region")]
    TranslationMiss {
        /// The unresolvable address.
        addr: u64,
        /// Length of the attempted access.
        len: usize,
    },
    /// An access fell outside its mapping.
    #[error("access at offset {offset:#x}+{len:#x} outside mapping of {size:#x} bytes")]
    OutOfBounds {
        /// Offset of the attempted access.
        offset: usize,
        /// Length of the attempted access.
        len: usize,
        /// Size of the mapping.
        size: usize,
    },
    /// An access was not aligned for its type.
    #[error("misaligned access at offset {0:#x}")]
    Misaligned(usize),
    /// The region table is full.
    #[error("too many memory regions")]
    TooManyRegions,
    /// A region descriptor does not fit its backing mapping.
    #[error("memory region exceeds its backing mapping")]
    RegionTooSmall,
    /// The queue has no free descriptor.
    #[error("queue {0} has no free descriptor")]
    QueueFull(usize),
    /// A frame does not fit the descriptor's declared buffer length.
    #[error("frame of {frame} bytes exceeds descriptor buffer of {buffer} bytes")]
    OversizedFrame {
        /// Frame length including the framing header.
        frame: usize,
        /// Declared descriptor buffer length.
        buffer: usize,
    },
    /// The peer published a descriptor index outside the table.
    #[error("descriptor index {0} out of range")]
    BadDescriptorIndex(u16),
    /// The peer's ring cursor moved backwards or jumped past the capacity.
    #[error("ring cursor of queue {0} regressed")]
    CursorRegressed(usize),
    /// The queue is not fully configured.
    #[error("queue {0} is not ready")]
    NotReady(usize),
    /// The queue has no event descriptor for the requested notification.
    #[error("queue {0} has no event descriptor")]
    MissingEvent(usize),
    /// Writing or reading an event descriptor failed.
    #[error("event descriptor error: {0}")]
    Event(#[source] std::io::Error),
    /// The queue index is outside the fixed queue pair.
    #[error("invalid queue index {0}")]
    InvalidQueue(usize),
}

/// Result of virtqueue operations.
pub type Result<T> = std::result::Result<T, Error>;
