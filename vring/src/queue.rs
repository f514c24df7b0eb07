// SPDX-License-Identifier: Apache-2.0

//! The per-queue ring state and the four data-plane operations: enqueue,
//! drain, reclaim and kick.
//!
//! Roles are fixed per ring: one peer produces into the available ring and
//! reclaims from the used ring, the other drains the available ring and
//! fills the used ring. The two sides never write the same field, so the
//! protocol is lock-free; visibility is forced by flushing the mapping
//! after each batch of writes.

use std::num::Wrapping;

use log::{debug, warn};
use vm_memory::ByteValued;
use vmm_sys_util::eventfd::EventFd;

use crate::layout::{
    Descriptor, FrameHeader, UsedElem, VringLayout, BUFFER_SIZE, DESC_F_NEXT, DESC_F_WRITE,
    DESC_NONE, FRAME_HDR_SIZE,
};
use crate::mem::Mapping;
use crate::table::{AddrSpace, MemoryTable};
use crate::{Error, Result, QUEUE_COUNT};

const DESC_ENTRY_SIZE: usize = std::mem::size_of::<Descriptor>();
const USED_ENTRY_SIZE: usize = std::mem::size_of::<UsedElem>();

// Offsets of the `idx` field and the first element within each ring.
const RING_IDX_OFFSET: usize = 2;
const RING_ELEMS_OFFSET: usize = 4;

/// Runtime state of one queue.
pub struct Vring {
    index: usize,
    capacity: u16,
    desc: Option<Mapping>,
    avail: Option<Mapping>,
    used: Option<Mapping>,
    kick: Option<EventFd>,
    call: Option<EventFd>,
    err: Option<EventFd>,
    polling: bool,
    ready: bool,
    /// Free-list head on the producer side, consume cursor on the consumer
    /// side. Seeded by the vring-base message.
    last_avail_idx: Wrapping<u16>,
    last_used_idx: Wrapping<u16>,
}

impl Vring {
    fn new(index: usize) -> Self {
        Vring {
            index,
            capacity: 0,
            desc: None,
            avail: None,
            used: None,
            kick: None,
            call: None,
            err: None,
            polling: false,
            ready: false,
            last_avail_idx: Wrapping(0),
            last_used_idx: Wrapping(0),
        }
    }

    /// Sets the negotiated capacity.
    pub fn set_capacity(&mut self, num: u16) -> Result<()> {
        if num == 0 || num == DESC_NONE {
            return Err(Error::BadDescriptorIndex(num));
        }
        self.capacity = num;
        Ok(())
    }

    /// The negotiated capacity.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Seeds both local cursors.
    pub fn set_base(&mut self, base: u16) {
        self.last_avail_idx = Wrapping(base);
        self.last_used_idx = Wrapping(base);
    }

    /// The current local cursor, reported by the vring-base reply.
    pub fn base(&self) -> u16 {
        self.last_avail_idx.0
    }

    /// Installs the three ring mappings and marks the queue ready.
    ///
    /// The consumer cursor is re-synced from the used ring so a producer
    /// attaching to a ring with history starts where the rings say.
    pub fn set_rings(&mut self, desc: Mapping, avail: Mapping, used: Mapping) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::NotReady(self.index));
        }
        let cap = self.capacity as usize;
        for (mapping, need) in [
            (&desc, cap * DESC_ENTRY_SIZE),
            (&avail, RING_ELEMS_OFFSET + 2 * cap),
            (&used, RING_ELEMS_OFFSET + USED_ENTRY_SIZE * cap),
        ] {
            if mapping.len() < need {
                return Err(Error::OutOfBounds {
                    offset: 0,
                    len: need,
                    size: mapping.len(),
                });
            }
        }
        self.desc = Some(desc);
        self.avail = Some(avail);
        self.used = Some(used);
        self.last_used_idx = Wrapping(self.used_idx()?.0);
        self.ready = true;
        debug!("queue {} ready, capacity {}", self.index, self.capacity);
        Ok(())
    }

    /// Whether the queue is fully configured.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Stops the queue and reports the local cursor, per the vring-base
    /// request.
    pub fn stop(&mut self) -> u16 {
        self.ready = false;
        self.last_avail_idx.0
    }

    /// Drops all state, returning the queue to its pristine shape.
    pub fn reset(&mut self) {
        *self = Vring::new(self.index);
    }

    /// Installs the kick descriptor; `None` switches the queue to polling.
    pub fn set_kick(&mut self, kick: Option<EventFd>) {
        self.polling = kick.is_none();
        self.kick = kick;
    }

    /// Installs the call descriptor.
    pub fn set_call(&mut self, call: Option<EventFd>) {
        self.call = call;
    }

    /// Installs the error descriptor.
    pub fn set_err(&mut self, err: Option<EventFd>) {
        self.err = err;
    }

    /// The kick descriptor, if notification is in use.
    pub fn kick_event(&self) -> Option<&EventFd> {
        self.kick.as_ref()
    }

    /// The call descriptor.
    pub fn call_event(&self) -> Option<&EventFd> {
        self.call.as_ref()
    }

    /// Whether the queue is driven by polling instead of kicks.
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// Wakes the consumer side.
    pub fn kick(&self) -> Result<()> {
        let kick = self
            .kick
            .as_ref()
            .ok_or(Error::MissingEvent(self.index))?;
        kick.write(1).map_err(Error::Event)
    }

    /// Wakes the producer side after used entries were published. Queues
    /// without a call descriptor are reclaimed by the producer's timer.
    pub fn signal_call(&self) -> Result<()> {
        if let Some(call) = &self.call {
            call.write(1).map_err(Error::Event)?;
        }
        Ok(())
    }

    fn desc_mapping(&self) -> Result<&Mapping> {
        self.desc.as_ref().ok_or(Error::NotReady(self.index))
    }

    fn avail_mapping(&self) -> Result<&Mapping> {
        self.avail.as_ref().ok_or(Error::NotReady(self.index))
    }

    fn used_mapping(&self) -> Result<&Mapping> {
        self.used.as_ref().ok_or(Error::NotReady(self.index))
    }

    fn desc_at(&self, index: u16) -> Result<Descriptor> {
        if index >= self.capacity {
            return Err(Error::BadDescriptorIndex(index));
        }
        self.desc_mapping()?
            .read_obj(index as usize * DESC_ENTRY_SIZE)
    }

    fn write_desc(&self, index: u16, desc: Descriptor) -> Result<()> {
        if index >= self.capacity {
            return Err(Error::BadDescriptorIndex(index));
        }
        self.desc_mapping()?
            .write_obj(index as usize * DESC_ENTRY_SIZE, desc)
    }

    fn avail_idx(&self) -> Result<Wrapping<u16>> {
        Ok(Wrapping(self.avail_mapping()?.read_obj(RING_IDX_OFFSET)?))
    }

    fn set_avail_idx(&self, idx: Wrapping<u16>) -> Result<()> {
        self.avail_mapping()?.write_obj(RING_IDX_OFFSET, idx.0)
    }

    fn avail_entry(&self, slot: u16) -> Result<u16> {
        self.avail_mapping()?
            .read_obj(RING_ELEMS_OFFSET + 2 * slot as usize)
    }

    fn set_avail_entry(&self, slot: u16, value: u16) -> Result<()> {
        self.avail_mapping()?
            .write_obj(RING_ELEMS_OFFSET + 2 * slot as usize, value)
    }

    fn used_idx(&self) -> Result<Wrapping<u16>> {
        Ok(Wrapping(self.used_mapping()?.read_obj(RING_IDX_OFFSET)?))
    }

    fn set_used_idx(&self, idx: Wrapping<u16>) -> Result<()> {
        self.used_mapping()?.write_obj(RING_IDX_OFFSET, idx.0)
    }

    fn used_entry(&self, slot: u16) -> Result<UsedElem> {
        self.used_mapping()?
            .read_obj(RING_ELEMS_OFFSET + USED_ENTRY_SIZE * slot as usize)
    }

    fn set_used_entry(&self, slot: u16, elem: UsedElem) -> Result<()> {
        self.used_mapping()?
            .write_obj(RING_ELEMS_OFFSET + USED_ENTRY_SIZE * slot as usize, elem)
    }
}

/// The session's fixed queue pair and its data-plane operations.
pub struct VringTable {
    rings: [Vring; QUEUE_COUNT],
}

impl Default for VringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VringTable {
    /// A table with both queues unconfigured.
    pub fn new() -> Self {
        VringTable {
            rings: [Vring::new(0), Vring::new(1)],
        }
    }

    /// The queue at `index`.
    pub fn vring(&self, index: usize) -> Result<&Vring> {
        self.rings.get(index).ok_or(Error::InvalidQueue(index))
    }

    /// The queue at `index`, mutably.
    pub fn vring_mut(&mut self, index: usize) -> Result<&mut Vring> {
        self.rings.get_mut(index).ok_or(Error::InvalidQueue(index))
    }

    /// Whether every queue is ready.
    pub fn all_ready(&self) -> bool {
        self.rings.iter().all(Vring::is_ready)
    }

    /// Drops the state of both queues.
    pub fn reset(&mut self) {
        for vring in &mut self.rings {
            vring.reset();
        }
    }

    /// Producer side: publishes `frame` on queue `index`.
    ///
    /// Pops the free-descriptor list, writes the framing header and the
    /// frame into the descriptor's buffer, and publishes the descriptor on
    /// the available ring. Nothing is mutated when the frame does not fit
    /// or no descriptor is free.
    pub fn enqueue(&mut self, mem: &MemoryTable, index: usize, frame: &[u8]) -> Result<()> {
        let vring = self.vring_mut(index)?;
        if !vring.ready {
            return Err(Error::NotReady(index));
        }

        let head = vring.last_avail_idx.0;
        if head == DESC_NONE {
            return Err(Error::QueueFull(index));
        }
        let desc = vring.desc_at(head)?;
        let need = FRAME_HDR_SIZE + frame.len();
        if need > desc.len as usize {
            return Err(Error::OversizedFrame {
                frame: need,
                buffer: desc.len as usize,
            });
        }

        let buf = mem.translate(desc.addr, need, AddrSpace::GuestPhys)?;
        buf.write_obj(0, FrameHeader::default())?;
        buf.write(FRAME_HDR_SIZE, frame)?;
        buf.sync()?;

        // Unlink from the free list, then hand the descriptor over.
        vring.last_avail_idx = Wrapping(desc.next);
        vring.write_desc(
            head,
            Descriptor {
                addr: desc.addr,
                len: need as u32,
                flags: 0,
                next: DESC_NONE,
            },
        )?;

        let avail_idx = vring.avail_idx()?;
        vring.set_avail_entry(avail_idx.0 % vring.capacity, head)?;
        vring.set_avail_idx(avail_idx + Wrapping(1))?;
        vring.desc_mapping()?.sync()?;
        vring.avail_mapping()?.sync()?;

        debug!(
            "queue {}: published descriptor {} with {} bytes",
            index,
            head,
            frame.len()
        );
        Ok(())
    }

    /// Consumer side: processes every frame published on queue `index`
    /// since the last call, invoking `deliver` with each frame's payload.
    ///
    /// Consumed descriptors are recorded on the used ring; the used cursor
    /// is published once after the batch and the call descriptor signalled.
    /// Zero-length and corrupt frames are dropped and counted, never fatal.
    /// Returns the number of frames delivered.
    pub fn drain_available(
        &mut self,
        mem: &MemoryTable,
        index: usize,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<usize> {
        let vring = self.vring_mut(index)?;
        if !vring.ready {
            return Err(Error::NotReady(index));
        }
        let cap = vring.capacity;

        let avail_idx = vring.avail_idx()?;
        let pending = (avail_idx - vring.last_avail_idx).0;
        if pending > cap {
            // The producer's cursor went backwards or jumped by more than
            // the ring can hold.
            return Err(Error::CursorRegressed(index));
        }

        let mut frame = [0u8; BUFFER_SIZE];
        let mut delivered = 0;
        for _ in 0..pending {
            let head = vring.avail_entry(vring.last_avail_idx.0 % cap)?;
            if head >= cap {
                return Err(Error::BadDescriptorIndex(head));
            }

            // Reassemble the chain into one bounded frame.
            let mut total = 0usize;
            let mut truncated = false;
            let mut id = head;
            let mut hops = 0u16;
            loop {
                hops += 1;
                if hops > cap {
                    return Err(Error::BadDescriptorIndex(id));
                }
                let desc = vring.desc_at(id)?;
                let seg = desc.len as usize;
                let take = seg.min(BUFFER_SIZE - total);
                if take > 0 {
                    let buf = mem.translate(desc.addr, take, AddrSpace::GuestPhys)?;
                    buf.read(0, &mut frame[total..total + take])?;
                    total += take;
                }
                if take < seg {
                    truncated = true;
                    break;
                }
                if desc.flags & DESC_F_NEXT != 0 && desc.next != DESC_NONE {
                    if desc.next >= cap {
                        return Err(Error::BadDescriptorIndex(desc.next));
                    }
                    id = desc.next;
                } else {
                    break;
                }
            }

            if truncated {
                warn!(
                    "queue {}: chain at descriptor {} exceeds one frame, truncated",
                    index, head
                );
            }
            if total <= FRAME_HDR_SIZE {
                warn!("queue {}: dropping empty frame from descriptor {}", index, head);
            } else {
                let mut hdr = FrameHeader::default();
                hdr.as_mut_slice().copy_from_slice(&frame[..FRAME_HDR_SIZE]);
                if !hdr.is_zeroed() {
                    warn!("queue {}: frame carries nonzero header {:?}", index, hdr);
                }
                deliver(&frame[FRAME_HDR_SIZE..total]);
                delivered += 1;
            }

            vring.set_used_entry(
                vring.last_used_idx.0 % cap,
                UsedElem {
                    id: u32::from(head),
                    len: total as u32,
                },
            )?;
            vring.last_avail_idx += 1;
            vring.last_used_idx += 1;
        }

        if pending > 0 {
            vring.set_used_idx(vring.last_used_idx)?;
            vring.used_mapping()?.sync()?;
            vring.signal_call()?;
            debug!(
                "queue {}: consumed {} entries, delivered {} frames",
                index, pending, delivered
            );
        }
        Ok(delivered)
    }

    /// Producer side: returns descriptors the consumer has finished with to
    /// the free list. Returns the number of descriptors freed.
    pub fn reclaim_used(&mut self, index: usize) -> Result<usize> {
        let vring = self.vring_mut(index)?;
        if !vring.ready {
            return Err(Error::NotReady(index));
        }
        let cap = vring.capacity;

        let used_idx = vring.used_idx()?;
        let pending = (used_idx - vring.last_used_idx).0;
        if pending > cap {
            return Err(Error::CursorRegressed(index));
        }

        let mut freed = 0;
        for _ in 0..pending {
            let elem = vring.used_entry(vring.last_used_idx.0 % cap)?;
            if elem.id >= u32::from(cap) {
                return Err(Error::BadDescriptorIndex(elem.id as u16));
            }
            let id = elem.id as u16;
            let desc = vring.desc_at(id)?;
            // Reset to full capacity and relink as the new free head.
            vring.write_desc(
                id,
                Descriptor {
                    addr: desc.addr,
                    len: BUFFER_SIZE as u32,
                    flags: DESC_F_WRITE,
                    next: vring.last_avail_idx.0,
                },
            )?;
            vring.last_avail_idx = Wrapping(id);
            vring.last_used_idx += 1;
            freed += 1;
        }

        if freed > 0 {
            debug!("queue {}: reclaimed {} descriptors", index, freed);
        }
        Ok(freed)
    }

    /// Producer side: wakes the consumer of queue `index`.
    pub fn kick(&self, index: usize) -> Result<()> {
        self.vring(index)?.kick()
    }
}

/// Seeds a freshly created per-queue segment: a free-descriptor chain
/// covering the whole buffer pool and zeroed rings. Client-side only; the
/// segment owner runs this once before publishing addresses.
pub fn seed_ring(region: &Mapping, layout: &VringLayout, guest_base: u64) -> Result<()> {
    let cap = layout.capacity();
    for i in 0..cap {
        let next = if i + 1 == cap { DESC_NONE } else { i + 1 };
        region.write_obj(
            layout.desc_table() + i as usize * DESC_ENTRY_SIZE,
            Descriptor {
                addr: guest_base + layout.buffer(i)? as u64,
                len: BUFFER_SIZE as u32,
                flags: DESC_F_WRITE,
                next,
            },
        )?;
    }
    region.zero(layout.avail_ring(), layout.avail_ring_size())?;
    region.zero(layout.used_ring(), layout.used_ring_size())?;
    region.sync()
}

#[cfg(test)]
mod tests {
    use crate::layout::DEFAULT_QUEUE_CAPACITY;
    use crate::mem::tests::test_segment;
    use crate::mem::SharedSegment;
    use crate::table::RegionInfo;

    use super::*;

    const GUEST_BASE: u64 = 0x4000_0000;

    struct Fixture {
        layout: VringLayout,
        map: Mapping,
        mem: MemoryTable,
        _seg: SharedSegment,
    }

    fn fixture(tag: &str, cap: u16) -> Fixture {
        let layout = VringLayout::new(cap).unwrap();
        let seg = test_segment(tag, layout.segment_size());
        let map = seg.map().unwrap();

        let mut mem = MemoryTable::new();
        mem.add_region(
            RegionInfo {
                guest_phys_addr: GUEST_BASE,
                memory_size: layout.segment_size() as u64,
                userspace_addr: GUEST_BASE,
                mmap_offset: 0,
            },
            map.clone(),
        )
        .unwrap();

        seed_ring(&map, &layout, GUEST_BASE).unwrap();
        Fixture {
            layout,
            map,
            mem,
            _seg: seg,
        }
    }

    // Builds one side's view of queue 0 over the shared fixture.
    fn side(f: &Fixture) -> VringTable {
        let mut table = VringTable::new();
        let vring = table.vring_mut(0).unwrap();
        vring.set_capacity(f.layout.capacity()).unwrap();
        vring.set_base(0);
        vring
            .set_rings(
                f.map
                    .subrange(f.layout.desc_table(), f.layout.desc_table_size())
                    .unwrap(),
                f.map
                    .subrange(f.layout.avail_ring(), f.layout.avail_ring_size())
                    .unwrap(),
                f.map
                    .subrange(f.layout.used_ring(), f.layout.used_ring_size())
                    .unwrap(),
            )
            .unwrap();
        table
    }

    fn drain_all(consumer: &mut VringTable, mem: &MemoryTable) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        consumer
            .drain_available(mem, 0, &mut |payload| frames.push(payload.to_vec()))
            .unwrap();
        frames
    }

    #[test]
    fn seeded_ring_is_a_free_chain() {
        let f = fixture("seed", 4);
        let table = side(&f);
        let vring = table.vring(0).unwrap();

        for i in 0..4u16 {
            let desc = vring.desc_at(i).unwrap();
            assert_eq!(desc.len as usize, BUFFER_SIZE);
            assert_eq!(desc.flags, DESC_F_WRITE);
            assert_eq!(desc.next, if i == 3 { DESC_NONE } else { i + 1 });
            assert_eq!(desc.addr, GUEST_BASE + f.layout.buffer(i).unwrap() as u64);
        }
        assert_eq!(vring.avail_idx().unwrap().0, 0);
        assert_eq!(vring.used_idx().unwrap().0, 0);
    }

    #[test]
    fn frames_flow_producer_to_consumer() {
        let f = fixture("flow", DEFAULT_QUEUE_CAPACITY);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        producer.enqueue(&f.mem, 0, b"hello").unwrap();
        producer.enqueue(&f.mem, 0, b"rings").unwrap();

        let frames = drain_all(&mut consumer, &f.mem);
        assert_eq!(frames, vec![b"hello".to_vec(), b"rings".to_vec()]);
    }

    #[test]
    fn free_list_round_trips() {
        let f = fixture("freelist", 4);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        for i in 0..4u8 {
            producer.enqueue(&f.mem, 0, &[i; 10]).unwrap();
        }
        assert!(matches!(
            producer.enqueue(&f.mem, 0, b"x"),
            Err(Error::QueueFull(0))
        ));

        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 4);
        assert_eq!(producer.reclaim_used(0).unwrap(), 4);

        // Freed descriptors come back with full capacity restored.
        let head = producer.vring(0).unwrap().last_avail_idx.0;
        let desc = producer.vring(0).unwrap().desc_at(head).unwrap();
        assert_eq!(desc.len as usize, BUFFER_SIZE);
        assert_eq!(desc.flags, DESC_F_WRITE);

        for i in 0..4u8 {
            producer.enqueue(&f.mem, 0, &[i; 20]).unwrap();
        }
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 4);
    }

    #[test]
    fn drain_is_idempotent() {
        let f = fixture("idem", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        producer.enqueue(&f.mem, 0, b"one").unwrap();
        producer.enqueue(&f.mem, 0, b"two").unwrap();

        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 2);
        assert_eq!(consumer.vring(0).unwrap().base(), 2);

        // No new entries: the second drain is a no-op.
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 0);
        assert_eq!(consumer.vring(0).unwrap().base(), 2);
    }

    #[test]
    fn regressed_avail_cursor_rejected() {
        let f = fixture("regress", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        producer.enqueue(&f.mem, 0, b"a").unwrap();
        producer.enqueue(&f.mem, 0, b"b").unwrap();
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 2);

        // Forge the producer cursor moving backwards.
        f.map
            .write_obj::<u16>(f.layout.avail_ring() + RING_IDX_OFFSET, 0)
            .unwrap();
        assert!(matches!(
            consumer.drain_available(&f.mem, 0, &mut |_| {}),
            Err(Error::CursorRegressed(0))
        ));
    }

    #[test]
    fn regressed_used_cursor_rejected() {
        let f = fixture("regress-used", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        producer.enqueue(&f.mem, 0, b"a").unwrap();
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 1);
        assert_eq!(producer.reclaim_used(0).unwrap(), 1);

        f.map
            .write_obj::<u16>(f.layout.used_ring() + RING_IDX_OFFSET, 0)
            .unwrap();
        assert!(matches!(
            producer.reclaim_used(0),
            Err(Error::CursorRegressed(0))
        ));
    }

    #[test]
    fn oversized_enqueue_leaves_ring_untouched() {
        let f = fixture("oversize", 8);
        let mut producer = side(&f);

        let huge = [0u8; BUFFER_SIZE]; // header makes it overflow
        assert!(matches!(
            producer.enqueue(&f.mem, 0, &huge),
            Err(Error::OversizedFrame { .. })
        ));

        let vring = producer.vring(0).unwrap();
        assert_eq!(vring.avail_idx().unwrap().0, 0);
        assert_eq!(vring.last_avail_idx.0, 0);

        // The ring still works afterwards.
        producer.enqueue(&f.mem, 0, b"fits").unwrap();
    }

    #[test]
    fn two_kicks_one_drain() {
        let f = fixture("kicks", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        let kick = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        producer
            .vring_mut(0)
            .unwrap()
            .set_kick(Some(kick.try_clone().unwrap()));

        producer.enqueue(&f.mem, 0, b"first").unwrap();
        producer.kick(0).unwrap();
        producer.enqueue(&f.mem, 0, b"second").unwrap();
        producer.kick(0).unwrap();

        // Both kicks collapse into one wakeup; one drain sees both frames.
        assert_eq!(kick.read().unwrap(), 2);
        let frames = drain_all(&mut consumer, &f.mem);
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 0);
    }

    #[test]
    fn drain_signals_call_descriptor() {
        let f = fixture("call", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        let call = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        consumer
            .vring_mut(0)
            .unwrap()
            .set_call(Some(call.try_clone().unwrap()));

        producer.enqueue(&f.mem, 0, b"frame").unwrap();
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 1);
        assert_eq!(call.read().unwrap(), 1);
    }

    #[test]
    fn chained_descriptors_reassemble() {
        let f = fixture("chain", 8);
        let table = side(&f);
        let mut consumer = side(&f);
        let vring = table.vring(0).unwrap();

        // Hand-build a two-descriptor chain: header + 3 bytes, then 5 bytes.
        let buf0 = f
            .mem
            .translate(GUEST_BASE + f.layout.buffer(0).unwrap() as u64, BUFFER_SIZE, AddrSpace::GuestPhys)
            .unwrap();
        buf0.zero(0, FRAME_HDR_SIZE).unwrap();
        buf0.write(FRAME_HDR_SIZE, b"abc").unwrap();
        let buf1 = f
            .mem
            .translate(GUEST_BASE + f.layout.buffer(1).unwrap() as u64, BUFFER_SIZE, AddrSpace::GuestPhys)
            .unwrap();
        buf1.write(0, b"defgh").unwrap();

        let mut d0 = vring.desc_at(0).unwrap();
        d0.len = (FRAME_HDR_SIZE + 3) as u32;
        d0.flags = DESC_F_NEXT;
        d0.next = 1;
        vring.write_desc(0, d0).unwrap();
        let mut d1 = vring.desc_at(1).unwrap();
        d1.len = 5;
        d1.flags = 0;
        vring.write_desc(1, d1).unwrap();

        vring.set_avail_entry(0, 0).unwrap();
        vring.set_avail_idx(Wrapping(1)).unwrap();

        let frames = drain_all(&mut consumer, &f.mem);
        assert_eq!(frames, vec![b"abcdefgh".to_vec()]);

        let used = consumer.vring(0).unwrap().used_entry(0).unwrap();
        assert_eq!(used.id, 0);
        assert_eq!(used.len as usize, FRAME_HDR_SIZE + 8);
    }

    #[test]
    fn empty_frames_dropped_but_consumed() {
        let f = fixture("empty", 8);
        let table = side(&f);
        let mut consumer = side(&f);
        let vring = table.vring(0).unwrap();

        // Publish a header-only descriptor: nothing to deliver.
        let mut d0 = vring.desc_at(0).unwrap();
        d0.len = FRAME_HDR_SIZE as u32;
        d0.flags = 0;
        vring.write_desc(0, d0).unwrap();
        vring.set_avail_entry(0, 0).unwrap();
        vring.set_avail_idx(Wrapping(1)).unwrap();

        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 0);
        // The entry was still consumed and recorded as used.
        assert_eq!(consumer.vring(0).unwrap().base(), 1);
        assert_eq!(consumer.vring(0).unwrap().used_idx().unwrap().0, 1);
    }

    #[test]
    fn unready_queue_rejects_operations() {
        let f = fixture("unready", 8);
        let mut table = VringTable::new();
        assert!(matches!(
            table.enqueue(&f.mem, 0, b"x"),
            Err(Error::NotReady(0))
        ));
        assert!(matches!(
            table.drain_available(&f.mem, 0, &mut |_| {}),
            Err(Error::NotReady(0))
        ));
        assert!(matches!(table.reclaim_used(0), Err(Error::NotReady(0))));
        assert!(matches!(table.enqueue(&f.mem, 2, b"x"), Err(Error::InvalidQueue(2))));
    }

    #[test]
    fn stop_reports_cursor_and_blocks_queue() {
        let f = fixture("stop", 8);
        let mut producer = side(&f);
        let mut consumer = side(&f);

        producer.enqueue(&f.mem, 0, b"x").unwrap();
        assert_eq!(drain_all(&mut consumer, &f.mem).len(), 1);

        let base = consumer.vring_mut(0).unwrap().stop();
        assert_eq!(base, 1);
        assert!(matches!(
            consumer.drain_available(&f.mem, 0, &mut |_| {}),
            Err(Error::NotReady(0))
        ));
    }
}
