// SPDX-License-Identifier: Apache-2.0

//! Client side of a session: owns the shared-memory segments, seeds the
//! rings, drives the control handshake and then runs the steady loop.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use vhost_proto::message::MemoryRegionDesc;
use vhost_proto::{Frontend, VringConfigData};
use vmm_sys_util::eventfd::EventFd;
use vring::layout::DEFAULT_QUEUE_CAPACITY;
use vring::{
    seed_ring, MemoryTable, RegionInfo, SharedSegment, VringLayout, VringTable, QUEUE_COUNT,
    QUEUE_RX, QUEUE_TX,
};

use crate::reactor::EpollDispatcher;
use crate::{arp_probe_frame, Error, Result};

// Dispatcher tokens for the two descriptors the client waits on: the server
// kicks the receive ring and signals the transmit ring's call descriptor.
const TOKEN_RX_KICK: u64 = 0;
const TOKEN_TX_CALL: u64 = 1;

pub struct VhostClient {
    frontend: Frontend,
    mem: MemoryTable,
    vrings: VringTable,
    regions: Vec<RegionInfo>,
    segments: Vec<SharedSegment>,
    layout: VringLayout,
    dispatcher: EpollDispatcher,
    tx_frames: u64,
    rx_frames: u64,
}

impl VhostClient {
    /// Connects to the server, builds one shared segment per queue and
    /// performs the full handshake. On return both rings are live.
    pub fn new<P: AsRef<Path>>(socket: P, tag: &str) -> Result<Self> {
        let frontend = Frontend::connect(socket)?;
        let layout = VringLayout::new(DEFAULT_QUEUE_CAPACITY)?;

        let mut mem = MemoryTable::new();
        let mut vrings = VringTable::new();
        let mut regions = Vec::with_capacity(QUEUE_COUNT);
        let mut segments = Vec::with_capacity(QUEUE_COUNT);

        for queue in 0..QUEUE_COUNT {
            let name = format!("/{}-{}-q{}", tag, process::id(), queue);
            let segment = SharedSegment::create(&name, layout.segment_size())?;
            let mapping = segment.map()?;
            let base = mapping.host_addr();

            seed_ring(&mapping, &layout, base)?;
            let info = RegionInfo {
                guest_phys_addr: base,
                memory_size: layout.segment_size() as u64,
                userspace_addr: base,
                mmap_offset: 0,
            };
            mem.add_region(info, mapping.clone())?;

            let vring = vrings.vring_mut(queue)?;
            vring.set_capacity(layout.capacity())?;
            vring.set_base(0);
            vring.set_rings(
                mapping.subrange(layout.desc_table(), layout.desc_table_size())?,
                mapping.subrange(layout.avail_ring(), layout.avail_ring_size())?,
                mapping.subrange(layout.used_ring(), layout.used_ring_size())?,
            )?;
            vring.set_kick(Some(
                EventFd::new(libc::EFD_NONBLOCK).map_err(Error::Event)?,
            ));
            vring.set_call(Some(
                EventFd::new(libc::EFD_NONBLOCK).map_err(Error::Event)?,
            ));

            regions.push(info);
            segments.push(segment);
            debug!("queue {queue}: segment {name} seeded at {base:#x}");
        }

        let dispatcher = EpollDispatcher::new()?;
        let mut client = VhostClient {
            frontend,
            mem,
            vrings,
            regions,
            segments,
            layout,
            dispatcher,
            tx_frames: 0,
            rx_frames: 0,
        };
        client.handshake()?;
        client.watch_events()?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<()> {
        self.frontend.set_owner()?;
        let features = self.frontend.get_features()?;
        debug!("negotiated features {features:#x}");
        self.frontend.set_features(features)?;

        let table: Vec<_> = self
            .regions
            .iter()
            .zip(&self.segments)
            .map(|(info, segment)| {
                (
                    MemoryRegionDesc {
                        guest_phys_addr: info.guest_phys_addr,
                        memory_size: info.memory_size,
                        userspace_addr: info.userspace_addr,
                        mmap_offset: info.mmap_offset,
                    },
                    segment.as_raw_fd(),
                )
            })
            .collect();
        self.frontend.set_mem_table(&table)?;

        for queue in 0..QUEUE_COUNT {
            let vring = self.vrings.vring(queue)?;
            let kick = vring.kick_event().map(AsRawFd::as_raw_fd);
            let call = vring.call_event().map(AsRawFd::as_raw_fd);
            let base = self.regions[queue].guest_phys_addr;

            self.frontend
                .set_vring_num(queue as u32, u32::from(self.layout.capacity()))?;
            self.frontend.set_vring_base(queue as u32, 0)?;
            self.frontend.set_vring_kick(queue as u8, kick)?;
            self.frontend.set_vring_call(queue as u8, call)?;
            self.frontend.set_vring_addr(
                queue as u32,
                &VringConfigData {
                    flags: 0,
                    desc_table_addr: base + self.layout.desc_table() as u64,
                    used_ring_addr: base + self.layout.used_ring() as u64,
                    avail_ring_addr: base + self.layout.avail_ring() as u64,
                    log_addr: None,
                },
            )?;
        }
        info!("handshake complete, {QUEUE_COUNT} queues live");
        Ok(())
    }

    fn watch_events(&self) -> Result<()> {
        if let Some(kick) = self.vrings.vring(QUEUE_RX)?.kick_event() {
            self.dispatcher.register(kick.as_raw_fd(), TOKEN_RX_KICK)?;
        }
        if let Some(call) = self.vrings.vring(QUEUE_TX)?.call_event() {
            self.dispatcher.register(call.as_raw_fd(), TOKEN_TX_CALL)?;
        }
        Ok(())
    }

    /// Publishes one frame on the transmit ring and kicks the server.
    /// Reclaims already-consumed descriptors first so a full ring recovers
    /// as soon as the server has drained it.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.vrings.reclaim_used(QUEUE_TX)?;
        self.vrings.enqueue(&self.mem, QUEUE_TX, frame)?;
        self.vrings.kick(QUEUE_TX)?;
        self.tx_frames += 1;
        Ok(())
    }

    /// Delivers every frame the server has published on the receive ring.
    pub fn drain_receive(&mut self, deliver: &mut dyn FnMut(&[u8])) -> Result<usize> {
        let count = self.vrings.drain_available(&self.mem, QUEUE_RX, deliver)?;
        self.rx_frames += count as u64;
        Ok(count)
    }

    /// One iteration of the steady loop: waits up to `timeout_ms` for a
    /// receive kick or a transmit call, and on a quiet tick publishes the
    /// self-test probe frame.
    pub fn step(&mut self, timeout_ms: i32) -> Result<()> {
        let ready = self.dispatcher.wait(timeout_ms)?;
        if ready.is_empty() {
            match self.send_frame(&arp_probe_frame()) {
                Ok(()) => {}
                Err(Error::Ring(vring::Error::QueueFull(_))) => {
                    warn!("transmit ring full, probe skipped");
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        for token in ready {
            match token {
                TOKEN_RX_KICK => {
                    self.consume_event(QUEUE_RX)?;
                    let count =
                        self.drain_receive(&mut |frame| debug!("rx frame, {} bytes", frame.len()))?;
                    debug!("receive kick: {count} frames");
                }
                TOKEN_TX_CALL => {
                    self.consume_event(QUEUE_TX)?;
                    let freed = self.vrings.reclaim_used(QUEUE_TX)?;
                    debug!("transmit call: {freed} descriptors reclaimed");
                }
                other => warn!("spurious event token {other}"),
            }
        }
        Ok(())
    }

    // Clears the level-triggered readable state of the queue's waited-on
    // descriptor. A racing empty read is not an error.
    fn consume_event(&self, queue: usize) -> Result<()> {
        let vring = self.vrings.vring(queue)?;
        let event = if queue == QUEUE_RX {
            vring.kick_event()
        } else {
            vring.call_event()
        };
        if let Some(event) = event {
            if let Err(e) = event.read() {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(Error::Event(e));
                }
            }
        }
        Ok(())
    }

    /// Steady loop until `stop` is raised, then orderly teardown.
    pub fn run(&mut self, stop: &AtomicBool, poll_ms: i32) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.step(poll_ms)?;
        }
        if let Err(e) = self.shutdown() {
            warn!("teardown incomplete: {e}");
        }
        Ok(())
    }

    /// Stops both rings on the server and releases device ownership.
    pub fn shutdown(&mut self) -> Result<()> {
        for queue in 0..QUEUE_COUNT {
            let base = self.frontend.get_vring_base(queue as u32)?;
            debug!("queue {queue} stopped at cursor {base}");
        }
        self.frontend.reset_owner()?;
        info!(
            "session closed: {} frames sent, {} received",
            self.tx_frames, self.rx_frames
        );
        Ok(())
    }

    /// Frames sent and received so far.
    pub fn counters(&self) -> (u64, u64) {
        (self.tx_frames, self.rx_frames)
    }
}
