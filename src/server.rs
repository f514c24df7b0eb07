// SPDX-License-Identifier: Apache-2.0

//! Server side of a session: dispatches the control protocol into session
//! state, maps the client's shared memory, and echoes frames drained from
//! the transmit ring back into the receive ring.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use vhost_proto::message::{MemoryRegionDesc, VringAddrMsg};
use vhost_proto::{BackendHandler, BackendListener, BackendServer};
use vmm_sys_util::eventfd::EventFd;
use vring::{
    AddrSpace, Descriptor, MemoryTable, RegionInfo, UsedElem, VringTable, QUEUE_COUNT, QUEUE_RX,
    QUEUE_TX,
};

use crate::reactor::EpollDispatcher;
use crate::Result;

const TOKEN_LISTENER: u64 = 0;
const TOKEN_CONTROL: u64 = 1;
const TOKEN_TX_KICK: u64 = 2;
const TOKEN_RX_CALL: u64 = 3;

// Frames buffered between draining the transmit ring and finding room on
// the receive ring.
const PENDING_LIMIT: usize = 1024;

/// Where the session is in its lifecycle. Control messages that arrive out
/// of order are refused without killing the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    MemoryBound,
    QueueReady,
    Running,
    Closed,
}

/// Per-connection state mutated by the control dispatch.
struct Session {
    state: SessionState,
    features: u64,
    mem: MemoryTable,
    vrings: VringTable,
    dispatcher: Rc<EpollDispatcher>,
    pending: VecDeque<Vec<u8>>,
    forwarded: u64,
}

impl Session {
    fn new(dispatcher: Rc<EpollDispatcher>) -> Self {
        Session {
            state: SessionState::Created,
            features: 0,
            mem: MemoryTable::new(),
            vrings: VringTable::new(),
            dispatcher,
            pending: VecDeque::new(),
            forwarded: 0,
        }
    }

    fn require(&self, wanted: &[SessionState]) -> vhost_proto::Result<()> {
        if wanted.contains(&self.state) {
            Ok(())
        } else {
            error!("request refused in state {:?}", self.state);
            Err(vhost_proto::Error::InvalidOperation)
        }
    }

    fn vring_queue(&mut self, index: u32) -> vhost_proto::Result<&mut vring::Vring> {
        self.vrings
            .vring_mut(index as usize)
            .map_err(|_| vhost_proto::Error::InvalidParam)
    }

    /// Moves every frame waiting on the transmit ring into the pending
    /// buffer, then flushes as much of the buffer as the receive ring has
    /// room for, kicking the client once per flushed batch.
    fn forward(&mut self) -> Result<()> {
        if !self.vrings.all_ready() {
            return Ok(());
        }
        if self.state == SessionState::QueueReady {
            self.state = SessionState::Running;
            info!("session running");
        }

        let mem = &self.mem;
        let pending = &mut self.pending;
        self.vrings.drain_available(mem, QUEUE_TX, &mut |frame| {
            if pending.len() < PENDING_LIMIT {
                pending.push_back(frame.to_vec());
            } else {
                warn!("pending buffer full, frame dropped");
            }
        })?;

        self.vrings.reclaim_used(QUEUE_RX)?;
        let mut sent = 0;
        while let Some(frame) = self.pending.front() {
            match self.vrings.enqueue(&self.mem, QUEUE_RX, frame) {
                Ok(()) => {
                    self.pending.pop_front();
                    sent += 1;
                }
                Err(vring::Error::QueueFull(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if sent > 0 {
            self.forwarded += sent;
            self.vrings.kick(QUEUE_RX)?;
            debug!("echoed {sent} frames to the receive ring");
        }
        Ok(())
    }

    // Clears the readable state of a waited-on descriptor.
    fn consume_event(&self, queue: usize, kick: bool) {
        let event = match self.vrings.vring(queue) {
            Ok(vring) if kick => vring.kick_event(),
            Ok(vring) => vring.call_event(),
            Err(_) => None,
        };
        if let Some(event) = event {
            let _ = event.read();
        }
    }

    fn unwatch(&self, fd: RawFd) {
        if let Err(e) = self.dispatcher.unregister(fd) {
            warn!("dropping event watch failed: {e}");
        }
    }

    /// Releases everything the connection negotiated.
    fn teardown(&mut self) {
        if let Ok(vring) = self.vrings.vring(QUEUE_TX) {
            if let Some(kick) = vring.kick_event() {
                self.unwatch(kick.as_raw_fd());
            }
        }
        if let Ok(vring) = self.vrings.vring(QUEUE_RX) {
            if let Some(call) = vring.call_event() {
                self.unwatch(call.as_raw_fd());
            }
        }
        self.vrings.reset();
        self.mem.clear();
        self.pending.clear();
        self.state = SessionState::Closed;
        info!("session closed, {} frames forwarded", self.forwarded);
    }
}

fn event_from_file(file: File) -> EventFd {
    // SAFETY: the fd was received over the control socket and is exclusively
    // owned by `file`; ownership moves into the EventFd.
    unsafe { EventFd::from_raw_fd(file.into_raw_fd()) }
}

impl BackendHandler for Session {
    fn set_owner(&mut self) -> vhost_proto::Result<()> {
        self.require(&[SessionState::Created])?;
        self.state = SessionState::Negotiating;
        Ok(())
    }

    fn reset_owner(&mut self) -> vhost_proto::Result<()> {
        self.teardown();
        Ok(())
    }

    fn get_features(&mut self) -> vhost_proto::Result<u64> {
        self.require(&[SessionState::Created, SessionState::Negotiating])?;
        Ok(self.features)
    }

    fn set_features(&mut self, features: u64) -> vhost_proto::Result<()> {
        self.require(&[SessionState::Negotiating, SessionState::MemoryBound])?;
        self.features = features;
        Ok(())
    }

    fn set_mem_table(
        &mut self,
        regions: &[MemoryRegionDesc],
        files: Vec<File>,
    ) -> vhost_proto::Result<()> {
        self.require(&[SessionState::Negotiating, SessionState::MemoryBound])?;
        self.mem.clear();
        for (desc, file) in regions.iter().zip(files) {
            let info = RegionInfo {
                guest_phys_addr: desc.guest_phys_addr,
                memory_size: desc.memory_size,
                userspace_addr: desc.userspace_addr,
                mmap_offset: desc.mmap_offset,
            };
            self.mem.add_mapped_region(info, file).map_err(|e| {
                error!("mapping region failed: {e}");
                vhost_proto::Error::InvalidParam
            })?;
        }
        self.state = SessionState::MemoryBound;
        Ok(())
    }

    fn set_log_base(&mut self, base: u64, _file: Option<File>) -> vhost_proto::Result<()> {
        debug!("log base {base:#x} ignored");
        Ok(())
    }

    fn set_log_fd(&mut self, _file: File) -> vhost_proto::Result<()> {
        debug!("log fd ignored");
        Ok(())
    }

    fn set_vring_num(&mut self, index: u32, num: u32) -> vhost_proto::Result<()> {
        let capacity = u16::try_from(num).map_err(|_| vhost_proto::Error::InvalidParam)?;
        self.vring_queue(index)?
            .set_capacity(capacity)
            .map_err(|_| vhost_proto::Error::InvalidParam)
    }

    fn set_vring_addr(&mut self, index: u32, addr: &VringAddrMsg) -> vhost_proto::Result<()> {
        self.require(&[SessionState::MemoryBound, SessionState::QueueReady])?;
        let capacity = self.vring_queue(index)?.capacity() as usize;
        if capacity == 0 {
            return Err(vhost_proto::Error::InvalidOperation);
        }

        let desc_len = capacity * std::mem::size_of::<Descriptor>();
        let avail_len = 4 + 2 * capacity;
        let used_len = 4 + std::mem::size_of::<UsedElem>() * capacity;
        let translate = |target: u64, len: usize| {
            self.mem.translate(target, len, AddrSpace::User).map_err(|e| {
                error!("vring address {target:#x} outside negotiated memory: {e}");
                vhost_proto::Error::InvalidParam
            })
        };
        let desc = translate(addr.descriptor, desc_len)?;
        let avail = translate(addr.available, avail_len)?;
        let used = translate(addr.used, used_len)?;

        self.vring_queue(index)?
            .set_rings(desc, avail, used)
            .map_err(|_| vhost_proto::Error::InvalidParam)?;
        if self.vrings.all_ready() {
            self.state = SessionState::QueueReady;
        }
        Ok(())
    }

    fn set_vring_base(&mut self, index: u32, base: u32) -> vhost_proto::Result<()> {
        let base = u16::try_from(base).map_err(|_| vhost_proto::Error::InvalidParam)?;
        self.vring_queue(index)?.set_base(base);
        Ok(())
    }

    fn get_vring_base(&mut self, index: u32) -> vhost_proto::Result<u32> {
        let queue = index as usize;
        let vring = self.vring_queue(index)?;
        let base = vring.stop();
        if queue == QUEUE_TX {
            if let Some(kick) = vring.kick_event() {
                let fd = kick.as_raw_fd();
                self.unwatch(fd);
            }
        }
        debug!("queue {queue} stopped at cursor {base}");
        Ok(u32::from(base))
    }

    fn set_vring_kick(&mut self, index: u8, file: Option<File>) -> vhost_proto::Result<()> {
        let queue = usize::from(index);
        match file {
            Some(file) => {
                let event = event_from_file(file);
                let fd = event.as_raw_fd();
                self.vring_queue(u32::from(index))?.set_kick(Some(event));
                // The server only waits on the transmit kick; the receive
                // kick is the one it writes.
                if queue == QUEUE_TX {
                    self.dispatcher.register(fd, TOKEN_TX_KICK).map_err(|e| {
                        error!("watching kick descriptor failed: {e}");
                        vhost_proto::Error::InvalidOperation
                    })?;
                }
            }
            None => {
                self.vring_queue(u32::from(index))?.set_kick(None);
                info!("queue {queue} has no kick descriptor, polling");
            }
        }
        Ok(())
    }

    fn set_vring_call(&mut self, index: u8, file: Option<File>) -> vhost_proto::Result<()> {
        let queue = usize::from(index);
        match file {
            Some(file) => {
                let event = event_from_file(file);
                let fd = event.as_raw_fd();
                self.vring_queue(u32::from(index))?.set_call(Some(event));
                if queue == QUEUE_RX {
                    self.dispatcher.register(fd, TOKEN_RX_CALL).map_err(|e| {
                        error!("watching call descriptor failed: {e}");
                        vhost_proto::Error::InvalidOperation
                    })?;
                }
            }
            None => self.vring_queue(u32::from(index))?.set_call(None),
        }
        Ok(())
    }

    fn set_vring_err(&mut self, index: u8, file: Option<File>) -> vhost_proto::Result<()> {
        self.vring_queue(u32::from(index))?
            .set_err(file.map(event_from_file));
        Ok(())
    }
}

/// One-session-at-a-time server loop.
pub struct VhostServer {
    listener: BackendListener,
    dispatcher: Rc<EpollDispatcher>,
    backend: Option<BackendServer<Session>>,
}

impl VhostServer {
    /// Binds the control socket and starts listening.
    pub fn new<P: AsRef<Path>>(socket: P) -> Result<Self> {
        let listener = BackendListener::new(socket, true)?;
        listener.set_nonblocking(true)?;
        let dispatcher = Rc::new(EpollDispatcher::new()?);
        dispatcher.register(listener.as_raw_fd(), TOKEN_LISTENER)?;
        Ok(VhostServer {
            listener,
            dispatcher,
            backend: None,
        })
    }

    /// The state of the current session, if one is connected.
    pub fn session_state(&self) -> Option<SessionState> {
        self.backend.as_ref().map(|b| b.handler().state)
    }

    /// Frames echoed back to the client so far.
    pub fn forwarded(&self) -> u64 {
        self.backend.as_ref().map_or(0, |b| b.handler().forwarded)
    }

    fn on_accept(&mut self) -> Result<()> {
        let session = Session::new(self.dispatcher.clone());
        match self.listener.accept(session)? {
            Some(backend) if self.backend.is_none() => {
                self.dispatcher
                    .register(backend.as_raw_fd(), TOKEN_CONTROL)?;
                info!("client connected");
                self.backend = Some(backend);
            }
            Some(_extra) => warn!("busy with a session, extra connection refused"),
            None => {}
        }
        Ok(())
    }

    fn close_session(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = self.dispatcher.unregister(backend.as_raw_fd()) {
                warn!("dropping control watch failed: {e}");
            }
            backend.handler_mut().teardown();
        }
    }

    fn on_control(&mut self) -> Result<()> {
        let Some(backend) = &mut self.backend else {
            return Ok(());
        };
        match backend.handle_request() {
            Ok(()) => {
                if backend.handler().state == SessionState::Closed {
                    self.close_session();
                }
                Ok(())
            }
            Err(vhost_proto::Error::Disconnected) => {
                info!("client disconnected");
                self.close_session();
                Ok(())
            }
            Err(e) => {
                error!("control channel failed: {e}");
                self.close_session();
                Ok(())
            }
        }
    }

    fn with_session(&mut self, op: impl FnOnce(&mut Session) -> Result<()>) -> Result<()> {
        match self.backend.as_mut() {
            Some(backend) => op(backend.handler_mut()),
            None => Ok(()),
        }
    }

    /// One iteration of the server loop: accept, dispatch control traffic,
    /// and move frames. Quiet ticks still pump polling-mode queues and any
    /// frames waiting for receive-ring room.
    pub fn step(&mut self, timeout_ms: i32) -> Result<()> {
        let ready = self.dispatcher.wait(timeout_ms)?;
        if ready.is_empty() {
            return self.with_session(|session| {
                if session.vrings.all_ready() {
                    session.forward()?;
                }
                Ok(())
            });
        }

        for token in ready {
            match token {
                TOKEN_LISTENER => self.on_accept()?,
                TOKEN_CONTROL => self.on_control()?,
                TOKEN_TX_KICK => self.with_session(|session| {
                    session.consume_event(QUEUE_TX, true);
                    session.forward()
                })?,
                TOKEN_RX_CALL => self.with_session(|session| {
                    session.consume_event(QUEUE_RX, false);
                    session.vrings.reclaim_used(QUEUE_RX)?;
                    session.forward()
                })?,
                other => warn!("spurious event token {other}"),
            }
        }
        Ok(())
    }

    /// Serves until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool, poll_ms: i32) -> Result<()> {
        info!("serving {QUEUE_COUNT} queues per session");
        while !stop.load(Ordering::Relaxed) {
            self.step(poll_ms)?;
        }
        self.close_session();
        Ok(())
    }
}
