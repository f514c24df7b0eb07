// SPDX-License-Identifier: Apache-2.0

//! Thin level-triggered epoll wrapper: register a descriptor with a `u64`
//! token, get the ready tokens back from `wait`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::{Error, Result};

const READY_BATCH: usize = 16;

pub struct EpollDispatcher {
    epoll_fd: RawFd,
}

impl EpollDispatcher {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll::create(true).map_err(Error::Epoll)?;
        Ok(EpollDispatcher { epoll_fd })
    }

    /// Starts watching `fd` for readability under `token`.
    pub fn register(&self, fd: RawFd, token: u64) -> Result<()> {
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, token),
        )
        .map_err(Error::Epoll)
    }

    /// Stops watching `fd`.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_DEL,
            fd,
            epoll::Event::new(epoll::Events::empty(), 0),
        )
        .map_err(Error::Epoll)
    }

    /// Blocks until a registered descriptor becomes readable or `timeout_ms`
    /// elapses; returns the ready tokens. An interrupted wait returns an
    /// empty batch so the caller re-checks its running flag.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<u64>> {
        let mut events = [epoll::Event::new(epoll::Events::empty(), 0); READY_BATCH];
        match epoll::wait(self.epoll_fd, timeout_ms, &mut events[..]) {
            Ok(count) => Ok(events[..count].iter().map(|ev| ev.data).collect()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(e) => Err(Error::Epoll(e)),
        }
    }
}

impl AsRawFd for EpollDispatcher {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Drop for EpollDispatcher {
    fn drop(&mut self) {
        // SAFETY: the fd came from epoll::create and is owned by us.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::eventfd::EventFd;

    use super::*;

    #[test]
    fn ready_token_delivered() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        dispatcher.register(event.as_raw_fd(), 7).unwrap();

        assert!(dispatcher.wait(0).unwrap().is_empty());
        event.write(1).unwrap();
        assert_eq!(dispatcher.wait(0).unwrap(), vec![7]);

        // Level-triggered: still ready until drained.
        assert_eq!(dispatcher.wait(0).unwrap(), vec![7]);
        event.read().unwrap();
        assert!(dispatcher.wait(0).unwrap().is_empty());
    }

    #[test]
    fn unregistered_fd_goes_quiet() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        dispatcher.register(event.as_raw_fd(), 1).unwrap();
        event.write(1).unwrap();
        dispatcher.unregister(event.as_raw_fd()).unwrap();
        assert!(dispatcher.wait(0).unwrap().is_empty());
    }
}
