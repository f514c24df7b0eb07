// SPDX-License-Identifier: Apache-2.0

//! Framed transport over a connected Unix stream socket: a fixed header plus
//! an exact-length payload per message, with file descriptors carried as
//! ancillary data on the same send.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::warn;
use vm_memory::ByteValued;

use super::message::{MsgHeader, MAX_ATTACHED_FD_ENTRIES, MAX_MSG_SIZE};
use super::sock_ctrl_msg::{take_files, ScmSocket};
use super::{Error, Result};

/// Listening side of the control socket. The bound path is removed again
/// when the listener is dropped.
pub struct Listener {
    fd: UnixListener,
    path: PathBuf,
}

impl Listener {
    /// Binds a new listener, replacing any stale socket file at `path`.
    pub fn new<P: AsRef<Path>>(path: P, unlink: bool) -> Result<Self> {
        if unlink {
            let _ = std::fs::remove_file(&path);
        }
        let fd = UnixListener::bind(&path).map_err(Error::SocketError)?;
        Ok(Listener {
            fd,
            path: path.as_ref().to_owned(),
        })
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is ready on a non-blocking
    /// listener or the attempt was aborted by the peer.
    pub fn accept(&self) -> Result<Option<Endpoint>> {
        loop {
            match self.fd.accept() {
                Ok((sock, _addr)) => return Ok(Some(Endpoint::from_stream(sock))),
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock => return Ok(None),
                    std::io::ErrorKind::ConnectionAborted => return Ok(None),
                    std::io::ErrorKind::Interrupted => continue,
                    _ => return Err(Error::SocketError(e)),
                },
            }
        }
    }

    /// Switches the listener between blocking and non-blocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.fd
            .set_nonblocking(nonblocking)
            .map_err(Error::SocketError)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One end of an established control connection.
pub struct Endpoint {
    sock: UnixStream,
}

impl Endpoint {
    /// Connects to the server listening at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let sock = UnixStream::connect(path).map_err(Error::SocketError)?;
        Ok(Endpoint::from_stream(sock))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(sock: UnixStream) -> Self {
        Endpoint { sock }
    }

    fn send_iovec(&mut self, iovs: &[&[u8]], fds: Option<&[RawFd]>) -> Result<usize> {
        let rfds = fds.unwrap_or(&[]);
        self.sock.send_with_fds(iovs, rfds).map_err(Into::into)
    }

    /// Sends a bodyless message.
    pub fn send_header(&mut self, hdr: &MsgHeader, fds: Option<&[RawFd]>) -> Result<()> {
        let bytes = self.send_iovec(&[hdr.as_slice()], fds)?;
        if bytes != MsgHeader::SIZE {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Sends a header and body in a single gathered write.
    pub fn send_message<T: ByteValued>(
        &mut self,
        hdr: &MsgHeader,
        body: &T,
        fds: Option<&[RawFd]>,
    ) -> Result<()> {
        let expect = MsgHeader::SIZE + std::mem::size_of::<T>();
        let bytes = self.send_iovec(&[hdr.as_slice(), body.as_slice()], fds)?;
        if bytes != expect {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Sends a header, body and trailing payload in a single gathered write.
    pub fn send_message_with_payload<T: ByteValued>(
        &mut self,
        hdr: &MsgHeader,
        body: &T,
        payload: &[u8],
        fds: Option<&[RawFd]>,
    ) -> Result<()> {
        let total = std::mem::size_of::<T>() + payload.len();
        if total > MAX_MSG_SIZE {
            return Err(Error::OversizedMsg);
        }
        let expect = MsgHeader::SIZE + total;
        let bytes = self.send_iovec(&[hdr.as_slice(), body.as_slice(), payload], fds)?;
        if bytes != expect {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Receives the fixed header of the next message along with any attached
    /// file descriptors.
    ///
    /// Descriptors are wrapped in `File` immediately so every subsequent
    /// error path closes them. A zero-byte read here means the peer closed
    /// the connection in an orderly way.
    pub fn recv_header(&mut self) -> Result<(MsgHeader, Vec<File>)> {
        let mut hdr = MsgHeader::default();
        let mut fd_buf = [0 as RawFd; MAX_ATTACHED_FD_ENTRIES];
        let res = self
            .sock
            .recv_with_fds(hdr.as_mut_slice(), &mut fd_buf)
            .map_err(Error::from)?;
        let files = take_files(&fd_buf[..res.fd_count]);

        if res.bytes == 0 {
            return Err(Error::Disconnected);
        }
        if res.truncated {
            warn!("control message with truncated ancillary data");
            return Err(Error::IncorrectFds);
        }
        if res.bytes != MsgHeader::SIZE {
            return Err(Error::PartialMessage);
        }
        if !hdr.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok((hdr, files))
    }

    fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.sock.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::PartialMessage
            } else {
                Error::SocketError(e)
            }
        })
    }

    /// Reads exactly `len` raw payload bytes following a header.
    pub fn recv_data(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_MSG_SIZE {
            return Err(Error::OversizedMsg);
        }
        let mut buf = vec![0u8; len];
        self.read_exact_buf(&mut buf)?;
        Ok(buf)
    }

    /// Reads a payload of exactly one `T`.
    pub fn recv_body<T: ByteValued + Default>(&mut self) -> Result<T> {
        let mut body = T::default();
        self.read_exact_buf(body.as_mut_slice())?;
        Ok(body)
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use vmm_sys_util::eventfd::EventFd;
    use vmm_sys_util::tempdir::TempDir;

    use super::super::message::{HeaderFlags, Request, U64Msg};
    use super::*;

    fn pair() -> (Endpoint, Endpoint) {
        let (a, b) = UnixStream::pair().unwrap();
        (Endpoint::from_stream(a), Endpoint::from_stream(b))
    }

    #[test]
    fn create_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("ctl.sock");
        let listener = Listener::new(&path, true).unwrap();
        listener.set_nonblocking(true).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn listener_unlinks_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("ctl.sock");
        {
            let _listener = Listener::new(&path, true).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn accept_connection() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("ctl.sock");
        let listener = Listener::new(&path, true).unwrap();
        let _client = Endpoint::connect(&path).unwrap();
        assert!(listener.accept().unwrap().is_some());
    }

    #[test]
    fn send_recv_header_and_body() {
        let (mut tx, mut rx) = pair();

        let hdr = MsgHeader::new(Request::SetFeatures, HeaderFlags::empty(), 8);
        let body = U64Msg::new(0xdead_beef);
        tx.send_message(&hdr, &body, None).unwrap();

        let (rhdr, files) = rx.recv_header().unwrap();
        assert_eq!(rhdr, hdr);
        assert!(files.is_empty());
        let rbody: U64Msg = rx.recv_body().unwrap();
        assert_eq!(rbody, body);
    }

    #[test]
    fn send_recv_with_payload() {
        let (mut tx, mut rx) = pair();

        let payload = [0x11u8; 48];
        let body = U64Msg::new(2);
        let hdr = MsgHeader::new(
            Request::SetMemTable,
            HeaderFlags::empty(),
            (std::mem::size_of::<U64Msg>() + payload.len()) as u32,
        );
        tx.send_message_with_payload(&hdr, &body, &payload, None)
            .unwrap();

        let (rhdr, _) = rx.recv_header().unwrap();
        let data = rx.recv_data(rhdr.size() as usize).unwrap();
        assert_eq!(data.len(), 56);
        assert_eq!(&data[8..], &payload[..]);
    }

    #[test]
    fn fds_ride_along_with_header() {
        let (mut tx, mut rx) = pair();

        let evt = EventFd::new(0).unwrap();
        let hdr = MsgHeader::new(Request::SetVringKick, HeaderFlags::empty(), 8);
        let body = U64Msg::vring_fd(0, true);
        tx.send_message(&hdr, &body, Some(&[evt.as_raw_fd()]))
            .unwrap();

        let (rhdr, files) = rx.recv_header().unwrap();
        assert_eq!(rhdr.request(), Some(Request::SetVringKick));
        assert_eq!(files.len(), 1);
        let _body: U64Msg = rx.recv_body().unwrap();

        evt.write(7).unwrap();
        let mut raw = [0u8; 8];
        (&files[0]).read_exact(&mut raw).unwrap();
        assert_eq!(u64::from_le_bytes(raw), 7);
    }

    #[test]
    fn disconnect_is_orderly() {
        let (tx, mut rx) = pair();
        drop(tx);
        assert!(matches!(rx.recv_header(), Err(Error::Disconnected)));
    }

    #[test]
    fn garbage_header_rejected() {
        let (mut tx, mut rx) = pair();
        let hdr = MsgHeader::default();
        tx.send_header(&hdr, None).unwrap();
        assert!(matches!(rx.recv_header(), Err(Error::InvalidMessage)));
    }
}
