// SPDX-License-Identifier: Apache-2.0

//! Server (device back-end) role of the control protocol: receives one
//! request at a time, validates framing, descriptor counts and payload
//! sizes, then dispatches to a [`BackendHandler`] implementation.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::{debug, error};
use vm_memory::ByteValued;

use super::connection::{Endpoint, Listener};
use super::message::{
    MemoryHeader, MemoryRegionDesc, MsgHeader, MsgValidator, Request, U64Msg, VringAddrMsg,
    VringStateMsg,
};
use super::{Error, Result};

/// Session mutations driven by inbound control requests.
///
/// One implementation owns all per-session state (memory table, vrings);
/// the dispatcher borrows it mutably for each request, so no locking is
/// involved.
pub trait BackendHandler {
    /// SET_OWNER: the peer claims the session.
    fn set_owner(&mut self) -> Result<()>;
    /// RESET_OWNER: drop all session state.
    fn reset_owner(&mut self) -> Result<()>;
    /// GET_FEATURES: report supported feature bits.
    fn get_features(&mut self) -> Result<u64>;
    /// SET_FEATURES: the peer acknowledges feature bits.
    fn set_features(&mut self, features: u64) -> Result<()>;
    /// SET_MEM_TABLE: map the shared regions, one descriptor per region.
    fn set_mem_table(&mut self, regions: &[MemoryRegionDesc], files: Vec<File>) -> Result<()>;
    /// SET_LOG_BASE.
    fn set_log_base(&mut self, base: u64, file: Option<File>) -> Result<()>;
    /// SET_LOG_FD.
    fn set_log_fd(&mut self, file: File) -> Result<()>;
    /// SET_VRING_NUM: queue capacity.
    fn set_vring_num(&mut self, index: u32, num: u32) -> Result<()>;
    /// SET_VRING_ADDR: ring addresses in the peer's address space.
    fn set_vring_addr(&mut self, index: u32, addr: &VringAddrMsg) -> Result<()>;
    /// SET_VRING_BASE: starting cursor.
    fn set_vring_base(&mut self, index: u32, base: u32) -> Result<()>;
    /// GET_VRING_BASE: stop the queue, report the current cursor.
    fn get_vring_base(&mut self, index: u32) -> Result<u32>;
    /// SET_VRING_KICK; `file` is `None` when the queue falls back to polling.
    fn set_vring_kick(&mut self, index: u8, file: Option<File>) -> Result<()>;
    /// SET_VRING_CALL.
    fn set_vring_call(&mut self, index: u8, file: Option<File>) -> Result<()>;
    /// SET_VRING_ERR.
    fn set_vring_err(&mut self, index: u8, file: Option<File>) -> Result<()>;
}

/// Accepts one control connection and hands it to a dispatcher.
pub struct BackendListener {
    listener: Listener,
}

impl BackendListener {
    /// Binds the server socket at `path`.
    pub fn new<P: AsRef<Path>>(path: P, unlink: bool) -> Result<Self> {
        Ok(BackendListener {
            listener: Listener::new(path, unlink)?,
        })
    }

    /// Accepts one pending connection, if any.
    pub fn accept<S: BackendHandler>(&self, handler: S) -> Result<Option<BackendServer<S>>> {
        Ok(self
            .listener
            .accept()?
            .map(|ep| BackendServer::new(ep, handler)))
    }

    /// Switches between blocking and non-blocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }
}

impl AsRawFd for BackendListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Server endpoint of an established session.
pub struct BackendServer<S: BackendHandler> {
    ep: Endpoint,
    handler: S,
}

impl<S: BackendHandler> BackendServer<S> {
    /// Wraps a connected endpoint and the session state it will mutate.
    pub fn new(ep: Endpoint, handler: S) -> Self {
        BackendServer { ep, handler }
    }

    /// The session state owned by this dispatcher.
    pub fn handler(&self) -> &S {
        &self.handler
    }

    /// Mutable access to the session state, for the owner's event loop.
    pub fn handler_mut(&mut self) -> &mut S {
        &mut self.handler
    }

    /// Consumes the dispatcher, returning the session state.
    pub fn into_handler(self) -> S {
        self.handler
    }

    /// Receives and dispatches exactly one request.
    ///
    /// `Err(Disconnected)` reports an orderly hang-up; other errors are
    /// protocol or transport failures fatal to the session.
    pub fn handle_request(&mut self) -> Result<()> {
        let (hdr, files) = self.ep.recv_header()?;
        let req = hdr.request().ok_or(Error::InvalidMessage)?;
        let size = hdr.size() as usize;

        // Stray descriptors on a request that takes none are a protocol
        // violation; the Files just received close on return.
        if !files.is_empty() && !req.may_carry_fds() {
            error!("unexpected descriptors on {:?}", req);
            return Err(Error::IncorrectFds);
        }

        debug!("processing {:?}, payload {} bytes", req, size);
        match req {
            Request::Noop | Request::MaxCmd => Err(Error::InvalidMessage),
            Request::SetOwner => {
                Self::check_size(size, 0)?;
                self.handler.set_owner()
            }
            Request::ResetOwner => {
                Self::check_size(size, 0)?;
                self.handler.reset_owner()
            }
            Request::GetFeatures => {
                Self::check_size(size, 0)?;
                let features = self.handler.get_features()?;
                self.send_reply(&hdr, &U64Msg::new(features))
            }
            Request::SetFeatures => {
                let body: U64Msg = self.recv_sized(size)?;
                self.handler.set_features(body.value)
            }
            Request::SetMemTable => self.do_set_mem_table(size, files),
            Request::SetLogBase => {
                let body: U64Msg = self.recv_sized(size)?;
                self.handler.set_log_base(body.value, files.into_iter().next())
            }
            Request::SetLogFd => {
                Self::check_size(size, 0)?;
                let file = Self::exactly_one(files)?;
                self.handler.set_log_fd(file)
            }
            Request::SetVringNum => {
                let body: VringStateMsg = self.recv_sized(size)?;
                self.handler.set_vring_num(body.index, body.num)
            }
            Request::SetVringAddr => {
                let body: VringAddrMsg = self.recv_sized(size)?;
                self.handler.set_vring_addr(body.index, &body)
            }
            Request::SetVringBase => {
                let body: VringStateMsg = self.recv_sized(size)?;
                self.handler.set_vring_base(body.index, body.num)
            }
            Request::GetVringBase => {
                let body: VringStateMsg = self.recv_sized(size)?;
                let num = self.handler.get_vring_base(body.index)?;
                self.send_reply(
                    &hdr,
                    &VringStateMsg {
                        index: body.index,
                        num,
                    },
                )
            }
            Request::SetVringKick => {
                let (index, file) = self.recv_vring_fd(size, files)?;
                self.handler.set_vring_kick(index, file)
            }
            Request::SetVringCall => {
                let (index, file) = self.recv_vring_fd(size, files)?;
                self.handler.set_vring_call(index, file)
            }
            Request::SetVringErr => {
                let (index, file) = self.recv_vring_fd(size, files)?;
                self.handler.set_vring_err(index, file)
            }
        }
    }

    fn do_set_mem_table(&mut self, size: usize, files: Vec<File>) -> Result<()> {
        let hdr_len = std::mem::size_of::<MemoryHeader>();
        let region_len = std::mem::size_of::<MemoryRegionDesc>();
        if size < hdr_len {
            return Err(Error::InvalidMessage);
        }

        let data = self.ep.recv_data(size)?;
        let mut mem_hdr = MemoryHeader::default();
        mem_hdr.as_mut_slice().copy_from_slice(&data[..hdr_len]);
        let num = mem_hdr.num_regions as usize;
        if !mem_hdr.is_valid()
            || size != hdr_len + num * region_len
            || files.len() != num
        {
            error!(
                "malformed memory table: {} regions, {} descriptors, {} bytes",
                num,
                files.len(),
                size
            );
            return Err(Error::InvalidMessage);
        }

        let mut regions = Vec::with_capacity(num);
        for chunk in data[hdr_len..].chunks_exact(region_len) {
            let mut desc = MemoryRegionDesc::default();
            desc.as_mut_slice().copy_from_slice(chunk);
            if !desc.is_valid() {
                return Err(Error::InvalidMessage);
            }
            regions.push(desc);
        }

        self.handler.set_mem_table(&regions, files)
    }

    // Reads the packed vring-fd payload and checks the descriptor count
    // against the announced validity bit.
    fn recv_vring_fd(&mut self, size: usize, files: Vec<File>) -> Result<(u8, Option<File>)> {
        let body: U64Msg = self.recv_sized(size)?;
        if body.no_fd() {
            if !files.is_empty() {
                return Err(Error::IncorrectFds);
            }
            return Ok((body.queue_index(), None));
        }
        let file = Self::exactly_one(files)?;
        Ok((body.queue_index(), Some(file)))
    }

    fn exactly_one(files: Vec<File>) -> Result<File> {
        let mut iter = files.into_iter();
        match (iter.next(), iter.next()) {
            (Some(file), None) => Ok(file),
            _ => Err(Error::IncorrectFds),
        }
    }

    fn check_size(got: usize, expect: usize) -> Result<()> {
        if got != expect {
            return Err(Error::InvalidMessage);
        }
        Ok(())
    }

    fn recv_sized<T: ByteValued + Default + MsgValidator>(&mut self, size: usize) -> Result<T> {
        if size != std::mem::size_of::<T>() {
            return Err(Error::InvalidMessage);
        }
        let body: T = self.ep.recv_body()?;
        if !body.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(body)
    }

    fn send_reply<T: ByteValued>(&mut self, req: &MsgHeader, body: &T) -> Result<()> {
        let mut hdr = MsgHeader::new(
            req.request().ok_or(Error::InvalidMessage)?,
            super::message::HeaderFlags::empty(),
            std::mem::size_of::<T>() as u32,
        );
        hdr.set_reply(true);
        self.ep.send_message(&hdr, body, None)
    }
}

impl<S: BackendHandler> AsRawFd for BackendServer<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::super::frontend::{Frontend, VringConfigData};
    use super::*;

    #[derive(Default)]
    struct DummyHandler {
        owned: bool,
        features: u64,
        regions: Vec<MemoryRegionDesc>,
        vring_num: [u32; 2],
        vring_base: [u32; 2],
        kick_present: [Option<bool>; 2],
    }

    impl BackendHandler for DummyHandler {
        fn set_owner(&mut self) -> Result<()> {
            if self.owned {
                return Err(Error::InvalidOperation);
            }
            self.owned = true;
            Ok(())
        }

        fn reset_owner(&mut self) -> Result<()> {
            *self = DummyHandler::default();
            Ok(())
        }

        fn get_features(&mut self) -> Result<u64> {
            Ok(0x15)
        }

        fn set_features(&mut self, features: u64) -> Result<()> {
            self.features = features;
            Ok(())
        }

        fn set_mem_table(&mut self, regions: &[MemoryRegionDesc], files: Vec<File>) -> Result<()> {
            assert_eq!(regions.len(), files.len());
            self.regions = regions.to_vec();
            Ok(())
        }

        fn set_log_base(&mut self, _base: u64, _file: Option<File>) -> Result<()> {
            Ok(())
        }

        fn set_log_fd(&mut self, _file: File) -> Result<()> {
            Ok(())
        }

        fn set_vring_num(&mut self, index: u32, num: u32) -> Result<()> {
            self.vring_num[index as usize] = num;
            Ok(())
        }

        fn set_vring_addr(&mut self, _index: u32, _addr: &VringAddrMsg) -> Result<()> {
            Ok(())
        }

        fn set_vring_base(&mut self, index: u32, base: u32) -> Result<()> {
            self.vring_base[index as usize] = base;
            Ok(())
        }

        fn get_vring_base(&mut self, index: u32) -> Result<u32> {
            Ok(self.vring_base[index as usize] + 3)
        }

        fn set_vring_kick(&mut self, index: u8, file: Option<File>) -> Result<()> {
            self.kick_present[index as usize] = Some(file.is_some());
            Ok(())
        }

        fn set_vring_call(&mut self, _index: u8, _file: Option<File>) -> Result<()> {
            Ok(())
        }

        fn set_vring_err(&mut self, _index: u8, _file: Option<File>) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> (Frontend, BackendServer<DummyHandler>) {
        let (c, s) = UnixStream::pair().unwrap();
        (
            Frontend::new(Endpoint::from_stream(c)),
            BackendServer::new(Endpoint::from_stream(s), DummyHandler::default()),
        )
    }

    #[test]
    fn owner_round_trip() {
        let (mut fe, mut be) = session();

        fe.set_owner().unwrap();
        be.handle_request().unwrap();
        assert!(be.handler().owned);

        // Claiming twice is refused.
        fe.set_owner().unwrap();
        assert!(be.handle_request().is_err());

        fe.reset_owner().unwrap();
        be.handle_request().unwrap();
        assert!(!be.handler().owned);
    }

    #[test]
    fn features_request_reply() {
        let (mut fe, mut be) = session();

        let fe_thread = thread::spawn(move || {
            let features = fe.get_features().unwrap();
            assert_eq!(features, 0x15);
            fe.set_features(features).unwrap();
            fe
        });
        be.handle_request().unwrap();
        be.handle_request().unwrap();
        assert_eq!(be.handler().features, 0x15);
        fe_thread.join().unwrap();
    }

    #[test]
    fn mem_table_transfer() {
        let (mut fe, mut be) = session();

        let f1 = vmm_sys_util::tempfile::TempFile::new().unwrap();
        let f2 = vmm_sys_util::tempfile::TempFile::new().unwrap();
        let regions = [
            (
                MemoryRegionDesc {
                    guest_phys_addr: 0x10_0000,
                    memory_size: 0x2000,
                    userspace_addr: 0x10_0000,
                    mmap_offset: 0,
                },
                f1.as_file().as_raw_fd(),
            ),
            (
                MemoryRegionDesc {
                    guest_phys_addr: 0x20_0000,
                    memory_size: 0x2000,
                    userspace_addr: 0x20_0000,
                    mmap_offset: 0,
                },
                f2.as_file().as_raw_fd(),
            ),
        ];
        fe.set_mem_table(&regions).unwrap();
        be.handle_request().unwrap();
        assert_eq!(be.handler().regions.len(), 2);
        assert_eq!(be.handler().regions[1].guest_phys_addr, 0x20_0000);
    }

    #[test]
    fn vring_setup_sequence() {
        let (mut fe, mut be) = session();

        fe.set_vring_num(1, 256).unwrap();
        be.handle_request().unwrap();
        assert_eq!(be.handler().vring_num[1], 256);

        fe.set_vring_base(1, 0).unwrap();
        be.handle_request().unwrap();

        let kick = vmm_sys_util::eventfd::EventFd::new(0).unwrap();
        fe.set_vring_kick(1, Some(kick.as_raw_fd())).unwrap();
        be.handle_request().unwrap();
        assert_eq!(be.handler().kick_present[1], Some(true));

        // Omitting the descriptor announces polling mode.
        fe.set_vring_kick(0, None).unwrap();
        be.handle_request().unwrap();
        assert_eq!(be.handler().kick_present[0], Some(false));

        fe.set_vring_addr(
            1,
            &VringConfigData {
                flags: 0,
                desc_table_addr: 0x1000,
                used_ring_addr: 0x2000,
                avail_ring_addr: 0x3000,
                log_addr: None,
            },
        )
        .unwrap();
        be.handle_request().unwrap();
    }

    #[test]
    fn get_vring_base_stops_queue() {
        let (mut fe, mut be) = session();

        fe.set_vring_base(0, 5).unwrap();
        be.handle_request().unwrap();

        let fe_thread = thread::spawn(move || {
            let base = fe.get_vring_base(0).unwrap();
            assert_eq!(base, 8);
        });
        be.handle_request().unwrap();
        fe_thread.join().unwrap();
    }

    #[test]
    fn disconnect_surfaces_as_such() {
        let (fe, mut be) = session();
        drop(fe);
        assert!(matches!(be.handle_request(), Err(Error::Disconnected)));
    }
}
