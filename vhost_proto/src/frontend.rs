// SPDX-License-Identifier: Apache-2.0

//! Client (device front-end) role of the control protocol.
//!
//! Requests are issued strictly one at a time; the two GET requests block
//! until the reply arrives and validate that it echoes the request code and
//! protocol version.

use std::os::unix::io::RawFd;
use std::path::Path;

use log::debug;
use vm_memory::ByteValued;

use super::connection::Endpoint;
use super::message::{
    HeaderFlags, MemoryHeader, MemoryRegionDesc, MsgHeader, MsgValidator, Request, U64Msg,
    VringAddrMsg, VringStateMsg, MAX_MEMORY_REGIONS,
};
use super::{Error, Result};

/// Ring addresses for one queue, passed to `set_vring_addr`.
#[derive(Clone, Copy, Debug, Default)]
pub struct VringConfigData {
    /// Option flags, currently always zero.
    pub flags: u32,
    /// Address of the descriptor table.
    pub desc_table_addr: u64,
    /// Address of the used ring.
    pub used_ring_addr: u64,
    /// Address of the available ring.
    pub avail_ring_addr: u64,
    /// Address of the dirty log, if logging is active.
    pub log_addr: Option<u64>,
}

/// Client endpoint of an established session.
pub struct Frontend {
    ep: Endpoint,
}

impl Frontend {
    /// Connects to the server socket at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Frontend {
            ep: Endpoint::connect(path)?,
        })
    }

    /// Wraps an already connected endpoint.
    pub fn new(ep: Endpoint) -> Self {
        Frontend { ep }
    }

    /// Claims exclusive ownership of the session.
    pub fn set_owner(&mut self) -> Result<()> {
        self.send_request_header(Request::SetOwner, None)?;
        Ok(())
    }

    /// Asks the server to drop all session state.
    pub fn reset_owner(&mut self) -> Result<()> {
        self.send_request_header(Request::ResetOwner, None)?;
        Ok(())
    }

    /// Fetches the server's feature bits.
    pub fn get_features(&mut self) -> Result<u64> {
        let req = self.send_request_header(Request::GetFeatures, None)?;
        let reply: U64Msg = self.recv_reply(&req)?;
        Ok(reply.value)
    }

    /// Acknowledges feature bits to the server.
    pub fn set_features(&mut self, features: u64) -> Result<()> {
        let body = U64Msg::new(features);
        self.send_request_with_body(Request::SetFeatures, &body, None)?;
        Ok(())
    }

    /// Publishes the shared-memory region table. Each region carries exactly
    /// one descriptor for the server to map.
    pub fn set_mem_table(&mut self, regions: &[(MemoryRegionDesc, RawFd)]) -> Result<()> {
        if regions.is_empty() || regions.len() > MAX_MEMORY_REGIONS {
            return Err(Error::InvalidParam);
        }

        let mut payload = Vec::with_capacity(regions.len() * std::mem::size_of::<MemoryRegionDesc>());
        let mut fds = Vec::with_capacity(regions.len());
        for (desc, fd) in regions {
            if !desc.is_valid() || *fd < 0 {
                return Err(Error::InvalidParam);
            }
            payload.extend_from_slice(desc.as_slice());
            fds.push(*fd);
        }

        let body = MemoryHeader {
            num_regions: regions.len() as u32,
            padding: 0,
        };
        let hdr = Self::request_header::<MemoryHeader>(
            Request::SetMemTable,
            payload.len(),
        );
        debug!("sending memory table with {} regions", regions.len());
        self.ep
            .send_message_with_payload(&hdr, &body, &payload, Some(&fds))
    }

    /// Announces the dirty-log base address.
    pub fn set_log_base(&mut self, base: u64) -> Result<()> {
        let body = U64Msg::new(base);
        self.send_request_with_body(Request::SetLogBase, &body, None)
    }

    /// Passes the logging descriptor.
    pub fn set_log_fd(&mut self, fd: RawFd) -> Result<()> {
        self.send_request_header(Request::SetLogFd, Some(&[fd]))?;
        Ok(())
    }

    /// Sets the capacity of queue `index`.
    pub fn set_vring_num(&mut self, index: u32, num: u32) -> Result<()> {
        let body = VringStateMsg { index, num };
        self.send_request_with_body(Request::SetVringNum, &body, None)
    }

    /// Seeds the starting cursor of queue `index`.
    pub fn set_vring_base(&mut self, index: u32, base: u32) -> Result<()> {
        let body = VringStateMsg { index, num: base };
        self.send_request_with_body(Request::SetVringBase, &body, None)
    }

    /// Publishes the ring addresses of queue `index`.
    pub fn set_vring_addr(&mut self, index: u32, config: &VringConfigData) -> Result<()> {
        let body = VringAddrMsg {
            index,
            flags: config.flags,
            descriptor: config.desc_table_addr,
            used: config.used_ring_addr,
            available: config.avail_ring_addr,
            log: config.log_addr.unwrap_or(0),
        };
        if !body.is_valid() {
            return Err(Error::InvalidParam);
        }
        self.send_request_with_body(Request::SetVringAddr, &body, None)
    }

    /// Stops queue `index` and returns its current available cursor.
    pub fn get_vring_base(&mut self, index: u32) -> Result<u32> {
        let body = VringStateMsg { index, num: 0 };
        let req = self.send_request_with_body_hdr(Request::GetVringBase, &body, None)?;
        let reply: VringStateMsg = self.recv_reply(&req)?;
        if reply.index != index {
            return Err(Error::InvalidMessage);
        }
        Ok(reply.num)
    }

    /// Passes the kick descriptor of queue `index`, or switches the queue to
    /// polling when no descriptor is given.
    pub fn set_vring_kick(&mut self, index: u8, event: Option<RawFd>) -> Result<()> {
        self.send_vring_fd(Request::SetVringKick, index, event)
    }

    /// Passes the call descriptor of queue `index`.
    pub fn set_vring_call(&mut self, index: u8, event: Option<RawFd>) -> Result<()> {
        self.send_vring_fd(Request::SetVringCall, index, event)
    }

    /// Passes the error descriptor of queue `index`.
    pub fn set_vring_err(&mut self, index: u8, event: Option<RawFd>) -> Result<()> {
        self.send_vring_fd(Request::SetVringErr, index, event)
    }

    fn send_vring_fd(&mut self, req: Request, index: u8, event: Option<RawFd>) -> Result<()> {
        let body = U64Msg::vring_fd(index, event.is_some());
        let hdr = Self::request_header::<U64Msg>(req, 0);
        debug!("sending {:?} for queue {} (fd: {})", req, index, event.is_some());
        match event {
            Some(fd) => self.ep.send_message(&hdr, &body, Some(&[fd])),
            None => self.ep.send_message(&hdr, &body, None),
        }
    }

    fn request_header<T>(req: Request, extra: usize) -> MsgHeader {
        MsgHeader::new(
            req,
            HeaderFlags::empty(),
            (std::mem::size_of::<T>() + extra) as u32,
        )
    }

    fn send_request_header(&mut self, req: Request, fds: Option<&[RawFd]>) -> Result<MsgHeader> {
        let hdr = MsgHeader::new(req, HeaderFlags::empty(), 0);
        debug!("sending {:?}", req);
        self.ep.send_header(&hdr, fds)?;
        Ok(hdr)
    }

    fn send_request_with_body<T: ByteValued>(
        &mut self,
        req: Request,
        body: &T,
        fds: Option<&[RawFd]>,
    ) -> Result<()> {
        self.send_request_with_body_hdr(req, body, fds)?;
        Ok(())
    }

    fn send_request_with_body_hdr<T: ByteValued>(
        &mut self,
        req: Request,
        body: &T,
        fds: Option<&[RawFd]>,
    ) -> Result<MsgHeader> {
        let hdr = Self::request_header::<T>(req, 0);
        debug!("sending {:?}", req);
        self.ep.send_message(&hdr, body, fds)?;
        Ok(hdr)
    }

    /// Blocks for the reply to `req` and validates it.
    fn recv_reply<T: ByteValued + Default + MsgValidator>(&mut self, req: &MsgHeader) -> Result<T> {
        let (hdr, files) = self.ep.recv_header()?;
        if !hdr.is_reply_for(req) {
            return Err(Error::InvalidMessage);
        }
        // Replies never carry descriptors.
        if !files.is_empty() {
            return Err(Error::IncorrectFds);
        }
        if hdr.size() as usize != std::mem::size_of::<T>() {
            return Err(Error::InvalidMessage);
        }
        let body: T = self.ep.recv_body()?;
        if !body.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(body)
    }
}
