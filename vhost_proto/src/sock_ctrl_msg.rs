// SPDX-License-Identifier: Apache-2.0

//! Raw `sendmsg`/`recvmsg` plumbing for passing file descriptors as
//! `SCM_RIGHTS` ancillary data over Unix domain sockets.

use std::fs::File;
use std::mem::{size_of, zeroed};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr::{copy_nonoverlapping, null_mut, write_unaligned};

use libc::{
    c_long, c_void, cmsghdr, iovec, msghdr, recvmsg, sendmsg, EINTR, MSG_CTRUNC, MSG_NOSIGNAL,
    SCM_RIGHTS, SOL_SOCKET,
};
use vmm_sys_util::errno::{Error, Result};

// These mirror the C macros of the same names. They are macros rather than
// functions so they can size statically allocated buffers.

macro_rules! CMSG_ALIGN {
    ($len:expr) => {
        (($len) + size_of::<c_long>() - 1) & !(size_of::<c_long>() - 1)
    };
}

macro_rules! CMSG_SPACE {
    ($len:expr) => {
        size_of::<cmsghdr>() + CMSG_ALIGN!($len)
    };
}

macro_rules! CMSG_LEN {
    ($len:expr) => {
        size_of::<cmsghdr>() + ($len)
    };
}

// Returns a pointer to the data area just past the control message header.
#[allow(non_snake_case)]
#[inline(always)]
fn CMSG_DATA(cmsg_buffer: *mut cmsghdr) -> *mut RawFd {
    cmsg_buffer.wrapping_offset(1) as *mut RawFd
}

// Like CMSG_NXTHDR, bounded by the control buffer length recorded in `msg`.
fn next_cmsg(msg: &msghdr, cmsg: &cmsghdr, cmsg_ptr: *mut cmsghdr) -> *mut cmsghdr {
    let next = (cmsg_ptr as *mut u8).wrapping_add(CMSG_ALIGN!(cmsg.cmsg_len)) as *mut cmsghdr;
    if next
        .wrapping_offset(1)
        .wrapping_sub(msg.msg_control as usize) as usize
        > msg.msg_controllen
    {
        null_mut()
    } else {
        next
    }
}

const CMSG_INLINE_CAPACITY: usize = CMSG_SPACE!(size_of::<RawFd>() * 8);

enum CmsgBuffer {
    Inline([u64; CMSG_INLINE_CAPACITY.div_ceil(8)]),
    Heap(Box<[cmsghdr]>),
}

impl CmsgBuffer {
    fn with_capacity(capacity: usize) -> CmsgBuffer {
        if capacity <= CMSG_INLINE_CAPACITY {
            CmsgBuffer::Inline([0u64; CMSG_INLINE_CAPACITY.div_ceil(8)])
        } else {
            let units = capacity.div_ceil(size_of::<cmsghdr>());
            // cmsghdr has private padding on some targets, so build zeroed
            // values instead of struct literals.
            let zeroed_hdr: cmsghdr = unsafe { zeroed() };
            CmsgBuffer::Heap(vec![zeroed_hdr; units].into_boxed_slice())
        }
    }

    fn as_mut_ptr(&mut self) -> *mut cmsghdr {
        match self {
            CmsgBuffer::Inline(a) => a.as_mut_ptr() as *mut cmsghdr,
            CmsgBuffer::Heap(a) => a.as_mut_ptr(),
        }
    }
}

fn empty_msghdr() -> msghdr {
    // msghdr also carries private padding fields on gnu targets.
    unsafe { zeroed() }
}

fn raw_sendmsg(fd: RawFd, iovs: &[iovec], out_fds: &[RawFd]) -> Result<usize> {
    let cmsg_capacity = CMSG_SPACE!(size_of::<RawFd>() * out_fds.len());
    let mut cmsg_buffer = CmsgBuffer::with_capacity(cmsg_capacity);

    let mut msg = empty_msghdr();
    msg.msg_iov = iovs.as_ptr() as *mut iovec;
    msg.msg_iovlen = iovs.len();

    if !out_fds.is_empty() {
        let mut cmsg: cmsghdr = unsafe { zeroed() };
        cmsg.cmsg_len = CMSG_LEN!(size_of::<RawFd>() * out_fds.len());
        cmsg.cmsg_level = SOL_SOCKET;
        cmsg.cmsg_type = SCM_RIGHTS;
        // SAFETY: cmsg_buffer was sized for the header plus out_fds.len()
        // descriptors.
        unsafe {
            write_unaligned(cmsg_buffer.as_mut_ptr(), cmsg);
            copy_nonoverlapping(
                out_fds.as_ptr(),
                CMSG_DATA(cmsg_buffer.as_mut_ptr()),
                out_fds.len(),
            );
        }

        msg.msg_control = cmsg_buffer.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_capacity;
    }

    loop {
        // SAFETY: the msghdr points at valid iovecs and control buffer for
        // the duration of the call.
        let written = unsafe { sendmsg(fd, &msg, MSG_NOSIGNAL) };
        if written >= 0 {
            return Ok(written as usize);
        }
        let err = Error::last();
        if err.errno() != EINTR {
            return Err(err);
        }
    }
}

/// Outcome of a single `recvmsg` call.
pub struct RecvResult {
    /// Number of data bytes read.
    pub bytes: usize,
    /// Number of file descriptors copied into the caller's buffer.
    pub fd_count: usize,
    /// Whether the kernel truncated the ancillary data (`MSG_CTRUNC`).
    pub truncated: bool,
}

fn raw_recvmsg(fd: RawFd, iovs: &mut [iovec], in_fds: &mut [RawFd]) -> Result<RecvResult> {
    let cmsg_capacity = CMSG_SPACE!(size_of::<RawFd>() * in_fds.len());
    let mut cmsg_buffer = CmsgBuffer::with_capacity(cmsg_capacity);

    let mut msg = empty_msghdr();
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len();
    if !in_fds.is_empty() {
        msg.msg_control = cmsg_buffer.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_capacity;
    }

    let total_read = loop {
        // SAFETY: the msghdr points at valid iovecs and control buffer for
        // the duration of the call.
        let n = unsafe { recvmsg(fd, &mut msg, 0) };
        if n >= 0 {
            break n as usize;
        }
        let err = Error::last();
        if err.errno() != EINTR {
            return Err(err);
        }
    };

    let truncated = msg.msg_flags & MSG_CTRUNC != 0;

    if total_read == 0 && msg.msg_controllen < size_of::<cmsghdr>() {
        return Ok(RecvResult {
            bytes: 0,
            fd_count: 0,
            truncated,
        });
    }

    let mut cmsg_ptr = msg.msg_control as *mut cmsghdr;
    let mut fd_count = 0;
    while !cmsg_ptr.is_null() {
        // SAFETY: the loop only advances to pointers with at least one whole
        // cmsghdr of readable space behind them.
        let cmsg = unsafe { cmsg_ptr.read_unaligned() };

        if cmsg.cmsg_level == SOL_SOCKET && cmsg.cmsg_type == SCM_RIGHTS {
            let count = (cmsg.cmsg_len - CMSG_LEN!(0)) / size_of::<RawFd>();
            let count = count.min(in_fds.len() - fd_count);
            // SAFETY: count descriptors fit in both the control data area and
            // the remaining space of the caller's buffer.
            unsafe {
                copy_nonoverlapping(
                    CMSG_DATA(cmsg_ptr),
                    in_fds[fd_count..].as_mut_ptr(),
                    count,
                );
            }
            fd_count += count;
        }

        cmsg_ptr = next_cmsg(&msg, &cmsg, cmsg_ptr);
    }

    Ok(RecvResult {
        bytes: total_read,
        fd_count,
        truncated,
    })
}

/// Sockets that can carry `SCM_RIGHTS` control messages alongside data.
pub trait ScmSocket {
    /// The underlying socket descriptor.
    fn socket_fd(&self) -> RawFd;

    /// Sends the gathered buffers and descriptors in a single `sendmsg`.
    /// Returns the number of data bytes written.
    fn send_with_fds(&self, bufs: &[&[u8]], fds: &[RawFd]) -> Result<usize> {
        let iovs: Vec<iovec> = bufs
            .iter()
            .map(|b| iovec {
                iov_base: b.as_ptr() as *mut c_void,
                iov_len: b.len(),
            })
            .collect();
        raw_sendmsg(self.socket_fd(), &iovs, fds)
    }

    /// Receives data into `buf` and up to `fds.len()` descriptors into `fds`.
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut [RawFd]) -> Result<RecvResult> {
        let mut iovs = [iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        }];
        raw_recvmsg(self.socket_fd(), &mut iovs, fds)
    }
}

impl ScmSocket for UnixStream {
    fn socket_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// Wraps raw descriptors received from a peer so that every error path
/// closes them.
pub fn take_files(fds: &[RawFd]) -> Vec<File> {
    fds.iter()
        // SAFETY: each fd was installed into this process by recvmsg and is
        // owned by the caller.
        .map(|fd| unsafe { File::from_raw_fd(*fd) })
        .collect()
}
