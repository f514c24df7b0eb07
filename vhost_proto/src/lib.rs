// SPDX-License-Identifier: Apache-2.0

//! Control channel of a vhost-user device session.
//!
//! The protocol runs over a Unix domain socket between a client (the device
//! front-end, which owns guest memory) and a server (the back-end that
//! emulates the device). Each message is a fixed 12-byte header followed by
//! an opcode-specific payload; file descriptors for shared memory and event
//! notification travel as ancillary data on the same sends.
//!
//! [`Frontend`] drives the client role, one synchronous request at a time.
//! [`BackendServer`] dispatches inbound requests onto a [`BackendHandler`]
//! implementation on the server side.

mod backend;
mod connection;
mod frontend;
pub mod message;
mod sock_ctrl_msg;

pub use backend::{BackendHandler, BackendListener, BackendServer};
pub use connection::{Endpoint, Listener};
pub use frontend::{Frontend, VringConfigData};

use libc::{EACCES, EAGAIN, ECONNRESET, EINTR, ENOBUFS, ENOMEM, EPIPE, EWOULDBLOCK};

/// Errors of the control channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid parameter supplied by the local caller.
    #[error("invalid parameter")]
    InvalidParam,
    /// The operation is not permitted in the current session state.
    #[error("operation not permitted in current state")]
    InvalidOperation,
    /// A message failed structural validation.
    #[error("invalid or corrupted message")]
    InvalidMessage,
    /// Fewer bytes than a complete message were transferred.
    #[error("partial message transfer")]
    PartialMessage,
    /// The announced payload exceeds the protocol maximum.
    #[error("message payload too large")]
    OversizedMsg,
    /// The attached descriptor count does not match the request, or the
    /// ancillary data was truncated.
    #[error("invalid attached file descriptors")]
    IncorrectFds,
    /// The peer closed the connection in an orderly way.
    #[error("peer disconnected")]
    Disconnected,
    /// Low-level socket failure.
    #[error("socket error: {0}")]
    SocketError(std::io::Error),
    /// Failure establishing the connection.
    #[error("failed to connect to peer: {0}")]
    SocketConnect(#[source] vmm_sys_util::errno::Error),
    /// The connection is broken and must be torn down.
    #[error("socket broken: {0}")]
    SocketBroken(#[source] vmm_sys_util::errno::Error),
    /// Transient socket failure, the operation may be retried.
    #[error("temporary socket failure: {0}")]
    SocketRetry(#[source] vmm_sys_util::errno::Error),
    /// The server-side handler rejected the request.
    #[error("request handler failed: {0}")]
    ReqHandlerFailed(#[source] std::io::Error),
}

impl From<vmm_sys_util::errno::Error> for Error {
    /// Classifies a raw errno from a socket syscall.
    fn from(err: vmm_sys_util::errno::Error) -> Self {
        match err.errno() {
            // Retryable conditions.
            EAGAIN | EWOULDBLOCK | EINTR | ENOBUFS | ENOMEM => Error::SocketRetry(err),
            // The peer went away.
            ECONNRESET | EPIPE => Error::SocketBroken(err),
            // Connection refused at setup.
            EACCES => Error::SocketConnect(err),
            _ => Error::SocketError(std::io::Error::from_raw_os_error(err.errno())),
        }
    }
}

impl Error {
    /// Whether the failed operation may be retried on the same connection.
    pub fn should_retry(&self) -> bool {
        matches!(self, Error::SocketRetry(_))
    }
}

/// Result of control channel operations.
pub type Result<T> = std::result::Result<T, Error>;
