// SPDX-License-Identifier: Apache-2.0

//! vhost-user networking pair over POSIX shared memory.
//!
//! The client owns the shared-memory segments, seeds the rings and drives
//! the control handshake; the server maps what it is handed and echoes
//! frames from the transmit ring back into the receive ring. Both sides are
//! single-threaded epoll loops around the `vring` data plane.

use thiserror::Error as ThisError;

pub mod client;
pub mod reactor;
pub mod server;

pub use client::VhostClient;
pub use reactor::EpollDispatcher;
pub use server::{SessionState, VhostServer};

/// Well-known socket name used when no `--socket` argument is given.
pub const DEFAULT_SOCK_PATH: &str = "vhost.sock";

/// Default steady-loop timeout in milliseconds.
pub const DEFAULT_POLL_MS: i32 = 500;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Control-channel failure.
    #[error("control channel: {0}")]
    Protocol(#[from] vhost_proto::Error),
    /// Shared-memory ring failure.
    #[error("virtqueue: {0}")]
    Ring(#[from] vring::Error),
    /// Event-loop setup or wait failure.
    #[error("event loop: {0}")]
    Epoll(#[source] std::io::Error),
    /// Kick/call event descriptor failure.
    #[error("event descriptor: {0}")]
    Event(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The self-test frame the client publishes on timer ticks: a broadcast ARP
/// request for 10.0.0.2 from 10.0.0.1.
pub fn arp_probe_frame() -> [u8; 42] {
    let mut frame = [0u8; 42];
    let sender_mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    // Ethernet: broadcast destination, locally administered source, ARP.
    frame[..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&sender_mac);
    frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
    // ARP request, Ethernet/IPv4.
    frame[14..16].copy_from_slice(&1u16.to_be_bytes());
    frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[18] = 6;
    frame[19] = 4;
    frame[20..22].copy_from_slice(&1u16.to_be_bytes());
    frame[22..28].copy_from_slice(&sender_mac);
    frame[28..32].copy_from_slice(&[10, 0, 0, 1]);
    frame[38..42].copy_from_slice(&[10, 0, 0, 2]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_frame_is_an_arp_request() {
        let frame = arp_probe_frame();
        assert_eq!(frame.len(), 42);
        assert_eq!(&frame[..6], &[0xff; 6]);
        assert_eq!(&frame[12..14], &0x0806u16.to_be_bytes());
        assert_eq!(&frame[20..22], &1u16.to_be_bytes());
        assert_eq!(&frame[28..32], &[10, 0, 0, 1]);
    }
}
