// SPDX-License-Identifier: Apache-2.0

//! Full-session test: a server loop on its own thread, a client doing the
//! real handshake over a Unix socket, and frames echoed through the shared
//! rings.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmm_sys_util::tempdir::TempDir;
use vu_net::{VhostClient, VhostServer};

struct ServerRig {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<u64>,
}

fn spawn_server(socket: PathBuf) -> ServerRig {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let mut server = VhostServer::new(&socket).unwrap();
        while !thread_stop.load(Ordering::Relaxed) {
            server.step(20).unwrap();
        }
        server.forwarded()
    });
    ServerRig { stop, handle }
}

impl ServerRig {
    fn finish(self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

fn connect_client(socket: &std::path::Path, tag: &str) -> VhostClient {
    // The server thread may not have bound the socket yet.
    for _ in 0..100 {
        match VhostClient::new(socket, tag) {
            Ok(client) => return client,
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
    panic!("server never became reachable");
}

fn wait_for_echo(client: &mut VhostClient, want: usize) -> Vec<Vec<u8>> {
    let mut got = Vec::new();
    for _ in 0..200 {
        client
            .drain_receive(&mut |frame| got.push(frame.to_vec()))
            .unwrap();
        if got.len() >= want {
            return got;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("only {} of {} frames echoed back", got.len(), want);
}

#[test]
fn frame_echoes_through_the_rings() {
    let dir = TempDir::new().unwrap();
    let socket = dir.as_path().join("vu-echo.sock");
    let rig = spawn_server(socket.clone());

    let mut client = connect_client(&socket, "vu-test-echo");
    client.send_frame(b"ping over shared memory").unwrap();

    let got = wait_for_echo(&mut client, 1);
    assert_eq!(got, vec![b"ping over shared memory".to_vec()]);
    assert_eq!(client.counters(), (1, 1));

    client.shutdown().unwrap();
    assert_eq!(rig.finish(), 1);
}

#[test]
fn frames_echo_in_order() {
    let dir = TempDir::new().unwrap();
    let socket = dir.as_path().join("vu-order.sock");
    let rig = spawn_server(socket.clone());

    let mut client = connect_client(&socket, "vu-test-order");
    let frames: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 64]).collect();
    for frame in &frames {
        client.send_frame(frame).unwrap();
    }

    let got = wait_for_echo(&mut client, frames.len());
    assert_eq!(got, frames);

    client.shutdown().unwrap();
    assert_eq!(rig.finish(), frames.len() as u64);
}
