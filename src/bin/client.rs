// SPDX-License-Identifier: Apache-2.0

use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Arg, Command};
use log::error;

use vu_net::{VhostClient, DEFAULT_POLL_MS, DEFAULT_SOCK_PATH};

fn main() {
    env_logger::init();

    let matches = Command::new("vu-net-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("vhost-user client: owns the shared rings and sends probe frames")
        .arg(
            Arg::new("socket")
                .long("socket")
                .help("Control socket path")
                .default_value(DEFAULT_SOCK_PATH)
                .num_args(1),
        )
        .arg(
            Arg::new("tag")
                .long("tag")
                .help("Shared-memory name prefix")
                .default_value("vu-net")
                .num_args(1),
        )
        .arg(
            Arg::new("poll-ms")
                .long("poll-ms")
                .help("Steady-loop timeout in milliseconds")
                .default_value(DEFAULT_POLL_MS.to_string())
                .num_args(1),
        )
        .get_matches();

    let socket = matches
        .get_one::<String>("socket")
        .map(String::as_str)
        .unwrap_or(DEFAULT_SOCK_PATH);
    let tag = matches
        .get_one::<String>("tag")
        .map(String::as_str)
        .unwrap_or("vu-net");
    let poll_ms = matches
        .get_one::<String>("poll-ms")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(DEFAULT_POLL_MS);

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&stop)) {
            error!("registering signal handler failed: {e}");
            process::exit(1);
        }
    }

    let mut client = match VhostClient::new(socket, tag) {
        Ok(client) => client,
        Err(e) => {
            error!("session setup failed: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = client.run(&stop, poll_ms) {
        error!("session failed: {e}");
        process::exit(1);
    }
}
