// src/bin/multi_process.rs
//
// Thin harness around the fork-per-connection transport.

use file_transfer_lab::config::{ACCEPT_BACKLOG, SERVER_PORT};
use file_transfer_lab::logging::init_logging;
use file_transfer_lab::syscalls::create_listen_socket;
use file_transfer_lab::transport::process;

fn main() {
    init_logging();
    let listen_fd = create_listen_socket(SERVER_PORT, ACCEPT_BACKLOG, false)
        .expect("failed to bind listen socket");
    tracing::info!(port = SERVER_PORT, "multi-process server listening");

    if let Err(e) = process::serve(listen_fd) {
        tracing::error!("multi-process server exited: {}", e);
        std::process::exit(1);
    }
}
