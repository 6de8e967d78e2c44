// src/bin/single_threaded.rs
//
// Thin harness: bind the listener, hand it to the blocking transport.
// Process launch, signal wiring, and listen-socket tuning beyond a plain
// `bind`/`listen` are left to the caller/deployment environment.

use file_transfer_lab::config::{ACCEPT_BACKLOG, SERVER_PORT};
use file_transfer_lab::logging::init_logging;
use file_transfer_lab::metrics::{spawn_metrics_printer, WorkerMetrics};
use file_transfer_lab::syscalls::create_listen_socket;
use file_transfer_lab::transport::blocking;

fn main() {
    init_logging();
    let listen_fd = create_listen_socket(SERVER_PORT, ACCEPT_BACKLOG, false)
        .expect("failed to bind listen socket");
    tracing::info!(port = SERVER_PORT, "single-threaded server listening");
    let metrics: &'static WorkerMetrics = Box::leak(Box::new(WorkerMetrics::default()));
    spawn_metrics_printer(metrics);

    if let Err(e) = blocking::serve(listen_fd, metrics) {
        tracing::error!("single-threaded server exited: {}", e);
        std::process::exit(1);
    }
}
