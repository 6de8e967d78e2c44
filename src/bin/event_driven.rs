// src/bin/event_driven.rs
//
// Thin harness around the single-threaded epoll readiness transport.

use file_transfer_lab::config::{ACCEPT_BACKLOG, SERVER_PORT};
use file_transfer_lab::logging::init_logging;
use file_transfer_lab::metrics::{spawn_metrics_printer, WorkerMetrics};
use file_transfer_lab::syscalls::create_listen_socket;
use file_transfer_lab::transport::epoll;

fn main() {
    init_logging();
    let listen_fd = create_listen_socket(SERVER_PORT, ACCEPT_BACKLOG, true)
        .expect("failed to bind listen socket");
    tracing::info!(port = SERVER_PORT, "event-driven server listening");
    let metrics: &'static WorkerMetrics = Box::leak(Box::new(WorkerMetrics::default()));
    spawn_metrics_printer(metrics);

    if let Err(e) = epoll::serve(listen_fd, metrics) {
        tracing::error!("event-driven server exited: {}", e);
        std::process::exit(1);
    }
}
