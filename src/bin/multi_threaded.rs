// src/bin/multi_threaded.rs
//
// Thin harness around the thread-per-connection transport. Metrics are
// leaked to `'static` so the spawned, un-joined threads can reference
// them; there is no graceful shutdown for them to outlive anything past.

use file_transfer_lab::config::{ACCEPT_BACKLOG, SERVER_PORT};
use file_transfer_lab::logging::init_logging;
use file_transfer_lab::metrics::{spawn_metrics_printer, WorkerMetrics};
use file_transfer_lab::syscalls::create_listen_socket;
use file_transfer_lab::transport::thread;

fn main() {
    init_logging();
    let listen_fd = create_listen_socket(SERVER_PORT, ACCEPT_BACKLOG, false)
        .expect("failed to bind listen socket");
    tracing::info!(port = SERVER_PORT, "multi-threaded server listening");
    let metrics: &'static WorkerMetrics = Box::leak(Box::new(WorkerMetrics::default()));
    spawn_metrics_printer(metrics);

    if let Err(e) = thread::serve(listen_fd, metrics) {
        tracing::error!("multi-threaded server exited: {}", e);
        std::process::exit(1);
    }
}
