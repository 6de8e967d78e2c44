// src/bin/io_uring_server.rs
//
// Thin harness around the io_uring transport. Pass `--sqpoll` to run the
// optimized variant with a kernel-side polling thread instead of relying
// on `submit_and_wait` to trap into the kernel each round; this still
// requires `IORING_FEAT_FAST_POLL`, checked inside `transport::uring::serve`.
// The optimized variant additionally pins itself to one CPU core, matching
// `optimized-uring-server/main.c` (the plain io_uring variant does not).

use file_transfer_lab::config::{ACCEPT_BACKLOG, SERVER_PORT};
use file_transfer_lab::logging::init_logging;
use file_transfer_lab::metrics::{spawn_metrics_printer, WorkerMetrics};
use file_transfer_lab::syscalls::create_listen_socket;
use file_transfer_lab::transport::uring;

/// Pin this process to a single CPU core. Best-effort: a failure here is
/// logged, not fatal, same as the source's `perror`-and-continue handling.
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!("sched_setaffinity failed: {}", std::io::Error::last_os_error());
        } else {
            tracing::info!(core, "pinned to CPU core");
        }
    }
}

fn main() {
    init_logging();
    let sqpoll = std::env::args().any(|a| a == "--sqpoll");
    if sqpoll {
        pin_to_core(1);
    }
    let listen_fd = create_listen_socket(SERVER_PORT, ACCEPT_BACKLOG, true)
        .expect("failed to bind listen socket");
    tracing::info!(port = SERVER_PORT, sqpoll, "io_uring server listening");
    let metrics: &'static WorkerMetrics = Box::leak(Box::new(WorkerMetrics::default()));
    spawn_metrics_printer(metrics);

    if let Err(e) = uring::serve(listen_fd, sqpoll, metrics) {
        tracing::error!("io_uring server exited: {}", e);
        std::process::exit(1);
    }
}
