// src/transport/thread.rs
//
// One detached OS thread per connection: each accepted connection gets
// its own `std::thread::spawn`, which runs the same per-connection logic
// as the blocking transport and then lets the fd close as the thread
// exits. No join handles are kept — there is no graceful
// shutdown, so there is nothing to join against; a thread that panics
// takes only its own connection down; `Connection`'s embedded
// `AlignedBuffer` carries its own `unsafe impl Send` so it can move into
// the spawned closure.

use std::os::unix::io::RawFd;

use crate::config::MAX_PENDING_ACCEPTS;
use crate::error::FtResult;
use crate::metrics::WorkerMetrics;
use crate::syscalls::{accept_blocking, close_fd};
use crate::transport::blocking::serve_one;

pub fn serve(listen_fd: RawFd, metrics: &'static WorkerMetrics) -> FtResult<()> {
    loop {
        let mut accepted_this_round = 0;
        while accepted_this_round < MAX_PENDING_ACCEPTS {
            let client_fd = match accept_blocking(listen_fd) {
                Ok(fd) => fd,
                Err(e) => {
                    tracing::error!("accept error: {}", e);
                    return Ok(());
                }
            };
            accepted_this_round += 1;
            spawn_handler(client_fd, metrics);
        }
    }
}

fn spawn_handler(client_fd: RawFd, metrics: &'static WorkerMetrics) {
    metrics.inc_conn();
    std::thread::spawn(move || {
        let sent = serve_one(client_fd);
        close_fd(client_fd);
        metrics.add_bytes(sent);
        metrics.inc_req();
        metrics.dec_conn();
    });
}
