// src/transport/process.rs
//
// One child process per connection: `fork()` after each accept, the
// child handles exactly one request with the same blocking helpers as the
// single-threaded transport and then exits; the parent never waits on the
// child explicitly, instead ignoring SIGCHLD once at startup so the
// kernel reaps zombies for us. The accept loop drains at most
// `MAX_PENDING_ACCEPTS` connections per outer-loop iteration so a burst of
// simultaneous connections cannot starve bookkeeping work indefinitely
// (there is none here beyond the loop itself, but the cap mirrors the
// other batching transports and bounds worst-case fork() storms).

use std::os::unix::io::RawFd;

use crate::config::MAX_PENDING_ACCEPTS;
use crate::error::FtResult;
use crate::syscalls::{accept_blocking, close_fd};

/// Ignore SIGCHLD so terminated children are reaped automatically instead
/// of becoming zombies; done once, not per-fork.
fn ignore_sigchld() {
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

pub fn serve(listen_fd: RawFd) -> FtResult<()> {
    ignore_sigchld();

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
            fork_and_handle(client_fd);
        }
    }
}

fn fork_and_handle(client_fd: RawFd) {
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            // fork() failed; serve this one inline rather than dropping it.
            tracing::warn!("fork failed: {}", std::io::Error::last_os_error());
            let _ = crate::transport::blocking::serve_one(client_fd);
            close_fd(client_fd);
        }
        0 => {
            // Child: this process owns exactly this connection. No
            // metrics here — each child is a separate address space, so
            // in-process atomic counters would only ever read "0 or 1".
            let _ = crate::transport::blocking::serve_one(client_fd);
            close_fd(client_fd);
            std::process::exit(0);
        }
        _ => {
            // Parent: the child owns the fd now.
            close_fd(client_fd);
        }
    }
}
