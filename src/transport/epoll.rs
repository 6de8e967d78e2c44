// src/transport/epoll.rs
//
// Single-threaded, edge-triggered readiness event loop. One thread, one
// epoll instance, cooperative scheduling across every live connection:
// drain the accept queue, then drain ready events, re-arm per connection.
// Because O_DIRECT reads/writes on a regular file never
// themselves report EAGAIN, a `Readiness::None` from the connection means
// "do the file I/O right now, synchronously, before going back to
// `epoll_wait`" rather than "wait for an event" — the file side of this
// transport is still blocking, only the socket side is readiness-driven.

use std::os::unix::io::RawFd;

use libc::{epoll_event, EPOLLIN, EPOLLOUT};

use crate::conn::{Connection, HeaderOutcome, Readiness};
use crate::error::FtResult;
use crate::http::{self, Status};
use crate::io_ops::round_up_to_block;
use crate::metrics::WorkerMetrics;
use crate::syscalls::{
    accept_nonblocking, close_fd, file_size, open_for_get, open_for_put, pread_at, pwrite_at,
    recv_nonblocking, send_nonblocking, set_nonblocking, Epoll,
};
use crate::transport::slab::ConnSlab;

const LISTENER_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 1024;

pub fn serve(listen_fd: RawFd, metrics: &WorkerMetrics) -> FtResult<()> {
    let epoll = Epoll::new()?;
    epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;

    let mut slab = ConnSlab::new();
    let mut events = vec![unsafe { std::mem::zeroed::<epoll_event>() }; MAX_EVENTS];

    loop {
        let n = epoll.wait(&mut events, -1)?;
        for ev in &events[..n] {
            if ev.u64 == LISTENER_TOKEN {
                accept_new_connections(listen_fd, &epoll, &mut slab, metrics)?;
                continue;
            }
            let idx = ev.u64 as usize;
            let readable = ev.events & (EPOLLIN as u32) != 0;
            let writable = ev.events & (EPOLLOUT as u32) != 0;
            drive_until_blocked(idx, readable, writable, &epoll, &mut slab, metrics);
        }
    }
}

fn accept_new_connections(
    listen_fd: RawFd,
    epoll: &Epoll,
    slab: &mut ConnSlab,
    metrics: &WorkerMetrics,
) -> FtResult<()> {
    loop {
        let client_fd = match accept_nonblocking(listen_fd)? {
            Some(fd) => fd,
            None => return Ok(()),
        };
        set_nonblocking(client_fd)?;
        let conn = Connection::new(client_fd);
        let idx = slab.insert(conn);
        epoll.add(client_fd, idx as u64, EPOLLIN)?;
        metrics.inc_conn();
    }
}

/// Advance the connection as far as it can go without an epoll event:
/// consume the readiness that just fired, then keep driving through any
/// `Readiness::None` (file I/O) steps, re-arming epoll to whatever
/// direction it wants next, or tearing it down on `Closed`/`Error`.
fn drive_until_blocked(
    idx: usize,
    readable: bool,
    writable: bool,
    epoll: &Epoll,
    slab: &mut ConnSlab,
    metrics: &WorkerMetrics,
) {
    let mut socket_event_pending = readable || writable;
    loop {
        let fd = match slab.get_mut(idx) {
            Some(c) => c.client_fd,
            None => return,
        };

        let made_progress = {
            let conn = slab.get_mut(idx).unwrap();
            match conn.wanted_readiness() {
                Readiness::Read if socket_event_pending => {
                    socket_event_pending = false;
                    step_socket_read(conn, metrics)
                }
                Readiness::Write if socket_event_pending => {
                    socket_event_pending = false;
                    step_socket_write(conn, metrics)
                }
                Readiness::None => step_file_io(conn, metrics),
                _ => false,
            }
        };

        let conn = slab.get_mut(idx).unwrap();
        if conn.is_terminal() {
            if conn.state == crate::conn::ConnState::Error {
                tracing::debug!(fd, "connection torn down on error");
            }
            let conn = slab.remove(idx).unwrap();
            let _ = epoll.delete(fd);
            close_fd(conn.client_fd);
            if let Some(ffd) = conn.file_fd {
                close_fd(ffd);
            }
            metrics.inc_req();
            metrics.dec_conn();
            return;
        }

        if !made_progress {
            match conn.wanted_readiness() {
                Readiness::Read => {
                    let _ = epoll.modify(fd, idx as u64, EPOLLIN);
                }
                Readiness::Write => {
                    let _ = epoll.modify(fd, idx as u64, EPOLLOUT);
                }
                Readiness::None => {}
            }
            return;
        }
    }
}

/// `None` on `EAGAIN` means "no data right now" — wait for the next
/// readiness event, not a closed connection. Only `Some(0)` is a genuine
/// EOF/peer-closed.
fn step_socket_read(conn: &mut Connection, metrics: &WorkerMetrics) -> bool {
    use crate::conn::ConnState;
    match conn.state {
        ConnState::ReadingHeader => {
            let len = conn.buf_len;
            let n = match recv_nonblocking(conn.client_fd, &mut conn.buf[len..]) {
                Ok(Some(n)) => n,
                Ok(None) => return false,
                Err(_) => {
                    conn.state = ConnState::Error;
                    return true;
                }
            };
            if n == 0 {
                conn.state = ConnState::Error;
                return true;
            }
            conn.buf_len += n;
            match crate::conn::evaluate_header(&conn.buf, conn.buf_len) {
                HeaderOutcome::Incomplete => true,
                HeaderOutcome::Reject { status, body } => {
                    let resp = http::canned_response(status, body);
                    send_and_count(conn.client_fd, &resp, metrics);
                    conn.state = ConnState::Closed;
                    true
                }
                HeaderOutcome::Get { path, content_type, .. } => match open_for_get(&path, true) {
                    Ok(ffd) => {
                        let size = file_size(ffd).unwrap_or(0);
                        let header = http::get_header(content_type, size);
                        send_and_count(conn.client_fd, &header, metrics);
                        conn.begin_get(ffd, size);
                        true
                    }
                    Err(_) => {
                        let resp = http::canned_response(Status::NotFound404, "Not Found");
                        send_and_count(conn.client_fd, &resp, metrics);
                        conn.state = ConnState::Closed;
                        true
                    }
                },
                HeaderOutcome::Put { path, content_length, header_len } => match open_for_put(&path, true) {
                    Ok(ffd) => {
                        let total_read = conn.buf_len;
                        conn.begin_put(ffd, content_length, header_len, total_read);
                        true
                    }
                    Err(_) => {
                        let resp = http::canned_response(Status::InternalServerError500, "Internal Server Error");
                        send_and_count(conn.client_fd, &resp, metrics);
                        conn.state = ConnState::Closed;
                        true
                    }
                },
            }
        }
        ConnState::Put(_) => {
            let len = conn.buf_len;
            match recv_nonblocking(conn.client_fd, &mut conn.buf[len..]) {
                Ok(Some(n)) => {
                    conn.on_put_socket_recv(n);
                    true
                }
                Ok(None) => false,
                Err(_) => {
                    conn.state = ConnState::Error;
                    true
                }
            }
        }
        _ => false,
    }
}

fn step_socket_write(conn: &mut Connection, metrics: &WorkerMetrics) -> bool {
    use crate::conn::ConnState;
    match conn.state {
        ConnState::Get(_) => {
            match send_nonblocking(conn.client_fd, &conn.buf[conn.util_offset..conn.buf_len]) {
                Ok(Some(n)) => {
                    metrics.add_bytes(n);
                    conn.on_get_socket_send(n);
                    if conn.state == ConnState::Closed {
                        if let Some(ffd) = conn.file_fd.take() {
                            close_fd(ffd);
                        }
                    }
                    true
                }
                Ok(None) => false,
                Err(_) => {
                    conn.state = ConnState::Error;
                    true
                }
            }
        }
        _ => false,
    }
}

fn step_file_io(conn: &mut Connection, metrics: &WorkerMetrics) -> bool {
    use crate::conn::{ConnState, GetPhase, PutPhase};
    match conn.state {
        ConnState::Get(GetPhase::NeedFileRead) => {
            let (offset, chunk_len) = conn.next_get_read();
            let fd = conn.file_fd.expect("GET always has a file fd while in Get state");
            match pread_at(fd, &mut conn.buf[..chunk_len], offset) {
                Ok(n) => {
                    conn.on_get_file_read(n);
                    if conn.state == ConnState::Closed {
                        close_fd(fd);
                    }
                    true
                }
                Err(_) => {
                    conn.state = ConnState::Error;
                    true
                }
            }
        }
        ConnState::Put(PutPhase::NeedFileWrite) => {
            let fd = conn.file_fd.expect("PUT always has a file fd while in Put state");
            let (offset, logical_len, rounded_len) = conn.next_put_write();
            debug_assert_eq!(rounded_len, round_up_to_block(logical_len));
            match pwrite_at(fd, &conn.buf[..rounded_len], offset) {
                Ok(_) => {
                    conn.on_put_file_write(logical_len);
                    if conn.state == ConnState::Closed {
                        close_fd(fd);
                        let resp = http::canned_response(Status::Created201, "Created");
                        send_and_count(conn.client_fd, &resp, metrics);
                    }
                    true
                }
                Err(_) => {
                    conn.state = ConnState::Error;
                    true
                }
            }
        }
        _ => false,
    }
}

/// Fire-and-forget a response send (canned errors, the GET header, the
/// PUT 201 ack): best-effort, the connection is closing either way, but
/// whatever actually lands on the wire still counts toward the metrics.
fn send_and_count(fd: RawFd, buf: &[u8], metrics: &WorkerMetrics) {
    if let Ok(Some(n)) = send_nonblocking(fd, buf) {
        metrics.add_bytes(n);
    }
}
