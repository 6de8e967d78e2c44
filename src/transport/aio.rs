// src/transport/aio.rs
//
// Single-threaded readiness loop for the socket side (identical shape to
// `epoll`), plus Linux AIO (`io_submit`/`io_getevents`) for the file side,
// notified through a single `eventfd` registered alongside the listener
// in the same epoll set, using the same `Epoll` wrapper the plain
// readiness transport uses; the AIO half is a thin unsafe wrapper in the
// same idiom around `io_setup`/`io_submit`/`io_getevents`/`io_destroy`.
// Submissions are batched: up to `AIO_BATCH_SIZE` iocbs
// accumulate in a loop-owned (not global) `Vec` and are flushed with one
// `io_submit` either when the batch is full or when the event loop is
// about to go back to sleep in `epoll_wait`.

use std::os::unix::io::RawFd;

use libc::{epoll_event, EPOLLIN, EPOLLOUT};

use crate::config::AIO_BATCH_SIZE;
use crate::conn::{AsyncOp, Connection, ConnState, GetPhase, HeaderOutcome, PutPhase, Readiness};
use crate::error::FtResult;
use crate::http::{self, Status};
use crate::metrics::WorkerMetrics;
use crate::syscalls::{
    accept_nonblocking, aio_context_t, close_fd, eventfd_create, eventfd_read, file_size, io_destroy,
    io_getevents, io_setup, io_submit, open_for_get, open_for_put, prep_pread, prep_pwrite,
    recv_nonblocking, send_nonblocking, set_nonblocking, Epoll,
};
use crate::transport::slab::ConnSlab;

const LISTENER_TOKEN: u64 = u64::MAX;
const EVENTFD_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;
const AIO_MAX_EVENTS: u32 = (AIO_BATCH_SIZE as u32) * 4;

struct PendingAio {
    iocbs: Vec<libc::iocb>,
}

impl PendingAio {
    fn new() -> Self {
        Self { iocbs: Vec::with_capacity(AIO_BATCH_SIZE) }
    }

    fn push(&mut self, iocb: libc::iocb) {
        self.iocbs.push(iocb);
    }

    fn should_flush(&self) -> bool {
        self.iocbs.len() >= AIO_BATCH_SIZE
    }

    /// `io_submit(2)` can submit fewer iocbs than requested under ring
    /// pressure, returning early on the first one it couldn't accept.
    /// Only drop the ones it actually took; the rest stay queued for the
    /// next flush rather than being silently lost (their connections
    /// already have `last_op` set, expecting a completion that would
    /// otherwise never come).
    fn flush(&mut self, ctx: aio_context_t) {
        if self.iocbs.is_empty() {
            return;
        }
        let mut ptrs: Vec<*mut libc::iocb> = self.iocbs.iter_mut().map(|i| i as *mut libc::iocb).collect();
        match io_submit(ctx, &mut ptrs) {
            Ok(submitted) => {
                self.iocbs.drain(..submitted.min(self.iocbs.len()));
            }
            Err(e) => {
                tracing::error!("io_submit failed: {}", e);
            }
        }
    }
}

pub fn serve(listen_fd: RawFd, metrics: &WorkerMetrics) -> FtResult<()> {
    let epoll = Epoll::new()?;
    epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;

    let efd = eventfd_create()?;
    epoll.add(efd, EVENTFD_TOKEN, EPOLLIN)?;

    let ctx = io_setup(AIO_MAX_EVENTS)?;
    let mut slab = ConnSlab::new();
    let mut pending = PendingAio::new();
    let mut events = vec![unsafe { std::mem::zeroed::<epoll_event>() }; MAX_EVENTS];
    let mut completions = vec![unsafe { std::mem::zeroed::<libc::io_event>() }; AIO_MAX_EVENTS as usize];

    let result = (|| -> FtResult<()> {
        loop {
            pending.flush(ctx);
            let n = epoll.wait(&mut events, -1)?;
            for ev in &events[..n] {
                if ev.u64 == LISTENER_TOKEN {
                    accept_new_connections(listen_fd, &epoll, &mut slab, metrics)?;
                    continue;
                }
                if ev.u64 == EVENTFD_TOKEN {
                    drain_completions(efd, ctx, &mut completions, &epoll, &mut slab, &mut pending, metrics);
                    continue;
                }
                let idx = ev.u64 as usize;
                let readable = ev.events & (EPOLLIN as u32) != 0;
                let writable = ev.events & (EPOLLOUT as u32) != 0;
                drive_socket(idx, readable, writable, &epoll, &mut slab, &mut pending, ctx, efd, metrics);
            }
        }
    })();

    let _ = io_destroy(ctx);
    result
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
        let idx = slab.insert(Connection::new(client_fd));
        epoll.add(client_fd, idx as u64, EPOLLIN)?;
        metrics.inc_conn();
    }
}

/// Drive the socket side exactly once for this wakeup, then submit an
/// AIO op if the connection now wants the file side. Unlike `epoll.rs`,
/// the file side never runs synchronously here — it always goes through
/// `pending`/`io_submit`, so this never loops past one socket step.
#[allow(clippy::too_many_arguments)]
fn drive_socket(
    idx: usize,
    readable: bool,
    writable: bool,
    epoll: &Epoll,
    slab: &mut ConnSlab,
    pending: &mut PendingAio,
    ctx: aio_context_t,
    efd: RawFd,
    metrics: &WorkerMetrics,
) {
    let fd = match slab.get_mut(idx) {
        Some(c) => c.client_fd,
        None => return,
    };

    {
        let conn = slab.get_mut(idx).unwrap();
        match conn.wanted_readiness() {
            Readiness::Read if readable => step_socket_read(conn, metrics),
            Readiness::Write if writable => step_socket_write(conn, metrics),
            _ => {}
        }
    }

    finish_step(idx, fd, epoll, slab, pending, ctx, efd, metrics);
}

#[allow(clippy::too_many_arguments)]
fn finish_step(
    idx: usize,
    fd: RawFd,
    epoll: &Epoll,
    slab: &mut ConnSlab,
    pending: &mut PendingAio,
    ctx: aio_context_t,
    efd: RawFd,
    metrics: &WorkerMetrics,
) {
    let conn = slab.get_mut(idx).unwrap();
    if conn.is_terminal() {
        if conn.state == ConnState::Error {
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

    match conn.wanted_readiness() {
        Readiness::Read => {
            let _ = epoll.modify(fd, idx as u64, EPOLLIN);
        }
        Readiness::Write => {
            let _ = epoll.modify(fd, idx as u64, EPOLLOUT);
        }
        Readiness::None => submit_file_op(idx, conn, pending, ctx, efd),
    }
}

/// Submit exactly one AIO op for this connection if one is not already
/// in flight (`last_op` is the in-flight marker as well as the
/// last-completed tag, per the connection's data model).
fn submit_file_op(idx: usize, conn: &mut Connection, pending: &mut PendingAio, ctx: aio_context_t, efd: RawFd) {
    if conn.last_op.is_some() {
        return; // an op for this connection is already outstanding
    }
    let user_data = idx as u64;
    match conn.state {
        ConnState::Get(GetPhase::NeedFileRead) => {
            let (offset, chunk_len) = conn.next_get_read();
            let fd = conn.file_fd.expect("GET holds a file fd while reading");
            let iocb = prep_pread(fd, &mut conn.buf[..chunk_len], offset, efd, user_data);
            conn.last_op = Some(AsyncOp::FileRead);
            pending.push(iocb);
        }
        ConnState::Put(PutPhase::NeedFileWrite) => {
            let (offset, _logical_len, rounded_len) = conn.next_put_write();
            let fd = conn.file_fd.expect("PUT holds a file fd while writing");
            let iocb = prep_pwrite(fd, &conn.buf[..rounded_len], offset, efd, user_data);
            conn.last_op = Some(AsyncOp::FileWrite);
            pending.push(iocb);
        }
        _ => {}
    }
    if pending.should_flush() {
        pending.flush(ctx);
    }
}

#[allow(clippy::too_many_arguments)]
fn drain_completions(
    efd: RawFd,
    ctx: aio_context_t,
    completions: &mut [libc::io_event],
    epoll: &Epoll,
    slab: &mut ConnSlab,
    pending: &mut PendingAio,
    metrics: &WorkerMetrics,
) {
    let _ = eventfd_read(efd);
    loop {
        let n = match io_getevents(ctx, 0, completions, Some(libc::timespec { tv_sec: 0, tv_nsec: 0 })) {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            return;
        }
        for event in &completions[..n] {
            let idx = event.data as usize;
            let fd = match slab.get_mut(idx) {
                Some(c) => c.client_fd,
                None => continue,
            };
            apply_completion(idx, event.res, slab, pending, ctx, efd, metrics);
            finish_step(idx, fd, epoll, slab, pending, ctx, efd, metrics);
        }
    }
}

/// A negative `res` that is `-EAGAIN`/`-EWOULDBLOCK` means "the kernel
/// couldn't perform this right now, try again" — not a failed
/// connection. Re-submit the same op (recomputed from the connection's
/// current, unmoved offset) rather than tearing the connection down.
fn apply_completion(
    idx: usize,
    res: i64,
    slab: &mut ConnSlab,
    pending: &mut PendingAio,
    ctx: aio_context_t,
    efd: RawFd,
    metrics: &WorkerMetrics,
) {
    let conn = match slab.get_mut(idx) {
        Some(c) => c,
        None => return,
    };
    let op = conn.last_op.take();
    if res < 0 {
        let errno = -res as i32;
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            submit_file_op(idx, conn, pending, ctx, efd);
            return;
        }
        conn.state = ConnState::Error;
        return;
    }
    let n = res as usize;
    match op {
        Some(AsyncOp::FileRead) => {
            conn.on_get_file_read(n);
            if conn.state == ConnState::Closed {
                if let Some(ffd) = conn.file_fd.take() {
                    close_fd(ffd);
                }
            }
        }
        Some(AsyncOp::FileWrite) => {
            let (_, logical_len, _) = conn.next_put_write();
            conn.on_put_file_write(logical_len.min(n));
            if conn.state == ConnState::Closed {
                if let Some(ffd) = conn.file_fd.take() {
                    close_fd(ffd);
                }
                let resp = http::canned_response(Status::Created201, "Created");
                send_and_count(conn.client_fd, &resp, metrics);
            }
        }
        None => {}
    }
}

/// `None` on `EAGAIN` means "no data right now", not a closed peer; only
/// `Some(0)` is a genuine EOF.
fn step_socket_read(conn: &mut Connection, metrics: &WorkerMetrics) {
    match conn.state {
        ConnState::ReadingHeader => {
            let len = conn.buf_len;
            let n = match recv_nonblocking(conn.client_fd, &mut conn.buf[len..]) {
                Ok(Some(n)) => n,
                Ok(None) => return,
                Err(_) => {
                    conn.state = ConnState::Error;
                    return;
                }
            };
            if n == 0 {
                conn.state = ConnState::Error;
                return;
            }
            conn.buf_len += n;
            match crate::conn::evaluate_header(&conn.buf, conn.buf_len) {
                HeaderOutcome::Incomplete => {}
                HeaderOutcome::Reject { status, body } => {
                    let resp = http::canned_response(status, body);
                    send_and_count(conn.client_fd, &resp, metrics);
                    conn.state = ConnState::Closed;
                }
                HeaderOutcome::Get { path, content_type, .. } => match open_for_get(&path, true) {
                    Ok(ffd) => {
                        let size = file_size(ffd).unwrap_or(0);
                        let header = http::get_header(content_type, size);
                        send_and_count(conn.client_fd, &header, metrics);
                        conn.begin_get(ffd, size);
                    }
                    Err(_) => {
                        let resp = http::canned_response(Status::NotFound404, "Not Found");
                        send_and_count(conn.client_fd, &resp, metrics);
                        conn.state = ConnState::Closed;
                    }
                },
                HeaderOutcome::Put { path, content_length, header_len } => match open_for_put(&path, true) {
                    Ok(ffd) => {
                        let total_read = conn.buf_len;
                        conn.begin_put(ffd, content_length, header_len, total_read);
                    }
                    Err(_) => {
                        let resp = http::canned_response(Status::InternalServerError500, "Internal Server Error");
                        send_and_count(conn.client_fd, &resp, metrics);
                        conn.state = ConnState::Closed;
                    }
                },
            }
        }
        ConnState::Put(_) => {
            let len = conn.buf_len;
            match recv_nonblocking(conn.client_fd, &mut conn.buf[len..]) {
                Ok(Some(n)) => conn.on_put_socket_recv(n),
                Ok(None) => {}
                Err(_) => conn.state = ConnState::Error,
            }
        }
        _ => {}
    }
}

fn step_socket_write(conn: &mut Connection, metrics: &WorkerMetrics) {
    if let ConnState::Get(_) = conn.state {
        match send_nonblocking(conn.client_fd, &conn.buf[conn.util_offset..conn.buf_len]) {
            Ok(Some(n)) if n > 0 => {
                metrics.add_bytes(n);
                conn.on_get_socket_send(n);
            }
            Ok(_) => {}
            Err(_) => conn.state = ConnState::Error,
        }
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
