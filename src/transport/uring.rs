// src/transport/uring.rs
//
// Completion-based transport on io_uring, built on the `io-uring` crate
// rather than a hand-rolled `io_uring_enter` wrapper: one submission
// queue, `user_data` tagging every op with which
// connection and which half of the pipeline it belongs to, and — in the
// optimized variant — optional `IORING_SETUP_SQPOLL` with a kernel poll
// thread, which requires `IORING_FEAT_FAST_POLL` to behave usefully for
// socket ops and is checked for at startup rather than assumed.

use std::os::unix::io::RawFd;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use crate::config::{URING_QUEUE_DEPTH, URING_SQPOLL_IDLE_MS};
use crate::conn::{AsyncOp, Connection, ConnState, GetPhase, HeaderOutcome, PutPhase, Readiness};
use crate::error::{FtError, FtResult};
use crate::http::{self, Status};
use crate::metrics::WorkerMetrics;
use crate::syscalls::{close_fd, file_size, open_for_get, open_for_put};
use crate::transport::slab::ConnSlab;

const OP_ACCEPT: u64 = 0;
const OP_SOCKET_RECV: u64 = 1;
const OP_SOCKET_SEND: u64 = 2;
const OP_FILE_READ: u64 = 3;
const OP_FILE_WRITE: u64 = 4;
/// Tags the one-shot GET response header send, kept distinct from
/// `OP_SOCKET_SEND` so its completion never feeds `on_get_socket_send` —
/// the header byte count is not part of the tracked body pump.
const OP_HEADER_SEND: u64 = 5;
const ACCEPT_IDX: usize = usize::MAX;

/// Every outstanding SQE is tagged `(slot index, op kind)` packed into 64
/// bits; `ACCEPT_IDX` stands in for "no connection yet".
fn encode(idx: usize, op: u64) -> u64 {
    ((idx as u64) << 8) | op
}

fn decode(tag: u64) -> (usize, u64) {
    ((tag >> 8) as usize, tag & 0xff)
}

pub fn serve(listen_fd: RawFd, sqpoll: bool, metrics: &WorkerMetrics) -> FtResult<()> {
    let mut builder = IoUring::builder();
    if sqpoll {
        builder.setup_sqpoll(URING_SQPOLL_IDLE_MS);
    }
    let mut ring: IoUring = builder
        .build(URING_QUEUE_DEPTH)
        .map_err(|e| FtError::Other(format!("io_uring setup failed: {}", e)))?;

    if sqpoll && !ring.params().is_feature_fast_poll() {
        return Err(FtError::Other(
            "SQPOLL requires IORING_FEAT_FAST_POLL on this kernel".into(),
        ));
    }

    let mut slab = ConnSlab::new();
    // Loop-owned, not a global: counts submissions since the last forced
    // `submit()`, so a burst of connections near `URING_QUEUE_DEPTH`
    // flushes the ring before it fills rather than silently stalling.
    let mut request_counter: u64 = 0;

    submit_accept(&mut ring, listen_fd)?;

    loop {
        force_submit_if_near_saturation(&mut ring, &mut request_counter)?;
        ring.submit_and_wait(1)
            .map_err(|e| FtError::Other(format!("io_uring submit_and_wait failed: {}", e)))?;

        let completed: Vec<cqueue::Entry> = ring.completion().map(|cqe| cqe).collect();
        for cqe in completed {
            handle_completion(&mut ring, &mut slab, listen_fd, cqe, &mut request_counter, metrics)?;
        }
    }
}

fn force_submit_if_near_saturation(ring: &mut IoUring, request_counter: &mut u64) -> FtResult<()> {
    if *request_counter >= URING_QUEUE_DEPTH as u64 / 2 {
        ring.submit()
            .map_err(|e| FtError::Other(format!("io_uring submit failed: {}", e)))?;
        *request_counter = 0;
    }
    Ok(())
}

unsafe fn push(ring: &mut IoUring, entry: squeue::Entry) -> FtResult<()> {
    while ring.submission().push(&entry).is_err() {
        ring.submit().map_err(|e| FtError::Other(format!("io_uring submit failed: {}", e)))?;
    }
    Ok(())
}

fn submit_accept(ring: &mut IoUring, listen_fd: RawFd) -> FtResult<()> {
    let entry = opcode::Accept::new(types::Fd(listen_fd), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(encode(ACCEPT_IDX, OP_ACCEPT));
    unsafe { push(ring, entry) }
}

fn submit_socket_recv(ring: &mut IoUring, idx: usize, conn: &mut Connection) -> FtResult<()> {
    let len = conn.buf_len;
    let ptr = unsafe { conn.buf.as_mut_slice()[len..].as_mut_ptr() };
    let cap = conn.buf.len() as u32 - len as u32;
    let entry = opcode::Recv::new(types::Fd(conn.client_fd), ptr, cap)
        .build()
        .user_data(encode(idx, OP_SOCKET_RECV));
    unsafe { push(ring, entry) }
}

fn submit_socket_send(ring: &mut IoUring, idx: usize, conn: &mut Connection) -> FtResult<()> {
    let ptr = unsafe { conn.buf.as_mut_slice()[conn.util_offset..conn.buf_len].as_ptr() };
    let len = (conn.buf_len - conn.util_offset) as u32;
    let entry = opcode::Send::new(types::Fd(conn.client_fd), ptr, len)
        .build()
        .user_data(encode(idx, OP_SOCKET_SEND));
    unsafe { push(ring, entry) }
}

fn submit_file_read(ring: &mut IoUring, idx: usize, conn: &mut Connection) -> FtResult<()> {
    let (offset, chunk_len) = conn.next_get_read();
    let fd = conn.file_fd.expect("GET holds a file fd while reading");
    let ptr = unsafe { conn.buf.as_mut_slice()[..chunk_len].as_mut_ptr() };
    let entry = opcode::Read::new(types::Fd(fd), ptr, chunk_len as u32)
        .offset(offset)
        .build()
        .user_data(encode(idx, OP_FILE_READ));
    conn.last_op = Some(AsyncOp::FileRead);
    unsafe { push(ring, entry) }
}

fn submit_file_write(ring: &mut IoUring, idx: usize, conn: &mut Connection) -> FtResult<()> {
    let (offset, _logical_len, rounded_len) = conn.next_put_write();
    let fd = conn.file_fd.expect("PUT holds a file fd while writing");
    let ptr = unsafe { conn.buf.as_mut_slice()[..rounded_len].as_ptr() };
    let entry = opcode::Write::new(types::Fd(fd), ptr, rounded_len as u32)
        .offset(offset)
        .build()
        .user_data(encode(idx, OP_FILE_WRITE));
    conn.last_op = Some(AsyncOp::FileWrite);
    unsafe { push(ring, entry) }
}

/// Re-issue the exact op that just reported `-EAGAIN`/`-EWOULDBLOCK`.
/// `OP_SOCKET_RECV`/`OP_FILE_READ`/`OP_FILE_WRITE` recompute their source
/// fresh from `conn`'s unmoved state, so calling the ordinary submit
/// helper again is correct. `OP_SOCKET_SEND`/`OP_HEADER_SEND` are not:
/// that op is used both for the GET body pump (source `conn.buf`) and
/// for a canned/error/201 response (source `conn.pending_send`, kept
/// alive exactly so a resubmit like this one can still find it).
fn resubmit_same_op(ring: &mut IoUring, idx: usize, conn: &mut Connection, op: u64) -> FtResult<()> {
    match op {
        OP_SOCKET_RECV => submit_socket_recv(ring, idx, conn),
        OP_FILE_READ => submit_file_read(ring, idx, conn),
        OP_FILE_WRITE => submit_file_write(ring, idx, conn),
        OP_SOCKET_SEND | OP_HEADER_SEND => {
            if let Some(body) = conn.pending_send.take() {
                let ptr = body.as_ptr();
                let len = body.len() as u32;
                conn.pending_send = Some(body);
                let entry = opcode::Send::new(types::Fd(conn.client_fd), ptr, len)
                    .build()
                    .user_data(encode(idx, op));
                unsafe { push(ring, entry) }
            } else {
                submit_socket_send(ring, idx, conn)
            }
        }
        _ => Ok(()),
    }
}

fn handle_completion(
    ring: &mut IoUring,
    slab: &mut ConnSlab,
    listen_fd: RawFd,
    cqe: cqueue::Entry,
    request_counter: &mut u64,
    metrics: &WorkerMetrics,
) -> FtResult<()> {
    let (idx, op) = decode(cqe.user_data());
    let res = cqe.result();

    if op == OP_ACCEPT {
        submit_accept(ring, listen_fd)?;
        if res >= 0 {
            let client_fd = res as RawFd;
            let idx = slab.insert(Connection::new(client_fd));
            let conn = slab.get_mut(idx).unwrap();
            submit_socket_recv(ring, idx, conn)?;
            *request_counter += 1;
            metrics.inc_conn();
        } else {
            tracing::error!("accept completion error: {}", std::io::Error::from_raw_os_error(-res));
        }
        return Ok(());
    }

    let conn = match slab.get_mut(idx) {
        Some(c) => c,
        None => return Ok(()),
    };

    if res < 0 {
        let errno = -res;
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            resubmit_same_op(ring, idx, conn, op)?;
            *request_counter += 1;
            return Ok(());
        }
        conn.state = ConnState::Error;
    } else {
        let n = res as usize;
        match op {
            OP_SOCKET_RECV => on_socket_recv(conn, n),
            OP_SOCKET_SEND => {
                conn.last_op = None;
                // Drops the heap buffer kept alive in `pending_send` if this
                // completion was a canned/error response or the PUT 201 ack
                // (see `send_then_close`); a no-op `None` otherwise.
                conn.pending_send = None;
                // A canned/error response or the PUT 201 ack is sent as a
                // plain socket send too; only a `Get` state mid-stream
                // means this completion is part of the GET body pump.
                if n > 0 && matches!(conn.state, ConnState::Get(_)) {
                    metrics.add_bytes(n);
                    conn.on_get_socket_send(n);
                }
            }
            OP_HEADER_SEND => {
                conn.last_op = None;
                conn.pending_send = None;
                metrics.add_bytes(n);
            }
            OP_FILE_READ => {
                conn.last_op = None;
                conn.on_get_file_read(n);
            }
            OP_FILE_WRITE => {
                conn.last_op = None;
                let (_, logical_len, _) = conn.next_put_write();
                conn.on_put_file_write(logical_len.min(n));
                if conn.state == ConnState::Closed {
                    // The connection must not be torn down until this send
                    // itself completes, so queue it and return: the next
                    // completion for this slot (tagged OP_SOCKET_SEND) sees
                    // `state` already `Closed` and tears it down then.
                    let resp = http::canned_response(Status::Created201, "Created");
                    send_then_close(ring, idx, conn, resp)?;
                    *request_counter += 1;
                    return Ok(());
                }
            }
            _ => {}
        }
    }

    advance_after_completion(ring, idx, slab, listen_fd, request_counter, metrics)
}

fn on_socket_recv(conn: &mut Connection, n: usize) {
    match conn.state {
        ConnState::ReadingHeader => {
            if n == 0 {
                conn.state = ConnState::Error;
                return;
            }
            conn.buf_len += n;
        }
        ConnState::Put(_) => conn.on_put_socket_recv(n),
        _ => {}
    }
}

fn advance_after_completion(
    ring: &mut IoUring,
    idx: usize,
    slab: &mut ConnSlab,
    listen_fd: RawFd,
    request_counter: &mut u64,
    metrics: &WorkerMetrics,
) -> FtResult<()> {
    let _ = listen_fd;
    let conn = match slab.get_mut(idx) {
        Some(c) => c,
        None => return Ok(()),
    };

    if conn.state == ConnState::ReadingHeader {
        match crate::conn::evaluate_header(&conn.buf, conn.buf_len) {
            HeaderOutcome::Incomplete => {
                submit_socket_recv(ring, idx, conn)?;
                *request_counter += 1;
                return Ok(());
            }
            HeaderOutcome::Reject { status, body } => {
                let resp = http::canned_response(status, body);
                send_then_close(ring, idx, conn, resp)?;
                *request_counter += 1;
                return Ok(());
            }
            HeaderOutcome::Get { path, content_type, .. } => match open_for_get(&path, true) {
                Ok(ffd) => {
                    let size = file_size(ffd).unwrap_or(0);
                    let header = http::get_header(content_type, size);
                    conn.begin_get(ffd, size);
                    send_header_then_continue(ring, idx, conn, header)?;
                    *request_counter += 1;
                    return Ok(());
                }
                Err(_) => {
                    let resp = http::canned_response(Status::NotFound404, "Not Found");
                    send_then_close(ring, idx, conn, resp)?;
                    *request_counter += 1;
                    return Ok(());
                }
            },
            HeaderOutcome::Put { path, content_length, header_len } => match open_for_put(&path, true) {
                Ok(ffd) => {
                    let total_read = conn.buf_len;
                    conn.begin_put(ffd, content_length, header_len, total_read);
                }
                Err(_) => {
                    let resp = http::canned_response(Status::InternalServerError500, "Internal Server Error");
                    send_then_close(ring, idx, conn, resp)?;
                    *request_counter += 1;
                    return Ok(());
                }
            },
        }
    }

    if conn.is_terminal() {
        if conn.state == ConnState::Error {
            tracing::debug!(idx, "connection torn down on error");
        }
        let conn = slab.remove(idx).unwrap();
        close_fd(conn.client_fd);
        if let Some(ffd) = conn.file_fd {
            close_fd(ffd);
        }
        metrics.inc_req();
        metrics.dec_conn();
        return Ok(());
    }

    match conn.wanted_readiness() {
        Readiness::Read => submit_socket_recv(ring, idx, conn)?,
        Readiness::Write => submit_socket_send(ring, idx, conn)?,
        Readiness::None => match conn.state {
            ConnState::Get(GetPhase::NeedFileRead) => submit_file_read(ring, idx, conn)?,
            ConnState::Put(PutPhase::NeedFileWrite) => submit_file_write(ring, idx, conn)?,
            _ => {}
        },
    }
    *request_counter += 1;
    Ok(())
}

/// Fire-and-forget a canned response, then tear the connection down once
/// it completes (tagged as an ordinary socket send; its completion hits
/// the `OP_SOCKET_SEND` arm above, sees `conn.state` already terminal from
/// the caller having set it, and the next `advance_after_completion` pass
/// removes it from the slab). The buffer is kept alive in
/// `conn.pending_send` until that completion arrives — the kernel holds
/// the raw pointer in the meantime — then dropped there, rather than
/// leaked with `mem::forget`.
fn send_then_close(ring: &mut IoUring, idx: usize, conn: &mut Connection, body: Vec<u8>) -> FtResult<()> {
    conn.state = ConnState::Closed;
    let ptr = body.as_ptr();
    let len = body.len() as u32;
    conn.pending_send = Some(body);
    let entry = opcode::Send::new(types::Fd(conn.client_fd), ptr, len)
        .build()
        .user_data(encode(idx, OP_SOCKET_SEND));
    unsafe { push(ring, entry) }
}

fn send_header_then_continue(ring: &mut IoUring, idx: usize, conn: &mut Connection, header: Vec<u8>) -> FtResult<()> {
    let ptr = header.as_ptr();
    let len = header.len() as u32;
    conn.pending_send = Some(header);
    let entry = opcode::Send::new(types::Fd(conn.client_fd), ptr, len)
        .build()
        .user_data(encode(idx, OP_HEADER_SEND));
    conn.last_op = None;
    unsafe { push(ring, entry) }
}
