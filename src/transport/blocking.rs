// src/transport/blocking.rs
//
// Single-threaded, fully blocking transport. One connection is handled
// start-to-finish before `accept()` is called again; this is the
// baseline every other transport is measured against: exactly one
// blocking `read()` is used to pull in the request (headers plus
// whatever body bytes arrive with them) — if the end-of-headers sentinel
// is not present in that one read, the request is rejected with 400
// rather than accumulating further reads. GET/PUT both drive the same
// `Connection` phase transitions the readiness and completion transports
// use, just with blocking syscalls standing in for epoll/AIO wakeups.

use std::os::unix::io::RawFd;

use crate::conn::{Connection, ConnState, GetPhase, HeaderOutcome, PutPhase};
use crate::error::FtResult;
use crate::http::{self, Status};
use crate::io_ops::{read_fully_at, send_fully, write_fully};
use crate::metrics::WorkerMetrics;
use crate::syscalls::{accept_blocking, close_fd, file_size, open_for_get, open_for_put, recv_nonblocking};

pub fn serve(listen_fd: RawFd, metrics: &WorkerMetrics) -> FtResult<()> {
    loop {
        let client_fd = match accept_blocking(listen_fd) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!("accept error: {}", e);
                return Ok(()); // fatal accept failure ends the listener loop
            }
        };
        metrics.inc_conn();
        let sent = serve_one(client_fd);
        metrics.add_bytes(sent);
        metrics.inc_req();
        metrics.dec_conn();
        close_fd(client_fd);
    }
}

/// Handle exactly one connection to completion, start to finish. Shared
/// by the process-per-connection and thread-per-connection transports,
/// which only differ in how they get a whole OS schedulable unit devoted
/// to this call. Returns the number of bytes written to the socket, for
/// the caller's metrics.
pub fn serve_one(client_fd: RawFd) -> usize {
    handle_connection(client_fd)
}

/// One blocking read's worth of bytes. `Ok(None)` from `recv_nonblocking`
/// (EAGAIN) shouldn't happen on a blocking fd, but looping past it costs
/// nothing and keeps this honest about what the primitive can return.
fn blocking_recv(fd: RawFd, buf: &mut [u8]) -> FtResult<usize> {
    loop {
        if let Some(n) = recv_nonblocking(fd, buf)? {
            return Ok(n);
        }
    }
}

fn handle_connection(client_fd: RawFd) -> usize {
    let mut conn = Connection::new(client_fd);

    let n = match blocking_recv(client_fd, &mut conn.buf) {
        Ok(n) => n,
        Err(_) => return 0,
    };
    if n == 0 {
        return 0;
    }

    match crate::conn::evaluate_header(&conn.buf, n) {
        HeaderOutcome::Incomplete => send_canned(client_fd, Status::BadRequest400, "Bad Request"),
        HeaderOutcome::Reject { status, body } => send_canned(client_fd, status, body),
        HeaderOutcome::Get { path, content_type, .. } => match open_for_get(&path, false) {
            Ok(fd) => handle_get(client_fd, fd, content_type, &mut conn),
            Err(_) => send_canned(client_fd, Status::NotFound404, "Not Found"),
        },
        HeaderOutcome::Put { path, content_length, header_len } => match open_for_put(&path, false) {
            Ok(fd) => handle_put(client_fd, fd, content_length, header_len, n, &mut conn),
            Err(_) => send_canned(client_fd, Status::InternalServerError500, "Internal Server Error"),
        },
    }
}

/// Drives `conn` through `begin_get`/`on_get_file_read`/`on_get_socket_send`
/// exactly like the readiness transports do, just with blocking
/// full-transfer helpers standing in for one-shot non-blocking calls.
fn handle_get(client_fd: RawFd, file_fd: RawFd, content_type: &str, conn: &mut Connection) -> usize {
    let size = match file_size(file_fd) {
        Ok(s) => s,
        Err(_) => {
            close_fd(file_fd);
            return send_canned(client_fd, Status::InternalServerError500, "Internal Server Error");
        }
    };

    let header = http::get_header(content_type, size);
    let mut sent = match send_fully(client_fd, &header) {
        Ok(()) => header.len(),
        Err(_) => {
            close_fd(file_fd);
            return 0;
        }
    };

    conn.begin_get(file_fd, size);
    while let ConnState::Get(phase) = conn.state {
        match phase {
            GetPhase::NeedFileRead => {
                let (offset, chunk_len) = conn.next_get_read();
                match read_fully_at(file_fd, &mut conn.buf[..chunk_len], offset) {
                    Ok(n) => conn.on_get_file_read(n),
                    Err(_) => conn.state = ConnState::Error,
                }
            }
            GetPhase::NeedSocketSend => {
                let chunk_len = conn.buf_len - conn.util_offset;
                match send_fully(client_fd, &conn.buf[conn.util_offset..conn.buf_len]) {
                    Ok(()) => {
                        conn.on_get_socket_send(chunk_len);
                        sent += chunk_len;
                    }
                    Err(_) => conn.state = ConnState::Error,
                }
            }
        }
    }
    close_fd(file_fd);
    sent
}

/// Drives `conn` through `begin_put`/`on_put_socket_recv`/`on_put_file_write`
/// the same way the readiness transports do.
fn handle_put(
    client_fd: RawFd,
    file_fd: RawFd,
    content_length: u64,
    header_len: usize,
    first_read_len: usize,
    conn: &mut Connection,
) -> usize {
    conn.begin_put(file_fd, content_length, header_len, first_read_len);

    while let ConnState::Put(phase) = conn.state {
        match phase {
            PutPhase::NeedSocketRecv => {
                let len = conn.buf_len;
                match blocking_recv(client_fd, &mut conn.buf[len..]) {
                    Ok(n) => conn.on_put_socket_recv(n),
                    Err(_) => conn.state = ConnState::Error,
                }
            }
            PutPhase::NeedFileWrite => {
                let (offset, logical_len, _rounded_len) = conn.next_put_write();
                match write_fully(file_fd, &conn.buf, logical_len, offset) {
                    Ok(()) => conn.on_put_file_write(logical_len),
                    Err(_) => conn.state = ConnState::Error,
                }
            }
        }
    }

    close_fd(file_fd);
    if conn.state == ConnState::Closed {
        send_canned(client_fd, Status::Created201, "Created")
    } else {
        send_canned(client_fd, Status::InternalServerError500, "Internal Server Error")
    }
}

fn send_canned(client_fd: RawFd, status: Status, body: &str) -> usize {
    let resp = http::canned_response(status, body);
    match send_fully(client_fd, &resp) {
        Ok(()) => resp.len(),
        Err(_) => 0,
    }
}
