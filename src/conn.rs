// src/conn.rs
//
// The connection state machine: the one piece every transport adapter
// shares regardless of whether it drives I/O by blocking syscalls,
// readiness events, or completion events. A transport
// owns the event loop and decides *when* to call into a `Connection`; this
// module decides *what happens next* to the connection's own state.
//
// The state is modeled as a tagged sum rather
// than a single per-transport integer: `Get`/`Put` distinguish which
// pipeline a connection is in, and within each, whether it is waiting on
// the socket or on the file. Readiness transports treat "waiting on the
// file" as "go ahead and call `pread`/`pwrite` right now since O_DIRECT
// reads/writes on a regular file never themselves return EAGAIN"; AIO and
// io_uring transports treat it as "an iocb/SQE is in flight, wait for the
// completion". Either way the `Connection` fields mean the same thing.

use std::os::unix::io::RawFd;

use crate::buffer::AlignedBuffer;
use crate::http::{self, Status};
use crate::io_ops::round_up_to_block;
use crate::pathres;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetPhase {
    /// Need to pull the next chunk from the file into the buffer.
    NeedFileRead,
    /// `buf[util_offset..buf_len]` needs to reach the socket.
    NeedSocketSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutPhase {
    /// Need more body bytes from the socket.
    NeedSocketRecv,
    /// `buf[..buf_len]` (block-rounded) needs to reach the file.
    NeedFileWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeader,
    Get(GetPhase),
    Put(PutPhase),
    /// Response fully sent / file fully written; transport should close.
    Closed,
    /// Something failed; transport should tear the connection down, same
    /// as `Closed` but distinguished for metrics/logging.
    Error,
}

/// Which async operation a completion-based transport (AIO, io_uring) has
/// outstanding on this connection's file handle, paired with its result
/// once `io_getevents`/a CQE reports it. Readiness transports never touch
/// these two fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOp {
    FileRead,
    FileWrite,
}

/// Readiness direction a readiness-based transport (epoll, epoll+AIO)
/// should have armed for this connection right now. Exactly one direction
/// is ever wanted at a time — never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
    /// No socket readiness needed; the connection is waiting on the file
    /// (direct read/write, or an AIO/uring completion).
    None,
}

pub struct Connection {
    pub client_fd: RawFd,
    pub file_fd: Option<RawFd>,
    /// GET: the file's real size. PUT: the requested `Content-Length`.
    /// Either way, `byte_offset` counts up to this.
    pub file_size: u64,
    pub byte_offset: u64,
    pub buf: AlignedBuffer,
    pub buf_len: usize,
    pub util_offset: usize,
    pub state: ConnState,
    pub last_op: Option<AsyncOp>,
    /// Embedded iocb storage for the AIO transport; unused elsewhere.
    pub iocb: Option<libc::iocb>,
    /// Heap-backed canned response / GET header bytes that a completion
    /// transport has submitted to the kernel but not yet had acknowledged;
    /// kept alive here so the submission's pointer stays valid until the
    /// matching completion arrives, then dropped. Unused by the readiness
    /// and blocking transports, which send from stack-local buffers.
    pub pending_send: Option<Vec<u8>>,
}

impl Connection {
    pub fn new(client_fd: RawFd) -> Self {
        Self {
            client_fd,
            file_fd: None,
            file_size: 0,
            byte_offset: 0,
            buf: AlignedBuffer::new(),
            buf_len: 0,
            util_offset: 0,
            state: ConnState::ReadingHeader,
            last_op: None,
            iocb: None,
            pending_send: None,
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.util_offset <= self.buf_len);
        debug_assert!(self.buf_len <= self.buf.len() as usize);
        debug_assert!(self.byte_offset <= self.file_size);
    }

    /// What socket readiness, if any, this connection wants right now.
    /// Readiness transports re-arm epoll to exactly this, never both
    /// directions at once.
    pub fn wanted_readiness(&self) -> Readiness {
        match self.state {
            ConnState::ReadingHeader => Readiness::Read,
            ConnState::Get(GetPhase::NeedSocketSend) => Readiness::Write,
            ConnState::Get(GetPhase::NeedFileRead) => Readiness::None,
            ConnState::Put(PutPhase::NeedSocketRecv) => Readiness::Read,
            ConnState::Put(PutPhase::NeedFileWrite) => Readiness::None,
            ConnState::Closed | ConnState::Error => Readiness::None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnState::Closed | ConnState::Error)
    }
}

/// Result of running the header parser over whatever bytes have
/// accumulated in `buf[..buf_len]`.
pub enum HeaderOutcome {
    /// Keep reading; no sentinel yet.
    Incomplete,
    /// A terminal, canned response should be sent and the connection
    /// closed — no file is opened.
    Reject { status: Status, body: &'static str },
    /// GET resolved to a path; caller still has to `open()` it and may
    /// still get a 404/500 from that.
    Get { path: String, content_type: &'static str, header_len: usize },
    /// PUT resolved to a path under the upload directory with a known
    /// body length; caller still has to `open()`/`creat()` it.
    Put { path: String, content_length: u64, header_len: usize },
}

/// Parse `buf[..buf_len]` into the next connection phase. Pure function: no I/O.
pub fn evaluate_header(buf: &[u8], buf_len: usize) -> HeaderOutcome {
    let header_len = match http::scan_headers(&buf[..buf_len]) {
        http::HeaderScan::Incomplete => return HeaderOutcome::Incomplete,
        http::HeaderScan::Complete { header_len } => header_len,
    };

    let req = match http::parse_request(buf, header_len) {
        Ok(req) => req,
        Err(http::ParseError::UnknownMethod) => {
            return HeaderOutcome::Reject {
                status: Status::MethodNotAllowed405,
                body: "Method Not Allowed",
            };
        }
        Err(http::ParseError::MalformedRequestLine) => {
            return HeaderOutcome::Reject {
                status: Status::BadRequest400,
                body: "Bad Request",
            };
        }
        Err(http::ParseError::MissingContentLength) => {
            return HeaderOutcome::Reject {
                status: Status::LengthRequired411,
                body: "Length Required",
            };
        }
    };

    match req.method {
        http::Method::Get => {
            let path = pathres::resolve_get(req.target);
            let content_type = http::mime_type_for(&path);
            HeaderOutcome::Get { path, content_type, header_len }
        }
        http::Method::Put => match pathres::resolve_put(req.target) {
            Some(path) => HeaderOutcome::Put {
                path,
                content_length: req.content_length.expect("PUT always carries a parsed length here"),
                header_len,
            },
            None => HeaderOutcome::Reject {
                status: Status::BadRequest400,
                body: "Bad Request",
            },
        },
        http::Method::Other => unreachable!("parse_request rejects unknown methods before returning Ok"),
    }
}

impl Connection {
    /// Move into the GET pipeline once the file is open and its size
    /// known. No body was read as part of the header parse, so the buffer
    /// starts empty and the first action is always a file read.
    pub fn begin_get(&mut self, file_fd: RawFd, file_size: u64) {
        self.file_fd = Some(file_fd);
        self.file_size = file_size;
        self.byte_offset = 0;
        self.buf_len = 0;
        self.util_offset = 0;
        self.state = if file_size == 0 {
            ConnState::Closed
        } else {
            ConnState::Get(GetPhase::NeedFileRead)
        };
        self.check_invariants();
    }

    /// A file read completed with `n` bytes (0 would mean a short file —
    /// truncated between `fstat` and `pread`, treated as EOF here).
    pub fn on_get_file_read(&mut self, n: usize) {
        self.buf_len = n;
        self.util_offset = 0;
        self.state = if n == 0 {
            ConnState::Closed
        } else {
            ConnState::Get(GetPhase::NeedSocketSend)
        };
        self.check_invariants();
    }

    /// `n` bytes of the current chunk were sent to the socket.
    pub fn on_get_socket_send(&mut self, n: usize) {
        self.util_offset += n;
        self.byte_offset += n as u64;
        if self.util_offset == self.buf_len {
            self.state = if self.byte_offset >= self.file_size {
                ConnState::Closed
            } else {
                ConnState::Get(GetPhase::NeedFileRead)
            };
        }
        self.check_invariants();
    }

    /// Next positional read's offset and length for the GET file side.
    pub fn next_get_read(&self) -> (u64, usize) {
        (self.byte_offset, self.buf.len() as usize)
    }

    /// Move into the PUT pipeline. `initial_body` is whatever body bytes
    /// arrived in the same read as the headers. The AlignedBuffer must
    /// already hold those bytes at `[header_len..header_len+initial_body_len)`;
    /// this call shifts them to the front and zeroes the vacated tail.
    pub fn begin_put(&mut self, file_fd: RawFd, content_length: u64, header_len: usize, total_read: usize) {
        self.file_fd = Some(file_fd);
        self.file_size = content_length;
        self.byte_offset = 0;
        let initial_len = total_read.saturating_sub(header_len);
        if initial_len > 0 {
            self.buf.move_to_front(header_len, header_len + initial_len);
        } else {
            self.buf.zero_tail(0);
        }
        self.buf_len = initial_len;
        self.util_offset = 0;
        self.state = if content_length == 0 {
            ConnState::Closed
        } else if self.have_full_chunk_or_tail() {
            ConnState::Put(PutPhase::NeedFileWrite)
        } else {
            ConnState::Put(PutPhase::NeedSocketRecv)
        };
        self.check_invariants();
    }

    fn have_full_chunk_or_tail(&self) -> bool {
        let remaining = self.file_size - self.byte_offset;
        let buffered = self.buf_len as u64;
        buffered >= self.buf.len() as u64 || buffered >= remaining
    }

    /// `n` more body bytes arrived into `buf[buf_len..]`.
    pub fn on_put_socket_recv(&mut self, n: usize) {
        if n == 0 {
            // Peer disconnected mid-body: no 201, no partially-visible file.
            self.state = ConnState::Error;
            self.check_invariants();
            return;
        }
        self.buf_len += n;
        self.state = if self.have_full_chunk_or_tail() {
            ConnState::Put(PutPhase::NeedFileWrite)
        } else {
            ConnState::Put(PutPhase::NeedSocketRecv)
        };
        self.check_invariants();
    }

    /// Length and offset for the next block-rounded positional write. The
    /// caller must have zero-padded `buf[logical_len..rounded_len]` before
    /// issuing the write (`AlignedBuffer::zero_tail`).
    pub fn next_put_write(&mut self) -> (u64, usize, usize) {
        let remaining = (self.file_size - self.byte_offset) as usize;
        let logical_len = self.buf_len.min(remaining);
        if logical_len < self.buf_len.min(self.buf.len() as usize) {
            self.buf.zero_tail(logical_len);
        }
        let rounded_len = round_up_to_block(logical_len);
        (self.byte_offset, logical_len, rounded_len)
    }

    /// The write completed; `written` is the number of (rounded) bytes
    /// the OS actually reports, `logical_len` is what `next_put_write`
    /// returned as the unrounded amount — the disk file ends up sized to
    /// the block-rounded total, not `file_size`. That is the flagged,
    /// intentionally-preserved PUT quirk: this code does not
    /// truncate the file back down afterward.
    pub fn on_put_file_write(&mut self, logical_len: usize) {
        self.byte_offset += logical_len as u64;
        self.buf_len = 0;
        self.util_offset = 0;
        self.state = if self.byte_offset >= self.file_size {
            ConnState::Closed
        } else {
            ConnState::Put(PutPhase::NeedSocketRecv)
        };
        self.check_invariants();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_outcome_rejects_unknown_method() {
        let buf = b"POST /x HTTP/1.1\r\n\r\n";
        match evaluate_header(buf, buf.len()) {
            HeaderOutcome::Reject { status, .. } => assert_eq!(status, Status::MethodNotAllowed405),
            _ => panic!("expected a rejection"),
        }
    }

    #[test]
    fn header_outcome_incomplete_without_sentinel() {
        let buf = b"GET /x HTTP/1.1\r\n";
        assert!(matches!(evaluate_header(buf, buf.len()), HeaderOutcome::Incomplete));
    }

    #[test]
    fn get_of_zero_byte_file_closes_without_a_send() {
        let mut conn = Connection::new(3);
        conn.begin_get(4, 0);
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn get_pump_alternates_read_and_send_until_file_size_reached() {
        let mut conn = Connection::new(3);
        conn.begin_get(4, 10);
        assert_eq!(conn.state, ConnState::Get(GetPhase::NeedFileRead));

        conn.on_get_file_read(10);
        assert_eq!(conn.state, ConnState::Get(GetPhase::NeedSocketSend));

        conn.on_get_socket_send(4);
        assert_eq!(conn.state, ConnState::Get(GetPhase::NeedSocketSend));
        assert_eq!(conn.byte_offset, 4);

        conn.on_get_socket_send(6);
        assert_eq!(conn.state, ConnState::Closed);
        assert_eq!(conn.byte_offset, 10);
    }

    #[test]
    fn put_zero_length_closes_immediately() {
        let mut conn = Connection::new(3);
        conn.begin_put(4, 0, 0, 0);
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn put_disconnect_mid_body_is_error_not_closed() {
        let mut conn = Connection::new(3);
        conn.begin_put(4, 100, 0, 0);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedSocketRecv));
        conn.on_put_socket_recv(0);
        assert_eq!(conn.state, ConnState::Error);
    }

    #[test]
    fn put_write_is_block_rounded_past_logical_length() {
        let mut conn = Connection::new(3);
        conn.begin_put(4, 100, 0, 0);
        conn.on_put_socket_recv(100);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedFileWrite));

        let (offset, logical_len, rounded_len) = conn.next_put_write();
        assert_eq!(offset, 0);
        assert_eq!(logical_len, 100);
        assert_eq!(rounded_len, 4096);

        conn.on_put_file_write(logical_len);
        assert_eq!(conn.byte_offset, 100);
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn put_crossing_two_full_buffers_writes_each_as_a_full_chunk() {
        let mut conn = Connection::new(3);
        let total = 2 * crate::config::BUFFER_SIZE as u64;
        conn.begin_put(4, total, 0, 0);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedSocketRecv));

        conn.on_put_socket_recv(crate::config::BUFFER_SIZE);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedFileWrite));
        let (offset, logical_len, rounded_len) = conn.next_put_write();
        assert_eq!(offset, 0);
        assert_eq!(logical_len, crate::config::BUFFER_SIZE);
        assert_eq!(rounded_len, crate::config::BUFFER_SIZE);
        conn.on_put_file_write(logical_len);
        assert_eq!(conn.byte_offset, crate::config::BUFFER_SIZE as u64);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedSocketRecv));

        conn.on_put_socket_recv(crate::config::BUFFER_SIZE);
        assert_eq!(conn.state, ConnState::Put(PutPhase::NeedFileWrite));
        let (offset, logical_len, rounded_len) = conn.next_put_write();
        assert_eq!(offset, crate::config::BUFFER_SIZE as u64);
        assert_eq!(logical_len, crate::config::BUFFER_SIZE);
        assert_eq!(rounded_len, crate::config::BUFFER_SIZE);
        conn.on_put_file_write(logical_len);
        assert_eq!(conn.byte_offset, total);
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn wanted_readiness_is_never_both_directions() {
        let mut conn = Connection::new(3);
        assert_eq!(conn.wanted_readiness(), Readiness::Read);
        conn.begin_get(4, 10);
        assert_eq!(conn.wanted_readiness(), Readiness::None);
        conn.on_get_file_read(10);
        assert_eq!(conn.wanted_readiness(), Readiness::Write);
    }
}
