// src/http.rs
//
// The request lexer and response framer. Both are pure
// functions over byte slices: no socket, no file, so they are testable in
// isolation, with no socket or file required to exercise them.

const HEADER_SENTINEL: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH_HEADER: &[u8] = b"Content-Length: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Other,
}

impl Method {
    fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"PUT" => Method::Put,
            _ => Method::Other,
        }
    }
}

/// Outcome of scanning a growing header buffer for the end-of-headers
/// sentinel. `Incomplete` means "keep reading"; transports that only ever
/// issue a single read (the blocking single-threaded variant) treat
/// `Incomplete` after that one read as a 400.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderScan {
    Incomplete,
    /// `header_len` is the number of bytes up to and including the
    /// sentinel; `buf[header_len..]` is whatever body bytes arrived in the
    /// same read (the PUT pipeline's "initial body slice").
    Complete { header_len: usize },
}

/// Locate `\r\n\r\n` in `buf`. O(n); fine at `BUFFER_SIZE` scale and run at
/// most once per byte appended, same as the source's repeated `strstr`.
pub fn scan_headers(buf: &[u8]) -> HeaderScan {
    if buf.len() < HEADER_SENTINEL.len() {
        return HeaderScan::Incomplete;
    }
    match buf
        .windows(HEADER_SENTINEL.len())
        .position(|w| w == HEADER_SENTINEL)
    {
        Some(pos) => HeaderScan::Complete {
            header_len: pos + HEADER_SENTINEL.len(),
        },
        None => HeaderScan::Incomplete,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    pub method: Method,
    pub target: &'a str,
    /// Only meaningful (and only required) for PUT.
    pub content_length: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Method is neither GET nor PUT -> 405.
    UnknownMethod,
    /// Request line itself is not parseable as `<METHOD> <TARGET> ...` -> 400.
    MalformedRequestLine,
    /// PUT with no `Content-Length: ` header -> 411.
    MissingContentLength,
}

/// Parse the request line and, for PUT, the `Content-Length` header, out
/// of the header region `buf[..header_len]` identified by `scan_headers`.
/// Case-sensitive on `Content-Length: ` exactly as the source's `strstr`.
pub fn parse_request<'a>(buf: &'a [u8], header_len: usize) -> Result<ParsedRequest<'a>, ParseError> {
    let region = &buf[..header_len];

    let line_end = region
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(region.len());
    let line = &region[..line_end];

    let mut parts = line.splitn(3, |&b| b == b' ');
    let method_bytes = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let target_bytes = parts.next().ok_or(ParseError::MalformedRequestLine)?;

    let target = std::str::from_utf8(target_bytes).map_err(|_| ParseError::MalformedRequestLine)?;
    let method = Method::from_bytes(method_bytes);

    if method == Method::Other {
        return Err(ParseError::UnknownMethod);
    }

    let content_length = if method == Method::Put {
        Some(find_content_length(region).ok_or(ParseError::MissingContentLength)?)
    } else {
        None
    };

    Ok(ParsedRequest {
        method,
        target,
        content_length,
    })
}

fn find_content_length(region: &[u8]) -> Option<u64> {
    let pos = region
        .windows(CONTENT_LENGTH_HEADER.len())
        .position(|w| w == CONTENT_LENGTH_HEADER)?;
    let rest = &region[pos + CONTENT_LENGTH_HEADER.len()..];
    let end = rest.iter().position(|&b| b == b'\r').unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.trim().parse().ok()
}

pub fn mime_type_for(path: &str) -> &'static str {
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".pdf") {
        "application/pdf"
    } else if path.ends_with(".zip") {
        "application/zip"
    } else if path.ends_with(".txt") {
        "text/plain"
    } else if path.ends_with(".html") {
        "text/html"
    } else {
        "application/octet-stream"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok200,
    Created201,
    BadRequest400,
    NotFound404,
    MethodNotAllowed405,
    LengthRequired411,
    InternalServerError500,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok200 => "HTTP/1.1 200 OK",
            Status::Created201 => "HTTP/1.1 201 Created",
            Status::BadRequest400 => "HTTP/1.1 400 Bad Request",
            Status::NotFound404 => "HTTP/1.1 404 Not Found",
            Status::MethodNotAllowed405 => "HTTP/1.1 405 Method Not Allowed",
            Status::LengthRequired411 => "HTTP/1.1 411 Length Required",
            Status::InternalServerError500 => "HTTP/1.1 500 Internal Server Error",
        }
    }
}

/// Build a complete canned response (status line, `Content-Type`,
/// `Content-Length`, blank line, plain-text body) — used for every
/// response except the streamed GET body and the PUT final ack, whose
/// header needs a caller-supplied `Content-Length`/mime.
pub fn canned_response(status: Status, body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 96);
    out.extend_from_slice(status.line().as_bytes());
    out.extend_from_slice(b"\r\nContent-Type: text/plain\r\nContent-Length: ");
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}

/// Build the header for a GET response whose body is streamed separately
/// by the connection state machine, one chunk at a time.
pub fn get_header(content_type: &str, file_size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(Status::Ok200.line().as_bytes());
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(content_type.as_bytes());
    out.extend_from_slice(b"\r\nContent-Length: ");
    out.extend_from_slice(file_size.to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_headers_incomplete_without_sentinel() {
        assert_eq!(scan_headers(b"GET /x HTTP/1.1\r\nHost: a"), HeaderScan::Incomplete);
    }

    #[test]
    fn scan_headers_finds_sentinel_and_leaves_body_after_it() {
        let buf = b"GET /x HTTP/1.1\r\nHost: a\r\n\r\nBODY";
        match scan_headers(buf) {
            HeaderScan::Complete { header_len } => {
                assert_eq!(&buf[header_len..], b"BODY");
            }
            _ => panic!("expected complete scan"),
        }
    }

    #[test]
    fn parses_get_request_line() {
        let buf = b"GET /foo.txt HTTP/1.1\r\nHost: x\r\n\r\n";
        let HeaderScan::Complete { header_len } = scan_headers(buf) else {
            panic!()
        };
        let req = parse_request(buf, header_len).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/foo.txt");
        assert_eq!(req.content_length, None);
    }

    #[test]
    fn parses_put_content_length_case_sensitively() {
        let buf = b"PUT /upload/x HTTP/1.1\r\nContent-Length: 128\r\n\r\n";
        let HeaderScan::Complete { header_len } = scan_headers(buf) else {
            panic!()
        };
        let req = parse_request(buf, header_len).unwrap();
        assert_eq!(req.method, Method::Put);
        assert_eq!(req.content_length, Some(128));
    }

    #[test]
    fn put_without_content_length_is_length_required() {
        let buf = b"PUT /upload/x HTTP/1.1\r\nHost: a\r\n\r\n";
        let HeaderScan::Complete { header_len } = scan_headers(buf) else {
            panic!()
        };
        assert_eq!(
            parse_request(buf, header_len),
            Err(ParseError::MissingContentLength)
        );
    }

    #[test]
    fn unknown_method_is_rejected() {
        let buf = b"POST /x HTTP/1.1\r\n\r\n";
        let HeaderScan::Complete { header_len } = scan_headers(buf) else {
            panic!()
        };
        assert_eq!(parse_request(buf, header_len), Err(ParseError::UnknownMethod));
    }

    #[test]
    fn mime_type_matches_suffix_table() {
        assert_eq!(mime_type_for("/a/b.jpg"), "image/jpeg");
        assert_eq!(mime_type_for("/a/b.jpeg"), "image/jpeg");
        assert_eq!(mime_type_for("/a/b.pdf"), "application/pdf");
        assert_eq!(mime_type_for("/a/b.zip"), "application/zip");
        assert_eq!(mime_type_for("/a/b.txt"), "text/plain");
        assert_eq!(mime_type_for("/a/b.html"), "text/html");
        assert_eq!(mime_type_for("/a/b.bin"), "application/octet-stream");
    }

    #[test]
    fn get_header_has_content_length_and_blank_line() {
        let header = get_header("text/html", 1234);
        let s = String::from_utf8(header).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 1234\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }
}
