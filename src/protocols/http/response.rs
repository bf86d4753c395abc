//! Response framing.
//!
//! The status line and headers are formatted into the connection's write
//! buffer. A served file stays in its mapping and is sent as a second
//! segment of the same vectored write; error pages are small enough to go
//! into the write buffer behind the headers.

use super::Outcome;
use crate::runtime::buffer::{BufferError, WriteBuffer};
use crate::runtime::mapped::MappedFile;
use std::io::IoSlice;
use tracing::warn;

/// Content type of the canned error pages.
const ERROR_CONTENT_TYPE: &str = "text/html";

const PAGE_400: &str = "<html><body><h1>400 Bad Request</h1>\
<p>Your request has bad syntax or is inherently impossible to satisfy.</p></body></html>\n";
const PAGE_403: &str = "<html><body><h1>403 Forbidden</h1>\
<p>You do not have permission to get this file from the server.</p></body></html>\n";
const PAGE_404: &str = "<html><body><h1>404 Not Found</h1>\
<p>The requested file was not found on this server.</p></body></html>\n";
const PAGE_500: &str = "<html><body><h1>500 Internal Error</h1>\
<p>There was an unusual problem serving the requested file.</p></body></html>\n";

/// Status line for an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: &'static str,
}

impl Status {
    pub const OK: Status = Status { code: 200, reason: "OK" };
    pub const BAD_REQUEST: Status = Status { code: 400, reason: "Bad Request" };
    pub const FORBIDDEN: Status = Status { code: 403, reason: "Forbidden" };
    pub const NOT_FOUND: Status = Status { code: 404, reason: "Not Found" };
    pub const INTERNAL_ERROR: Status = Status { code: 500, reason: "Internal Error" };

    /// Status for a terminal outcome; `None` when nothing is sent.
    pub fn for_outcome(outcome: Outcome) -> Option<Status> {
        match outcome {
            Outcome::ServeFile { .. } => Some(Status::OK),
            Outcome::Malformed(_) => Some(Status::BAD_REQUEST),
            Outcome::Forbidden => Some(Status::FORBIDDEN),
            Outcome::NotFound => Some(Status::NOT_FOUND),
            Outcome::InternalError => Some(Status::INTERNAL_ERROR),
            Outcome::NeedMoreData | Outcome::RequestComplete | Outcome::PeerClosed => None,
        }
    }

    fn page(&self) -> &'static str {
        match self.code {
            400 => PAGE_400,
            403 => PAGE_403,
            404 => PAGE_404,
            _ => PAGE_500,
        }
    }
}

/// Appends response pieces to a write buffer.
///
/// Every method either appends completely or fails and leaves the buffer
/// as it was.
pub struct ResponseWriter<'a> {
    buf: &'a mut WriteBuffer,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut WriteBuffer) -> Self {
        Self { buf }
    }

    pub fn status_line(&mut self, status: Status) -> Result<(), BufferError> {
        self.buf
            .append_fmt(format_args!("HTTP/1.1 {} {}\r\n", status.code, status.reason))
    }

    pub fn content_type(&mut self, content_type: &str) -> Result<(), BufferError> {
        self.buf
            .append_fmt(format_args!("Content-Type: {}\r\n", content_type))
    }

    pub fn content_length(&mut self, len: usize) -> Result<(), BufferError> {
        self.buf.append_fmt(format_args!("Content-Length: {}\r\n", len))
    }

    pub fn linger(&mut self, linger: bool) -> Result<(), BufferError> {
        let value = if linger { "keep-alive" } else { "close" };
        self.buf.append_fmt(format_args!("Connection: {}\r\n", value))
    }

    pub fn blank_line(&mut self) -> Result<(), BufferError> {
        self.buf.append(b"\r\n")
    }

    pub fn content(&mut self, body: &str) -> Result<(), BufferError> {
        self.buf.append(body.as_bytes())
    }

    /// Headers shared by every response.
    pub fn headers(
        &mut self,
        content_type: &str,
        len: usize,
        linger: bool,
    ) -> Result<(), BufferError> {
        self.content_type(content_type)?;
        self.content_length(len)?;
        self.linger(linger)?;
        self.blank_line()
    }
}

/// A framed response waiting to be written.
///
/// Segment 0 is the write buffer's first `head_len` bytes, segment 1 the
/// mapped file (if any). `sent` counts bytes already written across both.
#[derive(Debug)]
pub struct Transfer {
    head_len: usize,
    body: Option<MappedFile>,
    sent: usize,
    linger: bool,
}

impl Transfer {
    fn total(&self) -> usize {
        self.head_len + self.body.as_ref().map_or(0, MappedFile::len)
    }

    /// Bytes still to send.
    pub fn remaining(&self) -> usize {
        self.total() - self.sent
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn linger(&self) -> bool {
        self.linger
    }

    /// Number of segments in the response (1 or 2).
    pub fn segment_count(&self) -> usize {
        match &self.body {
            Some(body) if !body.is_empty() => 2,
            _ => 1,
        }
    }

    /// Unsent parts of the segments, starting mid-segment after a short
    /// write. `head` is the write buffer contents.
    pub fn io_slices<'a>(&'a self, head: &'a [u8]) -> Vec<IoSlice<'a>> {
        let mut slices = Vec::with_capacity(2);

        let head = head.get(..self.head_len).unwrap_or(&[]);
        if self.sent < head.len() {
            slices.push(IoSlice::new(&head[self.sent..]));
        }

        if let Some(body) = &self.body {
            let offset = self.sent.saturating_sub(self.head_len);
            if let Some(rest) = body.as_slice().get(offset..) {
                if !rest.is_empty() {
                    slices.push(IoSlice::new(rest));
                }
            }
        }

        slices
    }

    /// Record `n` more bytes as written.
    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.total());
    }
}

/// A framed response and the outcome it actually answers.
#[derive(Debug)]
pub struct Response {
    /// Differs from the requested outcome when framing overflowed and a 500
    /// was substituted.
    pub outcome: Outcome,
    pub transfer: Transfer,
}

/// Frame the response for `outcome` into `buf`.
///
/// `body` is the mapped file for `ServeFile`. If the response does not fit,
/// a 500 is framed instead; if that does not fit either, `None` is
/// returned and the connection should be closed.
pub fn build(
    buf: &mut WriteBuffer,
    outcome: Outcome,
    body: Option<MappedFile>,
    linger: bool,
    content_type: &str,
) -> Option<Response> {
    let status = Status::for_outcome(outcome)?;
    buf.clear();

    match frame(buf, status, body.as_ref(), linger, content_type) {
        Ok(head_len) => Some(Response {
            outcome,
            transfer: Transfer {
                head_len,
                body: if status == Status::OK { body } else { None },
                sent: 0,
                linger,
            },
        }),
        Err(e) => {
            warn!(error = %e, code = status.code, "response does not fit write buffer");
            drop(body);
            buf.clear();
            let head_len = frame(buf, Status::INTERNAL_ERROR, None, false, content_type).ok()?;
            Some(Response {
                outcome: Outcome::InternalError,
                transfer: Transfer {
                    head_len,
                    body: None,
                    sent: 0,
                    linger: false,
                },
            })
        }
    }
}

fn frame(
    buf: &mut WriteBuffer,
    status: Status,
    body: Option<&MappedFile>,
    linger: bool,
    content_type: &str,
) -> Result<usize, BufferError> {
    let mut writer = ResponseWriter::new(buf);
    writer.status_line(status)?;

    if status == Status::OK {
        let len = body.map_or(0, MappedFile::len);
        writer.headers(content_type, len, linger)?;
    } else {
        let page = status.page();
        writer.headers(ERROR_CONTENT_TYPE, page.len(), linger)?;
        writer.content(page)?;
    }

    Ok(buf.write_index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::Malformed;

    fn flatten(transfer: &Transfer, head: &[u8]) -> Vec<u8> {
        transfer
            .io_slices(head)
            .iter()
            .flat_map(|s| s.iter().copied())
            .collect()
    }

    fn mapped(content: &[u8]) -> (tempfile::TempDir, MappedFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.html");
        std::fs::write(&path, content).unwrap();
        let file = MappedFile::open(&path).unwrap();
        (dir, file)
    }

    #[test]
    fn test_not_found_response() {
        let mut buf = WriteBuffer::new(1024);
        let resp = build(&mut buf, Outcome::NotFound, None, false, "text/plain").unwrap();

        assert_eq!(resp.outcome, Outcome::NotFound);
        assert_eq!(resp.transfer.segment_count(), 1);

        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        let expected = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            PAGE_404.len(),
            PAGE_404
        );
        assert_eq!(text, expected);
        assert_eq!(resp.transfer.remaining(), expected.len());
    }

    #[test]
    fn test_serve_file_uses_two_segments() {
        let (_dir, file) = mapped(b"<p>body</p>");
        let mut buf = WriteBuffer::new(1024);
        let resp = build(
            &mut buf,
            Outcome::ServeFile { len: 11 },
            Some(file),
            true,
            "text/html",
        )
        .unwrap();

        let head = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 11\r\nConnection: keep-alive\r\n\r\n";
        assert_eq!(buf.filled(), &head[..]);
        assert_eq!(resp.transfer.segment_count(), 2);
        assert!(resp.transfer.linger());

        let slices = resp.transfer.io_slices(buf.filled());
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[1], b"<p>body</p>");
    }

    #[test]
    fn test_partial_writes_resume_mid_segment() {
        let (_dir, file) = mapped(b"0123456789");
        let mut buf = WriteBuffer::new(1024);
        let mut transfer = build(
            &mut buf,
            Outcome::ServeFile { len: 10 },
            Some(file),
            false,
            "text/html",
        )
        .unwrap()
        .transfer;

        let mut expected = buf.filled().to_vec();
        expected.extend_from_slice(b"0123456789");
        let head_len = buf.write_index();

        // Short write inside the header
        transfer.advance(5);
        assert_eq!(flatten(&transfer, buf.filled()), &expected[5..]);

        // Short write crossing into the body
        transfer.advance(head_len - 5 + 3);
        let slices = transfer.io_slices(buf.filled());
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"3456789");
        assert_eq!(transfer.remaining(), 7);

        transfer.advance(100);
        assert!(transfer.is_complete());
        assert!(transfer.io_slices(buf.filled()).is_empty());
    }

    #[test]
    fn test_malformed_always_closes_page() {
        let mut buf = WriteBuffer::new(1024);
        let resp = build(
            &mut buf,
            Outcome::Malformed(Malformed::Version),
            None,
            false,
            "text/html",
        )
        .unwrap();
        assert!(buf.filled().starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(buf.filled().ends_with(PAGE_400.as_bytes()));
        assert!(!resp.transfer.linger());
    }

    #[test]
    fn test_overflow_substitutes_internal_error() {
        let (_dir, file) = mapped(b"data");
        let mut buf = WriteBuffer::new(1024);
        let huge_type = "x".repeat(1000);
        let resp = build(
            &mut buf,
            Outcome::ServeFile { len: 4 },
            Some(file),
            true,
            &huge_type,
        )
        .unwrap();

        assert_eq!(resp.outcome, Outcome::InternalError);
        assert!(!resp.transfer.linger());
        assert_eq!(resp.transfer.segment_count(), 1);
        assert!(buf.filled().starts_with(b"HTTP/1.1 500 Internal Error\r\n"));
        assert!(buf.filled().ends_with(PAGE_500.as_bytes()));
    }

    #[test]
    fn test_nothing_fits() {
        let mut buf = WriteBuffer::new(16);
        assert!(build(&mut buf, Outcome::NotFound, None, false, "text/html").is_none());
    }

    #[test]
    fn test_no_response_for_non_terminal() {
        let mut buf = WriteBuffer::new(1024);
        assert!(build(&mut buf, Outcome::NeedMoreData, None, false, "text/html").is_none());
        assert!(build(&mut buf, Outcome::PeerClosed, None, false, "text/html").is_none());
    }
}
