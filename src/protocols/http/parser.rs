//! HTTP request parser.
//!
//! A three-state machine (request line, headers, body) layered over the
//! line scanner. The parser keeps its state between calls, so a request
//! split over any number of reads is parsed exactly as if it had arrived
//! at once.

use super::line::{self, LineStatus};
use super::{Malformed, Method, Outcome};
use crate::runtime::buffer::ReadBuffer;
use tracing::trace;

/// Parser main state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    RequestLine,
    Headers,
    Body,
}

/// Fields extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Absolute path, scheme and authority stripped.
    pub url: String,
    pub host: Option<String>,
    pub content_length: usize,
    /// `Connection: keep-alive` was requested.
    pub linger: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            url: String::new(),
            host: None,
            content_length: 0,
            linger: false,
        }
    }
}

/// Incremental request parser for one connection.
#[derive(Debug)]
pub struct RequestParser {
    state: MainState,
    request: Request,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: MainState::RequestLine,
            request: Request::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> MainState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Prepare for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = MainState::RequestLine;
        self.request = Request::default();
    }

    /// Parse as far as the buffered bytes allow.
    ///
    /// Returns `NeedMoreData`, `RequestComplete` or `Malformed`.
    pub fn advance(&mut self, buf: &mut ReadBuffer) -> Outcome {
        loop {
            if self.state == MainState::Body {
                return self.parse_body(buf);
            }

            let end = match line::scan(buf) {
                LineStatus::Complete { end } => end,
                LineStatus::Open => return Outcome::NeedMoreData,
                LineStatus::Bad => return Outcome::Malformed(Malformed::Line),
            };
            let text = match buf.take_line(end) {
                Ok(text) => text,
                Err(_) => return Outcome::InternalError,
            };

            let step = match self.state {
                MainState::RequestLine => self.parse_request_line(text),
                MainState::Headers => self.parse_header(text),
                MainState::Body => unreachable!("body handled above"),
            };

            match step {
                Step::Continue => {}
                Step::HeadersDone => {
                    let len = self.request.content_length;
                    if len == 0 {
                        return Outcome::RequestComplete;
                    }
                    if len > buf.capacity() - buf.checked_index() {
                        return Outcome::Malformed(Malformed::TooLarge);
                    }
                    self.state = MainState::Body;
                }
                Step::Reject(reason) => return Outcome::Malformed(reason),
            }
        }
    }

    fn parse_request_line(&mut self, text: &[u8]) -> Step {
        let mut tokens = text
            .split(|b| *b == b' ' || *b == b'\t')
            .filter(|token| !token.is_empty());

        let (method, url, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(url), Some(version)) => (method, url, version),
            _ => return Step::Reject(Malformed::RequestLine),
        };
        if tokens.next().is_some() {
            return Step::Reject(Malformed::RequestLine);
        }

        let method = match Method::from_token(method) {
            Some(Method::Get) => Method::Get,
            Some(other) => return Step::Reject(Malformed::UnsupportedMethod(other)),
            None => return Step::Reject(Malformed::Method),
        };

        if version != b"HTTP/1.1" {
            return Step::Reject(Malformed::Version);
        }

        let url = match strip_authority(url) {
            Some(path) if path.starts_with(b"/") => path,
            _ => return Step::Reject(Malformed::Url),
        };
        let url = match std::str::from_utf8(url) {
            Ok(url) => url.to_string(),
            Err(_) => return Step::Reject(Malformed::Url),
        };

        trace!(%method, url = %url, "request line");
        self.request.method = method;
        self.request.url = url;
        self.state = MainState::Headers;
        Step::Continue
    }

    fn parse_header(&mut self, text: &[u8]) -> Step {
        if text.is_empty() {
            return Step::HeadersDone;
        }

        let colon = match text.iter().position(|b| *b == b':') {
            Some(pos) => pos,
            None => return Step::Reject(Malformed::Header),
        };
        let name = text[..colon].trim_ascii();
        let value = text[colon + 1..].trim_ascii();

        if name.eq_ignore_ascii_case(b"Connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.request.linger = true;
            } else if value.eq_ignore_ascii_case(b"close") {
                self.request.linger = false;
            }
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            match std::str::from_utf8(value).ok().and_then(|v| v.parse::<usize>().ok()) {
                Some(len) => self.request.content_length = len,
                None => return Step::Reject(Malformed::Header),
            }
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.request.host = Some(String::from_utf8_lossy(value).into_owned());
        } else {
            trace!(header = %String::from_utf8_lossy(name), "ignoring header");
        }

        Step::Continue
    }

    fn parse_body(&mut self, buf: &mut ReadBuffer) -> Outcome {
        let len = self.request.content_length;
        if buf.unchecked() < len {
            return Outcome::NeedMoreData;
        }
        match buf.skip(len) {
            Ok(()) => Outcome::RequestComplete,
            Err(_) => Outcome::InternalError,
        }
    }
}

/// Per-line handler result.
enum Step {
    Continue,
    HeadersDone,
    Reject(Malformed),
}

/// Strip a leading `http://authority`, keeping the path.
///
/// Returns `None` for an absolute URL with no path.
fn strip_authority(url: &[u8]) -> Option<&[u8]> {
    const SCHEME: &[u8] = b"http://";
    if url.len() >= SCHEME.len() && url[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        let rest = &url[SCHEME.len()..];
        let slash = rest.iter().position(|b| *b == b'/')?;
        Some(&rest[slash..])
    } else {
        Some(url)
    }
}
