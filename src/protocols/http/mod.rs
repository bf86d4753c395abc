//! HTTP/1.1 static file protocol.
//!
//! Request handling is split into layers that the connection drives in
//! order:
//!
//! - `line`: finds `\r\n`-terminated lines in the read buffer
//! - `parser`: request-line / headers / body state machine
//! - `resolve`: maps a URL onto a file under the document root
//! - `response`: frames the status line, headers and body segments
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  GET /index.html HTTP/1.1\r\n
//!           Host: example\r\n
//!           Connection: keep-alive\r\n
//!           \r\n
//!
//! Response: HTTP/1.1 200 OK\r\n
//!           Content-Type: text/html\r\n
//!           Content-Length: 1234\r\n
//!           Connection: keep-alive\r\n
//!           \r\n
//!           <file contents>
//! ```

pub mod line;
pub mod parser;
pub mod resolve;
pub mod response;

pub use parser::RequestParser;
pub use resolve::Resolver;
pub use response::Transfer;

use std::fmt;

/// Request methods the parser recognizes. Only `Get` is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    /// Match a method token, ignoring ASCII case.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token.to_ascii_uppercase().as_slice() {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"TRACE" => Some(Method::Trace),
            b"OPTIONS" => Some(Method::Options),
            b"CONNECT" => Some(Method::Connect),
            b"PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was rejected with 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Bad line terminator (`\r` or `\n` out of place).
    Line,
    /// Request line does not have exactly three tokens.
    RequestLine,
    /// Method token is not an HTTP method.
    Method,
    /// A recognized method other than GET.
    UnsupportedMethod(Method),
    /// URL is not an absolute path.
    Url,
    /// Version is not `HTTP/1.1`.
    Version,
    /// Header line without a colon, or an unparseable value.
    Header,
    /// Request (or its declared body) does not fit in the read buffer.
    TooLarge,
    /// URL names a directory.
    Directory,
}

/// Result of one `process()` pass over a connection.
///
/// `NeedMoreData` is the only non-terminal variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request incomplete, wait for more readable data.
    NeedMoreData,
    /// Request fully parsed, not yet resolved.
    RequestComplete,
    /// 400
    Malformed(Malformed),
    /// 404
    NotFound,
    /// 403
    Forbidden,
    /// 200 with a `len`-byte body.
    ServeFile { len: usize },
    /// 500
    InternalError,
    /// Peer went away; nothing is sent.
    PeerClosed,
}

impl Outcome {
    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::NeedMoreData)
    }

    /// Whether the connection may stay open after answering this outcome.
    ///
    /// Resource errors answer a well-formed request and keep the client's
    /// keep-alive choice; protocol and internal errors always close.
    pub fn allows_linger(&self) -> bool {
        matches!(
            self,
            Outcome::ServeFile { .. } | Outcome::NotFound | Outcome::Forbidden
        )
    }
}
