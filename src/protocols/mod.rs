//! Protocol implementations.
//!
//! - `http`: HTTP/1.1 GET of static files from a document root

pub mod http;
