//! Runtime for the HTTP server.
//!
//! - `buffer`: bounds-checked per-connection read/write buffers
//! - `mapped`: read-only file mappings released on drop
//! - `connection`: the per-connection state machine and its registry
//! - `mio_impl`: readiness event loop, one `Poll` per worker thread

pub mod buffer;
pub mod connection;
pub mod mapped;
mod mio_impl;

use crate::config::Config;
use crate::protocols::http::Resolver;
use connection::ConnectionConfig;
use std::sync::Arc;

/// Run the server until a worker fails.
pub fn run(config: Config) -> std::io::Result<()> {
    let conn_config = Arc::new(ConnectionConfig {
        resolver: Resolver::new(
            config.doc_root.clone(),
            config.index.clone(),
            config.max_path_len,
        ),
        content_type: config.content_type.clone(),
        read_buffer_size: config.read_buffer_size,
        write_buffer_size: config.write_buffer_size,
    });

    mio_impl::run(config, conn_config)
}
