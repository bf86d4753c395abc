//! mmap-httpd: an event-driven static file HTTP server
//!
//! Features:
//! - Incremental HTTP/1.1 request parsing over non-blocking sockets
//! - GET of files under a document root
//! - Zero-copy responses: headers and the mmap'd file go out in one writev
//! - Keep-alive, including pipelined requests
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        doc_root = %config.doc_root.display(),
        workers = ?config.workers,
        max_connections = config.max_connections,
        "Starting mmap-httpd server"
    );

    if !config.doc_root.is_dir() {
        error!(doc_root = %config.doc_root.display(), "Document root is not a directory");
        return Err(format!("document root '{}' is not a directory", config.doc_root.display()).into());
    }

    runtime::run(config)?;
    Ok(())
}
