//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then the connection performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker thread owns a `Poll`, a `SO_REUSEPORT` listener and the
//! connections it accepted, so a connection is only ever handled by one
//! thread. The connection limit is shared through `UserCount`.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionConfig, ConnectionRegistry, Rearm, UserCount};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Run the mio-based server.
pub fn run(config: Config, conn_config: Arc<ConnectionConfig>) -> io::Result<()> {
    let num_workers = config.workers.unwrap_or_else(num_cpus);

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(
        workers = num_workers,
        addr = %addr,
        doc_root = %conn_config.resolver.doc_root().display(),
        "Starting mio runtime"
    );

    let users = UserCount::default();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let conn_config = Arc::clone(&conn_config);
        let users = users.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, addr, &config, conn_config, users) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_loop(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    conn_config: Arc<ConnectionConfig>,
    users: UserCount,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(config.events_capacity);

    // Create listener with SO_REUSEPORT for kernel load balancing
    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections = ConnectionRegistry::new(config.max_connections, users);

    info!(worker = worker_id, "Worker started");

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&listener, &poll, &mut connections, &conn_config, worker_id)?;
                }
                Token(conn_id) => {
                    if let Err(e) = handle_connection_event(conn_id, event, &poll, &mut connections) {
                        debug!(conn_id, error = %e, "Connection error");
                        close_connection(&poll, &mut connections, conn_id);
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry<TcpStream>,
    conn_config: &Arc<ConnectionConfig>,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn = Connection::new(stream, Arc::clone(conn_config));
                let conn_id = match connections.insert(conn) {
                    Some(id) => id,
                    None => {
                        // Dropping the connection closes the socket
                        warn!(peer = %peer_addr, "Connection limit reached");
                        continue;
                    }
                };

                let registered = match connections.get_mut(conn_id) {
                    Some(conn) => poll.registry().register(
                        conn.stream_mut(),
                        Token(conn_id),
                        Interest::READABLE,
                    ),
                    None => continue,
                };
                if let Err(e) = registered {
                    warn!(conn_id, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    active = connections.len(),
                    total = connections.total(),
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &Poll,
    connections: &mut ConnectionRegistry<TcpStream>,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(()),
    };

    if event.is_readable() && conn.read() {
        let outcome = conn.process();
        trace!(conn_id, ?outcome, "processed");
    }

    if event.is_writable() && conn.rearm() == Rearm::Writable {
        conn.write();
        // Pipelined request already buffered; no readiness event will come for it
        if conn.has_pending_input() {
            let outcome = conn.process();
            trace!(conn_id, ?outcome, "processed pipelined request");
        }
    }

    match conn.rearm() {
        Rearm::Readable => {
            poll.registry()
                .reregister(conn.stream_mut(), Token(conn_id), Interest::READABLE)?;
        }
        Rearm::Writable => {
            poll.registry()
                .reregister(conn.stream_mut(), Token(conn_id), Interest::WRITABLE)?;
        }
        Rearm::Close => close_connection(poll, connections, conn_id),
    }

    Ok(())
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry<TcpStream>, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(conn.stream_mut());
        conn.close();
        debug!(conn_id, idle = connections.is_empty(), "Connection closed");
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
