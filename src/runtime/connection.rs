//! Per-connection HTTP state machine.
//!
//! A `Connection` owns one accepted socket and drives it from "readable"
//! to "response fully written":
//!
//! ```text
//! AwaitingRead --read()/process()--> Parsing --terminal--> AwaitingWrite
//!      ^                                |                        |
//!      +------- NeedMoreData -----------+                        |
//!      +------------------ write() done, keep-alive -------------+
//!                                  write() done / error --> Closed
//! ```
//!
//! After each call the owner asks `rearm()` which readiness interest to
//! register next. Nothing here blocks: every socket call is non-blocking
//! and a would-block simply returns.

use crate::protocols::http::response;
use crate::protocols::http::{Malformed, Outcome, RequestParser, Resolver, Transfer};
use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Settings shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub resolver: Resolver,
    /// Content type sent with served files.
    pub content_type: String,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for request bytes.
    AwaitingRead,
    /// Inside `process()`.
    Parsing,
    /// Response framed, waiting for the socket to accept it.
    AwaitingWrite,
    /// Torn down; the owner should drop the connection.
    Closed,
}

/// Readiness interest to register after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    Readable,
    Writable,
    /// Deregister and drop the connection.
    Close,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    parser: RequestParser,
    /// Terminal outcome of the current request, once reached.
    outcome: Option<Outcome>,
    /// Pending response; owns the file mapping while it is being sent.
    transfer: Option<Transfer>,
    config: Arc<ConnectionConfig>,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a freshly accepted, non-blocking socket.
    pub fn new(stream: S, config: Arc<ConnectionConfig>) -> Self {
        Self {
            stream,
            state: ConnState::AwaitingRead,
            read_buf: ReadBuffer::new(config.read_buffer_size),
            write_buf: WriteBuffer::new(config.write_buffer_size),
            parser: RequestParser::new(),
            outcome: None,
            transfer: None,
            config,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read cursors `(start_line, checked_index, read_index)`.
    #[cfg(test)]
    pub fn cursors(&self) -> (usize, usize, usize) {
        (
            self.read_buf.start_line(),
            self.read_buf.checked_index(),
            self.read_buf.read_index(),
        )
    }

    /// Buffered bytes not yet consumed by the parser.
    ///
    /// Non-zero after a keep-alive re-init when the client pipelined; the
    /// owner should `process()` again instead of waiting for readiness.
    pub fn has_pending_input(&self) -> bool {
        self.state == ConnState::AwaitingRead && self.read_buf.unchecked() > 0
    }

    /// Interest to register after the last call.
    pub fn rearm(&self) -> Rearm {
        match self.state {
            ConnState::AwaitingRead | ConnState::Parsing => Rearm::Readable,
            ConnState::AwaitingWrite => Rearm::Writable,
            ConnState::Closed => Rearm::Close,
        }
    }

    /// Drain the socket into the read buffer.
    ///
    /// Returns false when the peer closed or the read failed; the
    /// connection is then `Closed`.
    pub fn read(&mut self) -> bool {
        match self.state {
            ConnState::Closed => return false,
            // A response is still pending; leave further bytes in the socket.
            ConnState::AwaitingWrite => return true,
            ConnState::AwaitingRead | ConnState::Parsing => {}
        }

        let mut total = 0;
        loop {
            let spare = self.read_buf.spare_mut();
            if spare.is_empty() {
                break;
            }
            match self.stream.read(spare) {
                Ok(0) => {
                    debug!("peer closed connection");
                    self.close();
                    return false;
                }
                Ok(n) => {
                    if self.read_buf.commit(n).is_err() {
                        self.close();
                        return false;
                    }
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    self.close();
                    return false;
                }
            }
        }

        trace!(bytes = total, buffered = self.read_buf.read_index(), "read");
        true
    }

    /// Advance the request as far as buffered bytes allow and, on a
    /// terminal outcome, frame the response.
    ///
    /// Calling again while the response is pending returns the same
    /// outcome without resolving the file a second time.
    pub fn process(&mut self) -> Outcome {
        match self.state {
            ConnState::Closed => return Outcome::PeerClosed,
            ConnState::AwaitingWrite => {
                return self.outcome.unwrap_or(Outcome::InternalError);
            }
            ConnState::AwaitingRead | ConnState::Parsing => {}
        }

        self.state = ConnState::Parsing;
        let outcome = match self.parser.advance(&mut self.read_buf) {
            Outcome::NeedMoreData if self.read_buf.is_full() => {
                Outcome::Malformed(Malformed::TooLarge)
            }
            Outcome::NeedMoreData => {
                self.state = ConnState::AwaitingRead;
                return Outcome::NeedMoreData;
            }
            outcome => outcome,
        };

        let (outcome, body) = match outcome {
            Outcome::RequestComplete => {
                match self.config.resolver.resolve(&self.parser.request().url) {
                    Ok(file) => (Outcome::ServeFile { len: file.len() }, Some(file)),
                    Err(outcome) => (outcome, None),
                }
            }
            outcome => (outcome, None),
        };

        let linger = outcome.allows_linger() && self.parser.request().linger;
        match response::build(
            &mut self.write_buf,
            outcome,
            body,
            linger,
            &self.config.content_type,
        ) {
            Some(response) => {
                debug!(
                    url = %self.parser.request().url,
                    outcome = ?response.outcome,
                    linger = response.transfer.linger(),
                    segments = response.transfer.segment_count(),
                    "request processed"
                );
                self.outcome = Some(response.outcome);
                self.transfer = Some(response.transfer);
                self.state = ConnState::AwaitingWrite;
                response.outcome
            }
            None => {
                debug!(?outcome, "no response possible, closing");
                self.close();
                Outcome::PeerClosed
            }
        }
    }

    /// Write as much of the pending response as the socket accepts.
    ///
    /// Returns false once the connection is closed: the response finished
    /// without keep-alive, or the write failed.
    pub fn write(&mut self) -> bool {
        match self.state {
            ConnState::AwaitingWrite => {}
            ConnState::Closed => return false,
            ConnState::AwaitingRead | ConnState::Parsing => return true,
        }

        let transfer = match self.transfer.as_mut() {
            Some(transfer) => transfer,
            None => {
                self.close();
                return false;
            }
        };

        while !transfer.is_complete() {
            let written = {
                let slices = transfer.io_slices(self.write_buf.filled());
                self.stream.write_vectored(&slices)
            };
            match written {
                Ok(0) => {
                    debug!("write returned 0");
                    self.close();
                    return false;
                }
                Ok(n) => {
                    transfer.advance(n);
                    trace!(bytes = n, remaining = transfer.remaining(), "wrote");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "write failed");
                    self.close();
                    return false;
                }
            }
        }

        if transfer.linger() {
            self.reinit();
            true
        } else {
            self.close();
            false
        }
    }

    /// Start over for the next request on the same socket.
    fn reinit(&mut self) {
        self.transfer = None;
        self.outcome = None;
        self.parser.reset();
        self.read_buf.compact();
        self.write_buf.clear();
        self.state = ConnState::AwaitingRead;
    }

    /// Tear down: release the mapping and mark the connection for removal.
    ///
    /// The socket itself is closed when the owner drops the connection.
    pub fn close(&mut self) {
        self.transfer = None;
        self.outcome = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.state = ConnState::Closed;
    }
}

/// Live connection count shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct UserCount(Arc<AtomicUsize>);

impl UserCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Take a slot if fewer than `max` are in use.
    fn try_acquire(&self, max: usize) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of a worker's connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove. The connection limit is
/// global: every worker's registry draws from the same `UserCount`.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    users: UserCount,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    pub fn new(max_connections: usize, users: UserCount) -> Self {
        Self {
            connections: Slab::new(),
            users,
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns `None` if the server-wide limit is reached.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if !self.users.try_acquire(self.max_connections) {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, releasing its slot.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(id)?;
        self.users.release();
        Some(conn)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Connections open across all workers.
    pub fn total(&self) -> usize {
        self.users.get()
    }

    /// Connections held by this registry.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<S> Drop for ConnectionRegistry<S> {
    fn drop(&mut self) {
        for _ in self.connections.drain() {
            self.users.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::IoSlice;

    /// In-memory socket: hands out queued chunks, then would-block (or EOF),
    /// and accepts at most `write_limit` bytes per write.
    #[derive(Default)]
    struct ScriptedStream {
        inbound: VecDeque<Vec<u8>>,
        eof: bool,
        written: Vec<u8>,
        write_limit: Option<usize>,
        /// Return would-block on every other write.
        stall_writes: bool,
        stalled: bool,
    }

    impl ScriptedStream {
        fn feed(&mut self, data: &[u8]) {
            self.inbound.push_back(data.to_vec());
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.inbound.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_vectored(&[IoSlice::new(buf)])
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if self.stall_writes {
                self.stalled = !self.stalled;
                if self.stalled {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
            }
            let mut budget = self.write_limit.unwrap_or(usize::MAX);
            let mut n = 0;
            for buf in bufs {
                let take = buf.len().min(budget);
                self.written.extend_from_slice(&buf[..take]);
                budget -= take;
                n += take;
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const INDEX: &[u8] = b"<html><body>hello from the index</body></html>\n";

    fn site() -> (tempfile::TempDir, Arc<ConnectionConfig>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), INDEX).unwrap();
        std::fs::write(dir.path().join("b.html"), b"second").unwrap();
        let config = Arc::new(ConnectionConfig {
            resolver: Resolver::new(dir.path(), "index.html", 4096),
            content_type: "text/html".to_string(),
            read_buffer_size: 2048,
            write_buffer_size: 1024,
        });
        (dir, config)
    }

    fn connection(config: &Arc<ConnectionConfig>) -> Connection<ScriptedStream> {
        Connection::new(ScriptedStream::default(), Arc::clone(config))
    }

    /// Deliver `chunks` one read at a time, then write out the response.
    fn exchange(conn: &mut Connection<ScriptedStream>, chunks: &[&[u8]]) -> Outcome {
        let mut outcome = Outcome::NeedMoreData;
        for chunk in chunks {
            conn.stream_mut().feed(chunk);
            assert!(conn.read());
            outcome = conn.process();
        }
        while conn.rearm() == Rearm::Writable {
            conn.write();
        }
        outcome
    }

    fn take_written(conn: &mut Connection<ScriptedStream>) -> Vec<u8> {
        std::mem::take(&mut conn.stream_mut().written)
    }

    fn expected_ok(body: &[u8], linger: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
            body.len(),
            if linger { "keep-alive" } else { "close" }
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let (_dir, config) = site();
        let mut conn = connection(&config);

        let first = exchange(
            &mut conn,
            &[b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n"],
        );
        assert_eq!(first, Outcome::ServeFile { len: INDEX.len() });
        assert_eq!(take_written(&mut conn), expected_ok(INDEX, true));

        // Linger keeps the socket and resets all request state
        assert_eq!(conn.state(), ConnState::AwaitingRead);
        assert_eq!(conn.rearm(), Rearm::Readable);
        assert_eq!(conn.cursors(), (0, 0, 0));

        let second = exchange(&mut conn, &[b"GET /b.html HTTP/1.1\r\n\r\n"]);
        assert_eq!(second, Outcome::ServeFile { len: 6 });
        assert_eq!(take_written(&mut conn), expected_ok(b"second", false));
        assert_eq!(conn.rearm(), Rearm::Close);
    }

    #[test]
    fn test_missing_resource_closes() {
        let (_dir, config) = site();
        let mut conn = connection(&config);

        let outcome = exchange(&mut conn, &[b"GET /nope.html HTTP/1.1\r\n\r\n"]);
        assert_eq!(outcome, Outcome::NotFound);

        let written = String::from_utf8(take_written(&mut conn)).unwrap();
        assert!(written.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(written.contains("Connection: close\r\n"));
        let body = written.split("\r\n\r\n").nth(1).unwrap();
        assert!(!body.is_empty());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_not_found_honours_keep_alive() {
        let (_dir, config) = site();
        let mut conn = connection(&config);

        exchange(
            &mut conn,
            &[b"GET /nope.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"],
        );
        let written = String::from_utf8(take_written(&mut conn)).unwrap();
        assert!(written.contains("Connection: keep-alive\r\n"));
        assert_eq!(conn.rearm(), Rearm::Readable);
    }

    #[test]
    fn test_malformed_requests_are_rejected() {
        let (_dir, config) = site();

        for request in [
            &b"GET /x\r\n\r\n"[..],
            &b"FOO / HTTP/1.1\r\n\r\n"[..],
            &b"POST / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"[..],
        ] {
            let mut conn = connection(&config);
            conn.stream_mut().feed(request);
            assert!(conn.read());
            let outcome = conn.process();
            assert!(matches!(outcome, Outcome::Malformed(_)), "{outcome:?}");

            while conn.rearm() == Rearm::Writable {
                conn.write();
            }
            let written = String::from_utf8(take_written(&mut conn)).unwrap();
            assert!(written.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert!(written.contains("Connection: close\r\n"));
            assert_eq!(conn.state(), ConnState::Closed);
        }
    }

    #[test]
    fn test_fragmented_delivery_matches_single_chunk() {
        let (_dir, config) = site();
        let request: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";

        let mut whole = connection(&config);
        let whole_outcome = exchange(&mut whole, &[request]);
        let whole_bytes = take_written(&mut whole);

        for size in [1, 2, 3, 7, 16] {
            let chunks: Vec<&[u8]> = request.chunks(size).collect();
            let mut conn = connection(&config);

            let mut last = (0, 0, 0);
            let mut outcome = Outcome::NeedMoreData;
            for (i, chunk) in chunks.iter().enumerate() {
                conn.stream_mut().feed(chunk);
                assert!(conn.read());
                outcome = conn.process();

                let cursors = conn.cursors();
                assert!(cursors.0 <= cursors.1 && cursors.1 <= cursors.2);
                assert!(cursors.0 >= last.0 && cursors.1 >= last.1 && cursors.2 >= last.2);
                last = cursors;

                if i + 1 < chunks.len() {
                    assert_eq!(outcome, Outcome::NeedMoreData);
                    assert_eq!(conn.rearm(), Rearm::Readable);
                }
            }
            while conn.rearm() == Rearm::Writable {
                conn.write();
            }

            assert_eq!(outcome, whole_outcome);
            assert_eq!(take_written(&mut conn), whole_bytes);
        }
    }

    #[test]
    fn test_process_is_idempotent_while_writing() {
        let (_dir, config) = site();
        let mut conn = connection(&config);
        conn.stream_mut().feed(b"GET / HTTP/1.1\r\n\r\n");
        assert!(conn.read());

        let first = conn.process();
        assert_eq!(first, Outcome::ServeFile { len: INDEX.len() });
        assert_eq!(conn.rearm(), Rearm::Writable);

        // Second call neither re-resolves nor reframes
        let head = conn.write_buf.filled().to_vec();
        assert_eq!(conn.process(), first);
        assert_eq!(conn.write_buf.filled(), &head[..]);
        assert_eq!(conn.rearm(), Rearm::Writable);
    }

    #[test]
    fn test_body_bound_with_pipelined_request() {
        let (_dir, config) = site();
        let mut conn = connection(&config);

        conn.stream_mut()
            .feed(b"GET /b.html HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 10\r\n\r\n12345");
        assert!(conn.read());
        assert_eq!(conn.process(), Outcome::NeedMoreData);

        conn.stream_mut().feed(b"67890GET / HTTP/1.1\r\n\r\n");
        assert!(conn.read());
        assert_eq!(conn.process(), Outcome::ServeFile { len: 6 });

        while conn.rearm() == Rearm::Writable {
            conn.write();
        }
        assert_eq!(take_written(&mut conn), expected_ok(b"second", true));

        // The pipelined request survived the re-init
        assert!(conn.has_pending_input());
        assert_eq!(conn.process(), Outcome::ServeFile { len: INDEX.len() });
        while conn.rearm() == Rearm::Writable {
            conn.write();
        }
        assert_eq!(take_written(&mut conn), expected_ok(INDEX, false));
    }

    #[test]
    fn test_short_and_stalled_writes_resume() {
        let (_dir, config) = site();
        let mut conn = connection(&config);
        conn.stream_mut().write_limit = Some(7);
        conn.stream_mut().stall_writes = true;

        conn.stream_mut().feed(b"GET / HTTP/1.1\r\n\r\n");
        assert!(conn.read());
        conn.process();

        let mut calls = 0;
        while conn.rearm() == Rearm::Writable {
            conn.write();
            calls += 1;
        }
        assert!(calls > 1);
        assert_eq!(take_written(&mut conn), expected_ok(INDEX, false));
    }

    #[test]
    fn test_peer_close_tears_down() {
        let (_dir, config) = site();
        let mut conn = connection(&config);
        conn.stream_mut().feed(b"GET / HT");
        conn.stream_mut().eof = true;

        assert!(!conn.read());
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.rearm(), Rearm::Close);
        assert_eq!(conn.process(), Outcome::PeerClosed);
        assert!(!conn.write());
        assert!(conn.stream().written.is_empty());
    }

    #[test]
    fn test_full_buffer_without_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConnectionConfig {
            resolver: Resolver::new(dir.path(), "index.html", 4096),
            content_type: "text/html".to_string(),
            read_buffer_size: 32,
            write_buffer_size: 1024,
        });
        let mut conn = connection(&config);
        conn.stream_mut().feed(&[b'a'; 64]);

        assert!(conn.read());
        assert_eq!(conn.cursors().2, 32);
        assert_eq!(conn.process(), Outcome::Malformed(Malformed::TooLarge));
        assert_eq!(conn.rearm(), Rearm::Writable);
    }

    #[test]
    fn test_connection_registry() {
        let (_dir, config) = site();
        let users = UserCount::default();
        let mut first: ConnectionRegistry<ScriptedStream> = ConnectionRegistry::new(2, users.clone());
        let mut second: ConnectionRegistry<ScriptedStream> = ConnectionRegistry::new(2, users.clone());

        let id1 = first.insert(connection(&config)).unwrap();
        let id2 = second.insert(connection(&config)).unwrap();

        // Limit is shared across registries
        assert!(first.insert(connection(&config)).is_none());
        assert_eq!(users.get(), 2);

        assert!(first.remove(id1).is_some());
        assert!(!first.contains(id1));
        assert!(first.remove(id1).is_none());
        assert_eq!(users.get(), 1);

        assert!(second.get_mut(id2).is_some());
        drop(second);
        assert_eq!(users.get(), 0);
        assert!(first.is_empty());
    }
}
