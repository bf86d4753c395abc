//! Fixed-capacity connection buffers.
//!
//! Each connection owns one `ReadBuffer` and one `WriteBuffer`, allocated
//! once and reused across keep-alive requests. All cursor movement goes
//! through bounds-checked methods; nothing outside this module indexes the
//! raw storage.
//!
//! ## Read cursors
//!
//! ```text
//! 0        start_line    checked_index    read_index        capacity
//! |  parsed  |  current line  |  unscanned    |     spare        |
//! ```

use std::fmt;

/// Error returned when a cursor or append would leave the buffer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// A cursor move or range fell outside the valid region.
    OutOfBounds { index: usize, limit: usize },
    /// An append needed more space than remains.
    Overflow { needed: usize, available: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::OutOfBounds { index, limit } => {
                write!(f, "index {} out of bounds (limit {})", index, limit)
            }
            BufferError::Overflow { needed, available } => {
                write!(f, "buffer overflow: need {} bytes, {} available", needed, available)
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// Inbound request bytes with the parser's scan cursors.
pub struct ReadBuffer {
    data: Box<[u8]>,
    /// One past the last byte received from the socket.
    read_index: usize,
    /// Next byte the line scanner will examine.
    checked_index: usize,
    /// First byte of the line currently being scanned.
    start_line: usize,
}

impl ReadBuffer {
    /// Create an empty buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_index: 0,
            checked_index: 0,
            start_line: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn checked_index(&self) -> usize {
        self.checked_index
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    /// True when no spare room is left for another socket read.
    pub fn is_full(&self) -> bool {
        self.read_index == self.data.len()
    }

    /// Bytes received but not yet consumed by the parser.
    pub fn unchecked(&self) -> usize {
        self.read_index - self.checked_index
    }

    /// Spare region `[read_index, capacity)` for the next socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_index..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        let index = self.read_index + n;
        if index > self.data.len() {
            return Err(BufferError::OutOfBounds {
                index,
                limit: self.data.len(),
            });
        }
        self.read_index = index;
        Ok(())
    }

    /// Byte at `index`, or `None` if it has not been received yet.
    pub fn byte(&self, index: usize) -> Option<u8> {
        if index < self.read_index {
            Some(self.data[index])
        } else {
            None
        }
    }

    /// Move the scan cursor forward to `index`.
    ///
    /// The cursor never moves backwards and never passes `read_index`.
    pub fn seek(&mut self, index: usize) -> Result<(), BufferError> {
        if index < self.checked_index || index > self.read_index {
            return Err(BufferError::OutOfBounds {
                index,
                limit: self.read_index,
            });
        }
        self.checked_index = index;
        Ok(())
    }

    /// Take the line `[start_line, end)` and start the next line at the
    /// scan cursor.
    ///
    /// `end` must not lie past the scan cursor, so a line is only handed
    /// out once its terminator has been scanned.
    pub fn take_line(&mut self, end: usize) -> Result<&[u8], BufferError> {
        if end < self.start_line || end > self.checked_index {
            return Err(BufferError::OutOfBounds {
                index: end,
                limit: self.checked_index,
            });
        }
        let start = self.start_line;
        self.start_line = self.checked_index;
        Ok(&self.data[start..end])
    }

    /// Consume `n` unscanned bytes as an opaque block (a request body).
    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.seek(self.checked_index + n)?;
        self.start_line = self.checked_index;
        Ok(())
    }

    /// Drop everything already parsed, moving unconsumed bytes to the front.
    ///
    /// Used when a keep-alive connection starts its next request: bytes of a
    /// pipelined request that arrived with the previous one are preserved.
    pub fn compact(&mut self) {
        let pending = self.checked_index..self.read_index;
        let len = pending.len();
        self.data.copy_within(pending, 0);
        self.read_index = len;
        self.checked_index = 0;
        self.start_line = 0;
    }

    /// Forget all buffered bytes.
    pub fn clear(&mut self) {
        self.read_index = 0;
        self.checked_index = 0;
        self.start_line = 0;
    }
}

/// Outbound response head (and canned bodies).
pub struct WriteBuffer {
    data: Box<[u8]>,
    /// Bytes pending send.
    write_index: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            write_index: 0,
        }
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// Bytes appended so far.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.write_index]
    }

    /// Append raw bytes, or fail without writing anything.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if bytes.len() > self.remaining() {
            return Err(BufferError::Overflow {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        let end = self.write_index + bytes.len();
        self.data[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
        Ok(())
    }

    /// Append formatted text, or fail leaving `write_index` unchanged.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), BufferError> {
        let mark = self.write_index;
        let mut cursor = Cursor {
            buf: self,
            overflow: None,
        };
        if fmt::Write::write_fmt(&mut cursor, args).is_err() {
            let err = cursor.overflow.unwrap_or(BufferError::Overflow {
                needed: 0,
                available: 0,
            });
            self.write_index = mark;
            return Err(err);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.write_index = 0;
    }
}

/// `fmt::Write` adapter recording the first overflow.
struct Cursor<'a> {
    buf: &'a mut WriteBuffer,
    overflow: Option<BufferError>,
}

impl fmt::Write for Cursor<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.append(s.as_bytes()).map_err(|e| {
            self.overflow = Some(e);
            fmt::Error
        })
    }
}
