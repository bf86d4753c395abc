//! Line scanner over the read buffer.
//!
//! Resumes at `checked_index` on every call so bytes are examined at most
//! once, except a trailing `\r` which is re-examined when its successor
//! arrives.

use crate::runtime::buffer::ReadBuffer;

/// Scanner result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line; `end` is the index of its `\r`. The scan cursor has
    /// moved past the `\r\n`.
    Complete { end: usize },
    /// Misplaced `\r` or `\n`.
    Bad,
    /// No terminator yet.
    Open,
}

/// Scan `[checked_index, read_index)` for the end of the current line.
pub fn scan(buf: &mut ReadBuffer) -> LineStatus {
    let end = buf.read_index();
    let mut idx = buf.checked_index();

    while idx < end {
        match buf.byte(idx) {
            Some(b'\r') => {
                return match buf.byte(idx + 1) {
                    // Terminator may be split across reads; wait on the \r.
                    None => park(buf, idx, LineStatus::Open),
                    Some(b'\n') => park(buf, idx + 2, LineStatus::Complete { end: idx }),
                    Some(_) => LineStatus::Bad,
                };
            }
            Some(b'\n') => {
                return if idx > buf.start_line() && buf.byte(idx - 1) == Some(b'\r') {
                    park(buf, idx + 1, LineStatus::Complete { end: idx - 1 })
                } else {
                    LineStatus::Bad
                };
            }
            _ => idx += 1,
        }
    }

    park(buf, end, LineStatus::Open)
}

fn park(buf: &mut ReadBuffer, checked: usize, status: LineStatus) -> LineStatus {
    match buf.seek(checked) {
        Ok(()) => status,
        Err(_) => LineStatus::Bad,
    }
}
