//! Read-only memory-mapped files for zero-copy responses.
//!
//! The mapping is owned by `MappedFile` and released in `Drop`, so every
//! path that discards a pending response (completion, error, connection
//! teardown, keep-alive re-init) also unmaps it.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};

/// A file mapped `PROT_READ`/`MAP_PRIVATE` into the address space.
pub struct MappedFile {
    /// Start of the mapping. Dangling when `len == 0`.
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedFile {
    /// Map the whole of the file at `path`.
    ///
    /// Zero-length files are not mapped (mmap rejects them) and yield an
    /// empty handle. The file descriptor is closed before returning; the
    /// mapping stays valid on its own.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

// The mapping is read-only and uniquely owned.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, b"<html>mapped</html>").unwrap();

        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.len(), 19);
        assert_eq!(mapped.as_slice(), b"<html>mapped</html>");
    }

    #[test]
    fn test_map_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.html");
        std::fs::write(&path, b"").unwrap();

        let mapped = MappedFile::open(&path).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(mapped.as_slice(), b"");
    }

    #[test]
    fn test_map_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappedFile::open(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
