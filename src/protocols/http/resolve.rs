//! URL to file resolution under the document root.

use super::{Malformed, Outcome};
use crate::runtime::mapped::MappedFile;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Other-read permission bit (`S_IROTH`).
const WORLD_READABLE: u32 = 0o004;

/// Maps request paths to files and memory-maps them.
#[derive(Debug, Clone)]
pub struct Resolver {
    doc_root: PathBuf,
    /// File served for `/`.
    index: String,
    /// Longest accepted full path, in bytes.
    max_path_len: usize,
}

impl Resolver {
    pub fn new(doc_root: impl Into<PathBuf>, index: impl Into<String>, max_path_len: usize) -> Self {
        Self {
            doc_root: doc_root.into(),
            index: index.into(),
            max_path_len,
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// Full filesystem path for `url`.
    ///
    /// Query and fragment are ignored. `..` segments are refused so a
    /// request can never leave the document root.
    pub fn real_path(&self, url: &str) -> Result<PathBuf, Outcome> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let relative = match path.trim_start_matches('/') {
            "" => self.index.as_str(),
            rest => rest,
        };

        if relative.split('/').any(|segment| segment == "..") {
            return Err(Outcome::Forbidden);
        }

        let full = self.doc_root.join(relative);
        if full.as_os_str().len() >= self.max_path_len {
            warn!(len = full.as_os_str().len(), max = self.max_path_len, "path too long");
            return Err(Outcome::InternalError);
        }
        Ok(full)
    }

    /// Resolve `url` to a mapped file.
    ///
    /// On failure the error is the outcome to answer with.
    pub fn resolve(&self, url: &str) -> Result<MappedFile, Outcome> {
        let path = self.real_path(url)?;

        let meta = fs::metadata(&path).map_err(|e| stat_error(&path, e))?;
        if meta.is_dir() {
            return Err(Outcome::Malformed(Malformed::Directory));
        }
        if !meta.is_file() || meta.permissions().mode() & WORLD_READABLE == 0 {
            return Err(Outcome::Forbidden);
        }

        let mapped = MappedFile::open(&path).map_err(|e| stat_error(&path, e))?;
        debug!(path = %path.display(), len = mapped.len(), "mapped file");
        Ok(mapped)
    }
}

fn stat_error(path: &Path, e: io::Error) -> Outcome {
    match e.kind() {
        io::ErrorKind::NotFound => Outcome::NotFound,
        io::ErrorKind::PermissionDenied => Outcome::Forbidden,
        _ => {
            warn!(path = %path.display(), error = %e, "cannot open file");
            Outcome::InternalError
        }
    }
}
