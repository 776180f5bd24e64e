//! Runtime image loading.
//!
//! A [`RuntimeImage`] is the compiled guest interpreter as an opaque,
//! immutable byte blob.  Contexts share it by reference; it is never mutated
//! after load.  Structural validation (e.g. wasm decoding) is the isolation
//! backend's job -- this module only guarantees the bytes were readable and
//! non-empty.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Immutable, loadable unit representing the compiled guest interpreter.
#[derive(Clone)]
pub struct RuntimeImage {
    bytes: Vec<u8>,
    origin: Option<PathBuf>,
}

impl RuntimeImage {
    /// Load an image from a file on disk.
    ///
    /// Fails with [`SandboxError::InvalidImage`] if the path cannot be read.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            SandboxError::InvalidImage(format!("{}: {e}", path.display()))
        })?;
        let bytes = std::fs::read(&canonical).map_err(|e| {
            SandboxError::InvalidImage(format!("{}: {e}", canonical.display()))
        })?;
        tracing::debug!(path = %canonical.display(), size_bytes = bytes.len(), "read runtime image");
        Self::checked(bytes, Some(canonical))
    }

    /// Wrap an image already held in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        Self::checked(bytes.into(), None)
    }

    fn checked(bytes: Vec<u8>, origin: Option<PathBuf>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(SandboxError::InvalidImage("image is empty".into()));
        }
        Ok(Self { bytes, origin })
    }

    /// The raw image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`; empty images are rejected at load.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The path the image was loaded from, when loaded from disk.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }
}

impl fmt::Debug for RuntimeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeImage")
            .field("len", &self.bytes.len())
            .field("origin", &self.origin)
            .finish()
    }
}
