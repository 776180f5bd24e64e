//! Engine configuration.
//!
//! [`ContextOptions`] controls how a [`Context`](crate::context::Context) is
//! created; [`SandboxConfig`] carries the per-sandbox resource limits.  Both
//! provide sensible defaults via [`Default`] and a builder-style API.

use std::fmt;
use std::sync::Arc;

use crate::isolation::IsolationBackend;

/// Options for creating a [`Context`](crate::context::Context).
#[derive(Default)]
pub struct ContextOptions {
    /// Worker threads for the embedded runtime that drives guest execution.
    ///
    /// `0` (the default) uses a current-thread runtime; any other value
    /// builds a multi-threaded runtime with that many workers.
    pub worker_threads: usize,

    pub(crate) backend: Option<Arc<dyn IsolationBackend>>,
}

impl ContextOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker-thread count of the embedded runtime.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Substitute the isolation backend.
    ///
    /// By default every context uses the wasm backend
    /// ([`WasmBackend`](crate::wasm::WasmBackend)); tests and alternative
    /// isolation technologies may plug in their own
    /// [`IsolationBackend`].
    pub fn with_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("worker_threads", &self.worker_threads)
            .field("custom_backend", &self.backend.is_some())
            .finish()
    }
}

/// Resource limits for one sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum linear memory a guest instance may allocate, in bytes.
    ///
    /// Default: **64 MiB**.
    pub max_memory: usize,

    /// Maximum total size of one intercepted HTTP response body, in bytes.
    ///
    /// A capability handler pushing more than this fails the exchange.
    ///
    /// Default: **8 MiB**.
    pub max_response_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            max_response_bytes: 8 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum guest memory (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the maximum intercepted HTTP response size (in bytes).
    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }
}
