//! Engine contexts.
//!
//! A [`Context`] is the top-level handle of the engine.  It owns an embedded
//! tokio runtime that drives guest execution, the isolation backend, and the
//! runtime image shared by every sandbox created from it.  The public API is
//! blocking; internally each operation is a future run to completion on the
//! embedded runtime, so deadlines and capability handoffs compose with
//! ordinary async machinery.
//!
//! Sandboxes keep the context's internals alive through an [`Arc`], but a
//! destroyed context refuses further work: any operation through a surviving
//! sandbox fails with [`SandboxError::UseAfterFree`] instead of touching
//! freed state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Runtime};

use crate::config::ContextOptions;
use crate::error::{Result, SandboxError};
use crate::image::RuntimeImage;
use crate::isolation::IsolationBackend;

/// Top-level engine handle.
///
/// Create one per embedding (or per tenant), initialize it with a runtime
/// image once, then create any number of sandboxes from it.
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    runtime: Runtime,
    backend: Arc<dyn IsolationBackend>,
    image: Mutex<Option<Arc<RuntimeImage>>>,
    closed: AtomicBool,
}

impl Context {
    /// Create a context with the given options.
    ///
    /// Fails with [`SandboxError::Allocation`] when the embedded runtime
    /// cannot be built, and with [`SandboxError::StartFailure`] when the
    /// default isolation backend cannot initialize its engine.
    pub fn create(options: ContextOptions) -> Result<Self> {
        let runtime = if options.worker_threads == 0 {
            Builder::new_current_thread().enable_all().build()
        } else {
            Builder::new_multi_thread()
                .worker_threads(options.worker_threads)
                .thread_name("scriptbox-worker")
                .enable_all()
                .build()
        }
        .map_err(|e| SandboxError::Allocation(format!("embedded runtime: {e}")))?;

        let backend: Arc<dyn IsolationBackend> = match options.backend {
            Some(backend) => backend,
            None => Arc::new(crate::wasm::WasmBackend::new()?),
        };

        tracing::debug!(worker_threads = options.worker_threads, "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                runtime,
                backend,
                image: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Load the runtime image from a file on disk.
    ///
    /// May be called at most once per context; a second call fails with
    /// [`SandboxError::AlreadyInitialized`].
    pub fn initialize(&self, image_path: impl AsRef<Path>) -> Result<()> {
        self.install_image(RuntimeImage::from_path(image_path)?)
    }

    /// Load the runtime image from bytes already held in memory.
    pub fn initialize_bytes(&self, image_bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.install_image(RuntimeImage::from_bytes(image_bytes)?)
    }

    fn install_image(&self, image: RuntimeImage) -> Result<()> {
        self.inner.ensure_open()?;
        let mut slot = self.inner.image.lock().expect("image lock");
        if slot.is_some() {
            return Err(SandboxError::AlreadyInitialized);
        }
        let image = Arc::new(image);
        self.inner
            .runtime
            .block_on(self.inner.backend.load_image(&image))?;
        tracing::info!(size_bytes = image.len(), "runtime image initialized");
        *slot = Some(image);
        Ok(())
    }

    /// Tear the context down.
    ///
    /// Equivalent to dropping it; sandboxes still alive turn into
    /// use-after-free errors on their next operation.
    pub fn destroy(self) {}

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

impl ContextInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::UseAfterFree);
        }
        Ok(())
    }

    pub(crate) fn image(&self) -> Result<Arc<RuntimeImage>> {
        self.image
            .lock()
            .expect("image lock")
            .clone()
            .ok_or(SandboxError::ContextNotInitialized)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
