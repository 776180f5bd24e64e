//! Sandbox lifecycle.
//!
//! A [`Sandbox`] is one isolated guest execution environment created from an
//! initialized [`Context`].  Its lifecycle is strict:
//!
//! 1. [`Sandbox::create`] (context must hold a runtime image),
//! 2. [`Sandbox::set_handler`],
//! 3. [`Sandbox::start`] (instantiates the guest),
//! 4. any interleaving of [`Sandbox::load_script`] and [`Sandbox::run`],
//! 5. [`Sandbox::destroy`] (or drop).
//!
//! Operations take `&mut self`, so one sandbox never runs two invocations
//! concurrently; create several sandboxes for parallelism.  A timed-out or
//! failed invocation leaves the sandbox usable for the next call.

use std::sync::Arc;
use std::time::Duration;

use crate::args::Argument;
use crate::config::SandboxConfig;
use crate::context::{Context, ContextInner};
use crate::error::{Result, SandboxError};
use crate::event::EventHandler;
use crate::http::HttpHandler;
use crate::invoker;
use crate::isolation::GuestInstance;

/// The host callbacks a sandbox dispatches into.
///
/// An event handler is mandatory; capability handlers are optional, and a
/// guest using an unregistered capability fails that invocation with
/// [`SandboxError::CapabilityUnavailable`].
pub struct HandlerTable {
    events: Box<dyn EventHandler>,
    http: Option<Arc<dyn HttpHandler>>,
}

impl HandlerTable {
    /// Build a handler table around the mandatory event handler.
    pub fn new(events: impl EventHandler) -> Self {
        Self {
            events: Box::new(events),
            http: None,
        }
    }

    /// Register the HTTP capability handler.
    pub fn with_http(mut self, handler: impl HttpHandler) -> Self {
        self.http = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("http", &self.http.is_some())
            .finish()
    }
}

/// One isolated guest execution environment.
pub struct Sandbox {
    ctx: Arc<ContextInner>,
    config: SandboxConfig,
    handler: Option<HandlerTable>,
    instance: Option<Box<dyn GuestInstance>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("handler", &self.handler.is_some())
            .field("started", &self.instance.is_some())
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox with the default [`SandboxConfig`].
    pub fn create(context: &Context) -> Result<Self> {
        Self::create_with(context, SandboxConfig::default())
    }

    /// Create a sandbox with an explicit configuration.
    ///
    /// The context must be open and initialized with a runtime image.
    pub fn create_with(context: &Context, config: SandboxConfig) -> Result<Self> {
        let ctx = Arc::clone(context.inner());
        ctx.ensure_open()?;
        ctx.image()?;
        Ok(Self {
            ctx,
            config,
            handler: None,
            instance: None,
        })
    }

    /// Install (or replace) the handler table.
    ///
    /// Replacement takes effect for the next invocation; `&mut self` ensures
    /// no invocation is in flight.
    pub fn set_handler(&mut self, handlers: HandlerTable) {
        self.handler = Some(handlers);
    }

    /// Instantiate the guest.  Requires a handler table and may run once.
    pub fn start(&mut self) -> Result<()> {
        self.ctx.ensure_open()?;
        if self.handler.is_none() {
            return Err(SandboxError::InvalidState("handler not set"));
        }
        if self.instance.is_some() {
            return Err(SandboxError::InvalidState("sandbox already started"));
        }
        let image = self.ctx.image()?;
        let instance = self
            .ctx
            .block_on(self.ctx.backend().instantiate(&image, &self.config))?;
        self.instance = Some(instance);
        tracing::debug!("sandbox started");
        Ok(())
    }

    /// Compile `source` inside the guest, replacing any previously loaded
    /// script.
    ///
    /// Fails with [`SandboxError::Compile`] on rejection and with
    /// [`SandboxError::CompileTimeout`] when `deadline_ms` elapses first.
    pub fn load_script(&mut self, source: &str, deadline_ms: u64) -> Result<()> {
        self.ctx.ensure_open()?;
        let instance = self
            .instance
            .as_mut()
            .ok_or(SandboxError::InvalidState("sandbox not started"))?;
        self.ctx.block_on(async {
            match tokio::time::timeout(Duration::from_millis(deadline_ms), instance.compile(source))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SandboxError::CompileTimeout {
                    limit_ms: deadline_ms,
                }),
            }
        })?;
        tracing::debug!(source_bytes = source.len(), "script compiled");
        Ok(())
    }

    /// Invoke an entry point of the loaded script.
    ///
    /// Events flow into the handler table as the guest produces them.  The
    /// deadline covers the whole invocation, including time the guest spends
    /// suspended on a capability exchange; on expiry the call fails with
    /// [`SandboxError::ExecutionTimeout`] and events delivered so far stand.
    pub fn run(&mut self, entry: &str, args: &[Argument], deadline_ms: u64) -> Result<()> {
        self.ctx.ensure_open()?;
        let handler = self
            .handler
            .as_mut()
            .ok_or(SandboxError::InvalidState("handler not set"))?;
        let instance = self
            .instance
            .as_mut()
            .ok_or(SandboxError::InvalidState("sandbox not started"))?;

        let http = handler.http.clone();
        let max_response_bytes = self.config.max_response_bytes;
        self.ctx.block_on(async {
            let call = invoker::drive(
                instance.as_mut(),
                entry,
                args,
                handler.events.as_mut(),
                http.as_deref(),
                max_response_bytes,
            );
            match tokio::time::timeout(Duration::from_millis(deadline_ms), call).await {
                Ok(result) => result,
                Err(_) => Err(SandboxError::ExecutionTimeout {
                    limit_ms: deadline_ms,
                }),
            }
        })
    }

    /// Tear the sandbox down.  Equivalent to dropping it.
    pub fn destroy(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use crate::event::Event;
    use crate::isolation::testing::StubBackend;
    use std::sync::Mutex;

    fn stub_context() -> Context {
        let ctx = Context::create(ContextOptions::new().with_backend(Arc::new(StubBackend)))
            .expect("context creation must succeed");
        ctx.initialize_bytes(b"image".to_vec()).unwrap();
        ctx
    }

    fn recording_handlers() -> (Arc<Mutex<Vec<Event>>>, HandlerTable) {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let table = HandlerTable::new(move |event: Event| sink.lock().unwrap().push(event));
        (seen, table)
    }

    #[test]
    fn create_requires_initialized_context() {
        let ctx = Context::create(ContextOptions::new().with_backend(Arc::new(StubBackend)))
            .unwrap();
        let err = Sandbox::create(&ctx).unwrap_err();
        assert!(matches!(err, SandboxError::ContextNotInitialized));
    }

    #[test]
    fn start_requires_handler() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let err = sandbox.start().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState("handler not set")));
    }

    #[test]
    fn start_twice_is_invalid() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (_seen, table) = recording_handlers();
        sandbox.set_handler(table);
        sandbox.start().unwrap();
        let err = sandbox.start().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
    }

    #[test]
    fn run_before_start_is_invalid() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (_seen, table) = recording_handlers();
        sandbox.set_handler(table);
        let err = sandbox.run("ping", &[], 1000).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::InvalidState("sandbox not started")
        ));
    }

    #[test]
    fn run_delivers_events() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (seen, table) = recording_handlers();
        sandbox.set_handler(table);
        sandbox.start().unwrap();
        sandbox.load_script("pass", 1000).unwrap();
        sandbox.run("ping", &[], 1000).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Event::EndJson(Some(b"\"pong\"".to_vec()))]);
    }

    #[test]
    fn unknown_entry_is_entry_not_found() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (_seen, table) = recording_handlers();
        sandbox.set_handler(table);
        sandbox.start().unwrap();
        let err = sandbox.run("missing", &[], 1000).unwrap_err();
        assert!(matches!(err, SandboxError::EntryNotFound { .. }));
    }

    #[test]
    fn compile_rejection_surfaces_diagnostic() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (_seen, table) = recording_handlers();
        sandbox.set_handler(table);
        sandbox.start().unwrap();
        let err = sandbox.load_script("boom", 1000).unwrap_err();
        assert!(matches!(err, SandboxError::Compile { .. }));
    }

    #[test]
    fn sandbox_outliving_context_is_use_after_free() {
        let ctx = stub_context();
        let mut sandbox = Sandbox::create(&ctx).unwrap();
        let (_seen, table) = recording_handlers();
        sandbox.set_handler(table);
        ctx.destroy();
        let err = sandbox.start().unwrap_err();
        assert!(matches!(err, SandboxError::UseAfterFree));
    }
}
