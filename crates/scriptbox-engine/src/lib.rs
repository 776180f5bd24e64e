//! Embeddable sandbox engine for running untrusted scripts.
//!
//! The engine executes guest scripts inside an isolated wasm interpreter and
//! streams everything they produce back to the host as events.  Guest code
//! has no ambient authority: every effect it attempts (values, stdout, logs,
//! network) surfaces as an [`Event`] or a capability request the host decides
//! how to answer.
//!
//! # Quick start
//!
//! ```no_run
//! use scriptbox_engine::{
//!     Argument, Context, ContextOptions, Event, HandlerTable, Sandbox,
//! };
//!
//! # fn main() -> scriptbox_engine::Result<()> {
//! let ctx = Context::create(ContextOptions::new())?;
//! ctx.initialize("guest-runtime.wasm")?;
//!
//! let mut sandbox = Sandbox::create(&ctx)?;
//! sandbox.set_handler(HandlerTable::new(|event: Event| {
//!     println!("{:?}", event.kind());
//! }));
//! sandbox.start()?;
//!
//! sandbox.load_script("def double(x):\n    return x * 2\n", 1_000)?;
//! sandbox.run("double", &[Argument::json("21")], 1_000)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Lifecycle
//!
//! A [`Context`] owns the runtime image and an embedded async runtime; it is
//! initialized once and shared by any number of [`Sandbox`]es.  Each sandbox
//! runs one invocation at a time (`&mut self` enforces this at compile time);
//! a failed or timed-out invocation leaves the sandbox usable.
//!
//! # Capabilities
//!
//! Host-intercepted HTTP is the first capability: register an
//! [`HttpHandler`] in the [`HandlerTable`] and complete each exchange through
//! the [`ResponseBody`] sink, from any thread.  See the [`http`] module.

pub mod args;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod http;
pub mod image;
pub mod isolation;
pub mod sandbox;
pub mod wasm;

mod invoker;

pub use args::{Argument, ArgumentValue};
pub use config::{ContextOptions, SandboxConfig};
pub use context::Context;
pub use error::{Result, SandboxError};
pub use event::{Event, EventHandler, EventKind};
pub use http::{HttpHandler, HttpHeader, HttpRequest, HttpResponse, ResponseBody};
pub use image::RuntimeImage;
pub use isolation::{GuestInstance, HostChannel, IsolationBackend};
pub use sandbox::{HandlerTable, Sandbox};
pub use wasm::WasmBackend;
