//! Engine error types.
//!
//! All engine subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.  Guest-level
//! faults are caught at the isolation boundary and converted to
//! [`SandboxError::GuestFault`]; they never escape as panics.

/// Unified error type for the sandbox engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Resources for a context could not be reserved (e.g. the embedded
    /// runtime failed to build).
    #[error("allocation failure: {0}")]
    Allocation(String),

    /// The runtime image path was unreadable or the image bytes are malformed.
    #[error("invalid runtime image: {0}")]
    InvalidImage(String),

    /// `initialize` was called on a context that already holds an image.
    #[error("context is already initialized")]
    AlreadyInitialized,

    /// A sandbox was requested from a context with no loaded runtime image.
    #[error("context has no runtime image loaded")]
    ContextNotInitialized,

    /// An operation was attempted on a sandbox whose context was destroyed.
    #[error("context was destroyed while the sandbox was still in use")]
    UseAfterFree,

    /// The isolation boundary could not be instantiated.
    #[error("sandbox start failure: {0}")]
    StartFailure(String),

    /// An operation was issued in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The guest rejected the script source.
    #[error("compile error: {diagnostic}")]
    Compile {
        /// Guest-reported diagnostic for the failing source.
        diagnostic: String,
    },

    /// Script compilation exceeded its deadline.
    #[error("compilation exceeded {limit_ms}ms")]
    CompileTimeout {
        /// The deadline that was exceeded, in milliseconds.
        limit_ms: u64,
    },

    /// The requested entry point is absent from the loaded script.
    #[error("entry point '{entry}' not found")]
    EntryNotFound {
        /// The entry point name that failed to resolve.
        entry: String,
    },

    /// Argument marshaling failed or the guest reported an arity/type
    /// mismatch.
    #[error("argument error: {0}")]
    Argument(String),

    /// An invocation exceeded its deadline, including time spent suspended on
    /// a capability exchange.
    #[error("execution exceeded {limit_ms}ms")]
    ExecutionTimeout {
        /// The deadline that was exceeded, in milliseconds.
        limit_ms: u64,
    },

    /// The guest raised an unrecoverable fault (e.g. an unhandled exception).
    #[error("guest fault: {message}")]
    GuestFault {
        /// Guest-reported diagnostic message.
        message: String,
    },

    /// Guest code used a capability the host did not register a handler for.
    #[error("capability '{capability}' has no registered handler")]
    CapabilityUnavailable {
        /// The capability the guest attempted to use.
        capability: &'static str,
    },

    /// A capability handler broke the response protocol.  The exchange fails;
    /// the sandbox itself remains usable.
    #[error("capability protocol violation: {0}")]
    ProtocolViolation(String),

    /// An I/O error occurred (e.g. reading a runtime image from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
