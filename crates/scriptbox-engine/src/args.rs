//! Invocation arguments.
//!
//! Each argument carries a type tag (currently JSON-encoded bytes) and binds
//! either positionally, in the order supplied, or by parameter name.

use crate::error::{Result, SandboxError};

/// The typed payload of an [`Argument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    /// JSON-encoded bytes, passed through to the guest unmodified.
    Json(Vec<u8>),
}

/// One argument of an invocation.
///
/// An absent `name` means the argument binds by declaration order; a present
/// one binds by parameter name.  Mixing both in one call is allowed, subject
/// to the guest's own binding rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// Parameter name for named binding, or `None` for positional.
    pub name: Option<String>,
    /// The argument payload.
    pub value: ArgumentValue,
}

impl Argument {
    /// Positional JSON argument from raw encoded bytes.
    pub fn json(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: None,
            value: ArgumentValue::Json(payload.into()),
        }
    }

    /// Named JSON argument from raw encoded bytes.
    pub fn named_json(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            value: ArgumentValue::Json(payload.into()),
        }
    }

    /// Positional argument from a [`serde_json::Value`].
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self::json(value.to_string())
    }

    /// The JSON payload as a string slice.
    ///
    /// Fails with [`SandboxError::Argument`] if the payload is not valid
    /// UTF-8, mirroring the engine's marshaling check.
    pub fn json_str(&self) -> Result<&str> {
        let ArgumentValue::Json(bytes) = &self.value;
        std::str::from_utf8(bytes)
            .map_err(|_| SandboxError::Argument("invalid UTF-8 in JSON argument".into()))
    }
}
