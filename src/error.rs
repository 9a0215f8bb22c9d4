//! Error types for the wispvm crate.
//!
//! Every panic kind the runtime can raise is represented as a variant here so that
//! the interpreter can classify, format, and propagate errors uniformly between the
//! compiler, the virtual machine, and host callables.

use thiserror::Error;

use crate::value::Value;

/// A runtime or compile-time error ("panic" in the language's own terms).
#[derive(Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum VmError {
    #[error("stack underflow: requested {requested}, available {available}")]
    StackUnderflow { requested: usize, available: usize },

    #[error("stack overflow: maximum depth {max} exceeded")]
    StackOverflow { max: usize },

    #[error("offset {offset} is out of range for stack of length {len}")]
    InvalidOffset { offset: i64, len: usize },

    #[error("{name}: expected between {min} and {max_desc} arguments, got {got}")]
    ArityMismatch {
        name: String,
        min: usize,
        max_desc: String,
        got: usize,
    },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("could not coerce value to {target}")]
    CoerceFailure { target: String },

    #[error("undefined global: {name}")]
    UndefinedGlobal { name: String },

    #[error("no command handler registered for '{name}'")]
    NoCommandHandler { name: String },

    #[error("unknown command: '{name}'")]
    UnknownCommand { name: String },

    #[error("attempt to mutate a const object")]
    MutateConst,

    #[error("attempt to index a non-object value")]
    IndexOnNonObject,

    #[error("out of bounds: {what} index {index} (len {len})")]
    OutOfBounds {
        what: &'static str,
        index: i64,
        len: usize,
    },

    #[error("allocation failed")]
    Allocation,

    #[error("coroutine misuse: {reason}")]
    CoroutineMisuse { reason: String },

    #[error("syntax error at line {line}: {message}\n{snippet}")]
    Syntax {
        line: usize,
        message: String,
        snippet: String,
    },

    #[error("{message}")]
    UserPanic { message: String, payload: Option<Value> },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl VmError {
    pub fn user<S: Into<String>>(message: S) -> Self {
        VmError::UserPanic {
            message: message.into(),
            payload: None,
        }
    }

    pub fn user_with_payload<S: Into<String>>(message: S, payload: Value) -> Self {
        VmError::UserPanic {
            message: message.into(),
            payload: Some(payload),
        }
    }

    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        VmError::InvalidOperation(message.into())
    }

    /// Returns the payload object a `try` block should see as the second
    /// return value (an object carrying a `message` field, mirroring how the
    /// scripting language surfaces panics to user code).
    pub fn as_payload(&self) -> Option<Value> {
        if let VmError::UserPanic { payload, .. } = self {
            return payload.clone();
        }
        None
    }
}

pub type VmResult<T> = Result<T, VmError>;
