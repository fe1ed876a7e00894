//! Error types for heron-engine

use std::fmt;

use thiserror::Error;

use crate::context::LevelKind;
use crate::result::{Exception, ReturnCode};

/// The variable operation that failed, used to phrase error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableOp {
    Get,
    Set,
    Unset,
    Exist,
}

impl fmt::Display for VariableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            VariableOp::Get => "read",
            VariableOp::Set => "set",
            VariableOp::Unset => "unset",
            VariableOp::Exist => "test",
        };
        f.write_str(verb)
    }
}

/// Variable access errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VariableError {
    /// No value exists (for thread-scoped variables, none for the calling thread)
    #[error("can't {op} \"{name}\": no such variable{suffix}")]
    Missing {
        op: VariableOp,
        name: String,
        suffix: &'static str,
    },

    /// The array has no such element
    #[error("can't {op} \"{name}({index})\": no such element in array")]
    MissingElement {
        op: VariableOp,
        name: String,
        index: String,
    },

    /// Scalar access to an array
    #[error("can't {op} \"{name}\": variable is array")]
    IsArray { op: VariableOp, name: String },

    /// Element access to a scalar
    #[error("can't {op} \"{name}({index})\": variable isn't array")]
    NotArray {
        op: VariableOp,
        name: String,
        index: String,
    },

    /// Declaring a variable that is already declared in the frame
    #[error("can't add \"{name}\": variable already exists")]
    AlreadyExists { name: String },
}

/// Errors produced by the execution core
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or unusable interpreter
    #[error("invalid interpreter")]
    InvalidInterpreter,

    /// Interpreter was deleted or disposed
    #[error("interpreter is deleted or disposed")]
    InterpreterDisposed,

    /// Wait admission gate refused the wait
    #[error("wait subsystem locked")]
    WaitLocked,

    /// The external signal fired during a wait
    #[error("event was signaled")]
    EventSignaled,

    /// The interpreter lock could not be taken within the ready duration
    #[error("timeout, unable to obtain interpreter lock within {millis} milliseconds")]
    LockTimeout { millis: u64 },

    /// Evaluation was canceled (or unwound)
    #[error("{message}")]
    Canceled { message: String, unwind: bool },

    /// Evaluation was halted
    #[error("{message}")]
    Halted { message: String },

    /// A nesting counter exceeded its configured limit
    #[error("too many nested evaluations ({kind} level limit {limit} exceeded)")]
    StackOverflow { kind: LevelKind, limit: usize },

    /// Host abstraction failure (sleep, yield, message pump)
    #[error("host error: {0}")]
    Host(String),

    /// Event manager failure
    #[error("{0}")]
    Event(String),

    /// Call frame problem (missing frame, frame without variables)
    #[error("{0}")]
    CallFrame(String),

    /// Command resolution failure
    #[error("invalid command name \"{0}\"")]
    CommandNotFound(String),

    /// Wait callback veto or failure
    #[error("{0}")]
    Callback(String),

    /// Invalid match pattern
    #[error("{0}")]
    Pattern(String),

    /// Configuration parse failure
    #[error("configuration error: {0}")]
    Config(String),

    /// Variable access failure
    #[error(transparent)]
    Variable(#[from] VariableError),

    /// Script-level failure surfaced through an engine operation
    #[error(transparent)]
    Script(#[from] Exception),

    /// I/O failure (config files, thread spawn)
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a host error
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create a call frame error
    pub fn call_frame(msg: impl Into<String>) -> Self {
        Self::CallFrame(msg.into())
    }

    /// Whether the failure was a readiness check timing out
    pub fn is_timed_out(&self) -> bool {
        matches!(self, EngineError::LockTimeout { .. })
    }

    /// Whether the failure was an external signal firing
    pub fn is_signaled(&self) -> bool {
        matches!(self, EngineError::EventSignaled)
    }

    /// Whether the failure was a cancellation, unwind or halt
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            EngineError::Canceled { .. } | EngineError::Halted { .. }
        )
    }

    /// Completion code a script sees for this failure
    pub fn return_code(&self) -> ReturnCode {
        match self {
            EngineError::Script(e) => e.code,
            _ => ReturnCode::Error,
        }
    }
}

impl From<EngineError> for Exception {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Script(exception) => exception,
            other => Exception::error(other.to_string()),
        }
    }
}

impl From<VariableError> for Exception {
    fn from(e: VariableError) -> Self {
        Exception::error(e.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_error_messages() {
        let e = VariableError::Missing {
            op: VariableOp::Get,
            name: "x".into(),
            suffix: " for thread",
        };
        assert_eq!(e.to_string(), "can't read \"x\": no such variable for thread");

        let e = VariableError::NotArray {
            op: VariableOp::Set,
            name: "x".into(),
            index: "a".into(),
        };
        assert_eq!(e.to_string(), "can't set \"x(a)\": variable isn't array");

        let e = VariableError::IsArray {
            op: VariableOp::Unset,
            name: "x".into(),
        };
        assert_eq!(e.to_string(), "can't unset \"x\": variable is array");
    }

    #[test]
    fn test_engine_error_classification() {
        assert!(EngineError::LockTimeout { millis: 5 }.is_timed_out());
        assert!(EngineError::EventSignaled.is_signaled());
        assert!(
            EngineError::Canceled {
                message: "eval canceled".into(),
                unwind: false
            }
            .is_canceled()
        );
        assert_eq!(EngineError::WaitLocked.to_string(), "wait subsystem locked");
    }

    #[test]
    fn test_engine_error_into_exception() {
        let exception: Exception = EngineError::WaitLocked.into();
        assert_eq!(exception.code, ReturnCode::Error);
        assert_eq!(exception.value, "wait subsystem locked");

        let exception: Exception = EngineError::Script(Exception::break_()).into();
        assert_eq!(exception.code, ReturnCode::Break);
    }
}
