//! Script completion codes and non-Ok completions.
//!
//! A script (or command) completes either with a value (`Ok`) or with an
//! [`Exception`] carrying one of the other completion codes. `Break` and
//! `Continue` are ordinary control flow, not failures; only `Error` carries
//! an error line.

use std::fmt;

/// Completion code of a script, command or engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    #[default]
    Ok,
    Error,
    Return,
    Break,
    Continue,
}

impl ReturnCode {
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnCode::Ok => "Ok",
            ReturnCode::Error => "Error",
            ReturnCode::Return => "Return",
            ReturnCode::Break => "Break",
            ReturnCode::Continue => "Continue",
        };
        f.write_str(name)
    }
}

/// A non-Ok completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// Completion code (never `Ok`)
    pub code: ReturnCode,
    /// Result value or error message
    pub value: String,
    /// Script line the error was raised on (0 when unknown)
    pub error_line: u32,
}

impl Exception {
    /// Create an `Error` completion
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ReturnCode::Error,
            value: message.into(),
            error_line: 0,
        }
    }

    /// Create a `Break` completion
    pub fn break_() -> Self {
        Self {
            code: ReturnCode::Break,
            value: String::new(),
            error_line: 0,
        }
    }

    /// Create a `Continue` completion
    pub fn continue_() -> Self {
        Self {
            code: ReturnCode::Continue,
            value: String::new(),
            error_line: 0,
        }
    }

    /// Create a `Return` completion carrying `value`
    pub fn return_(value: impl Into<String>) -> Self {
        Self {
            code: ReturnCode::Return,
            value: value.into(),
            error_line: 0,
        }
    }

    /// Attach the script line the completion originated from
    pub fn with_line(mut self, line: u32) -> Self {
        self.error_line = line;
        self
    }

    pub fn is_error(&self) -> bool {
        self.code == ReturnCode::Error
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl std::error::Error for Exception {}

/// Result of evaluating a script or invoking a command
pub type ScriptResult = Result<String, Exception>;

/// Split a script result into its completion code, value and error line.
pub fn split_result(result: &ScriptResult) -> (ReturnCode, &str, u32) {
    match result {
        Ok(value) => (ReturnCode::Ok, value.as_str(), 0),
        Err(e) => (e.code, e.value.as_str(), e.error_line),
    }
}

/// Format a completion for diagnostics, e.g. `Error, line 3: boom`.
///
/// Successful completions format as their value alone; a blank value or a
/// zero error line is omitted.
pub fn format_result(code: ReturnCode, value: &str, error_line: u32) -> String {
    let have_value = !value.trim().is_empty();
    if code.is_ok() {
        return if have_value { value.to_string() } else { String::new() };
    }
    match (have_value, error_line > 0) {
        (true, true) => format!("{}, line {}: {}", code, error_line, value),
        (true, false) => format!("{}: {}", code, value),
        (false, true) => format!("{}, line {}", code, error_line),
        (false, false) => code.to_string(),
    }
}
