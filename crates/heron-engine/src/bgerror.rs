//! Background error dispatch.
//!
//! Errors raised by event handlers and other asynchronous work have no
//! caller to return to. They are handed to a script-level handler command
//! (by default `bgerror`) invoked with the error message. When the handler
//! is missing or itself fails, a structured report goes to the host's
//! diagnostic channel:
//!
//! ```text
//! handler {bgerror} failed for background error.
//!     Original error: Error, line 2: boom
//!     Handler error: Error: oops
//! ```
//!
//! Dispatch runs under the interpreter's master lock and never lets a
//! failure (or panic) from resolution or execution escape.

use std::panic::{AssertUnwindSafe, catch_unwind};

use scopeguard::defer;

use crate::binding::panic_message;
use crate::context::{ContextRef, ExternalExecutionGuard};
use crate::flags::{CallFrameFlags, CancelFlags, InterpreterFlags};
use crate::host::{Host, StdHost};
use crate::interpreter::{Execute, Interpreter};
use crate::result::{Exception, ReturnCode, ScriptResult, format_result};
use crate::text::make_list;

const DETAIL_INDENT: &str = "    ";

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundErrorState {
    /// The interpreter was missing, deleted or disposed (reported)
    Invalid,
    /// No handler could be resolved (reported)
    Missing,
    /// The handler failed (reported)
    Failed,
    /// A missing or failing handler was ignored by policy
    Ignored,
    /// The handler returned break; further reports are suppressed for this pass
    Suppressed,
    /// The handler completed normally
    Handled,
}

impl BackgroundErrorState {
    /// Whether a diagnostic report was written.
    pub fn was_reported(self) -> bool {
        matches!(
            self,
            BackgroundErrorState::Invalid
                | BackgroundErrorState::Missing
                | BackgroundErrorState::Failed
        )
    }
}

struct Detail<'a> {
    label: &'a str,
    code: ReturnCode,
    value: &'a str,
    error_line: u32,
}

fn wrap_handler_name(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{{{}}}", name),
        None => "<null>".to_string(),
    }
}

fn format_report(headline: &str, details: &[Detail<'_>]) -> String {
    let mut report = headline.to_string();
    for detail in details {
        report.push('\n');
        report.push_str(DETAIL_INDENT);
        report.push_str(detail.label);
        report.push_str(": ");
        report.push_str(&format_result(detail.code, detail.value, detail.error_line));
    }
    report
}

fn report(interpreter: Option<&Interpreter>, headline: &str, details: &[Detail<'_>]) {
    let report = format_report(headline, details);
    tracing::warn!(
        interpreter = interpreter.map(Interpreter::id),
        "unhandled background error"
    );
    match interpreter {
        Some(interpreter) => {
            if !interpreter.is_disposed() {
                interpreter.context().lock().set_complaint(Some(report.clone()));
            }
            interpreter.host().write_diagnostic(&report);
        }
        None => StdHost.write_diagnostic(&report),
    }
}

fn execute_handler(
    interpreter: &Interpreter,
    context: &ContextRef,
    handler: &str,
    command: &dyn Execute,
    arguments: &[String],
) -> (ScriptResult, u32) {
    let frame = interpreter.new_tracking_call_frame(
        &make_list(["bgerror", handler]),
        CallFrameFlags::BACKGROUND_ERROR,
    );
    interpreter.push_call_frame(frame);
    defer! {
        interpreter.pop_scope_call_frames_and_one_more();
    }

    let _external = ExternalExecutionGuard::enter(context);
    if interpreter.has_flags(InterpreterFlags::BG_ERROR_RESET_CANCEL) {
        interpreter.reset_cancel(CancelFlags::BACKGROUND_ERROR | CancelFlags::GLOBAL);
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        interpreter.execute(handler, command, None, arguments)
    }))
    .unwrap_or_else(|payload| {
        Err(Exception::error(format!(
            "background error handler panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    let error_line = match &result {
        Ok(_) => 0,
        Err(e) if e.error_line > 0 => e.error_line,
        Err(_) => context.lock().error_line(),
    };
    (result, error_line)
}

/// Hand an unhandled error to the interpreter's background error handler.
pub fn dispatch_background_error(
    interpreter: Option<&Interpreter>,
    code: ReturnCode,
    result: &str,
) -> BackgroundErrorState {
    let Some(interpreter) = interpreter else {
        report(
            None,
            "cannot handle background error, interpreter is invalid.",
            &[Detail {
                label: "Original error",
                code,
                value: result,
                error_line: 0,
            }],
        );
        return BackgroundErrorState::Invalid;
    };

    let _guard = interpreter.lock();
    if interpreter.is_deleted_or_disposed() {
        report(
            Some(interpreter),
            "cannot handle background error, interpreter is deleted or disposed.",
            &[Detail {
                label: "Original error",
                code,
                value: result,
                error_line: 0,
            }],
        );
        return BackgroundErrorState::Invalid;
    }

    let context = interpreter.context();
    let error_line = context.lock().error_line();
    let ignore_failure = interpreter.has_flags(InterpreterFlags::IGNORE_BG_ERROR_FAILURE);
    let original = Detail {
        label: "Original error",
        code,
        value: result,
        error_line,
    };

    let handler = interpreter
        .background_error_handler()
        .filter(|name| !name.is_empty());

    let resolved = match &handler {
        Some(name) => interpreter.resolve_command(name).map_err(|e| e.to_string()),
        None => Err("no background error handler is set".to_string()),
    };

    let (handler, command) = match (handler, resolved) {
        (Some(handler), Ok(command)) => (handler, command),
        (handler, Err(resolve_error)) => {
            if ignore_failure {
                return BackgroundErrorState::Ignored;
            }
            report(
                Some(interpreter),
                &format!(
                    "handler {} missing for background error.",
                    wrap_handler_name(handler.as_deref())
                ),
                &[
                    original,
                    Detail {
                        label: "Resolver error",
                        code: ReturnCode::Error,
                        value: &resolve_error,
                        error_line: 0,
                    },
                ],
            );
            return BackgroundErrorState::Missing;
        }
        (None, Ok(_)) => return BackgroundErrorState::Ignored,
    };

    let arguments = vec![handler.clone(), result.to_string()];
    let (outcome, handler_line) =
        execute_handler(interpreter, &context, &handler, command.as_ref(), &arguments);

    match outcome {
        Ok(_) => BackgroundErrorState::Handled,
        Err(e) if e.code == ReturnCode::Break => {
            tracing::debug!(interpreter = interpreter.id(), "background error reporting suppressed");
            BackgroundErrorState::Suppressed
        }
        Err(_) if ignore_failure => BackgroundErrorState::Ignored,
        Err(e) => {
            report(
                Some(interpreter),
                &format!(
                    "handler {} failed for background error.",
                    wrap_handler_name(Some(&handler))
                ),
                &[
                    original,
                    Detail {
                        label: "Handler error",
                        code: e.code,
                        value: &e.value,
                        error_line: handler_line,
                    },
                ],
            );
            BackgroundErrorState::Failed
        }
    }
}

/// Completion-code form of [`dispatch_background_error`]: `Error` only when
/// the interpreter itself was unusable.
pub fn handle_background_error(interpreter: Option<&Interpreter>, code: ReturnCode, result: &str) -> ReturnCode {
    match dispatch_background_error(interpreter, code, result) {
        BackgroundErrorState::Invalid => ReturnCode::Error,
        _ => ReturnCode::Ok,
    }
}
