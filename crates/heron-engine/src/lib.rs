//! Heron execution core.
//!
//! This crate provides the per-thread execution state and the cooperative
//! cancellation machinery of the Heron command-language engine.
//!
//! # Features
//!
//! - **Execution contexts**: nesting counters with scope guards, cancel,
//!   unwind and halt state, error state, one context per thread per interpreter
//! - **Thread bindings**: run a start routine on behalf of an interpreter with
//!   a unique registry association and symmetric teardown
//! - **Cooperative waits**: bounded polling waits that observe cancellation
//!   and an optional external signal within one sleep slice
//! - **Background errors**: route unhandled asynchronous errors to a script
//!   handler, with structured reports when it is missing or fails
//! - **Thread variables**: script variables whose value is partitioned by thread
//!
//! # Example
//!
//! ```no_run
//! use heron_engine::{CancelFlags, Interpreter, WaitRequest, wait};
//! use std::sync::Arc;
//!
//! let interp = Interpreter::new();
//! let canceller = Arc::clone(&interp);
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//!     canceller.cancel_evaluate(None, CancelFlags::empty());
//! });
//!
//! // Returns early with "eval canceled".
//! let outcome = wait(&interp, &WaitRequest::new(1_000_000));
//! assert!(outcome.is_err());
//! ```

pub mod bgerror;
pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod flags;
pub mod frame;
pub mod host;
pub mod interpreter;
pub mod result;
pub mod text;
pub mod thread_id;
pub mod thread_variable;
pub mod variable;
pub mod wait;

pub use bgerror::{BackgroundErrorState, dispatch_background_error, handle_background_error};
pub use binding::{
    BindingStats, StartRoutine, ThreadAbort, ThreadArg, ThreadBinding, ThreadBindingRegistry,
    ThreadInterrupt, abort_thread, active_interpreter, interrupt_thread,
};
pub use config::{BackgroundErrorConfig, EngineConfig, ExecutionConfig, LevelLimits, WaitConfig};
pub use context::{
    ContextRef, ExecutionContext, ExternalExecutionGuard, LevelGuard, LevelKind,
    NestedExecutionGuard,
};
pub use error::{EngineError, EngineResult, VariableError};
pub use event::{EventManager, EventQueue, Signal};
pub use flags::{CallFrameFlags, CancelFlags, EngineFlags, InterpreterFlags, VariableFlags, WaitFlags};
pub use frame::{CallFrame, Namespace};
pub use host::{Host, StdHost};
pub use interpreter::{ClientData, Execute, FnCommand, Interpreter, InterpreterBuilder, Resolve};
pub use result::{Exception, ReturnCode, ScriptResult};
pub use text::MatchMode;
pub use thread_id::current_thread_id;
pub use thread_variable::{CleanupReport, ThreadVariable};
pub use variable::{FrameStorage, Variable, VariableStorage};
pub use wait::{WaitReport, WaitRequest, wait};
