//! Per-interpreter, per-thread execution state.
//!
//! An [`ExecutionContext`] holds everything one thread accumulates while it
//! evaluates on behalf of one interpreter: nesting counters, the
//! cancellation/halt state, error state and the script-location stack.
//!
//! # Locking
//!
//! Contexts are shared as [`ContextRef`] (`Arc<Mutex<_>>`). The owning thread
//! locks its context briefly for each transition; other threads only touch a
//! context while holding the interpreter's master lock (cancellation delivery,
//! background error dispatch). The lock order is always master lock first,
//! then context.
//!
//! # Brackets
//!
//! Counter increments must be paired with decrements on every exit path. Use
//! the scope guards ([`ExternalExecutionGuard`], [`NestedExecutionGuard`],
//! [`LevelGuard`]) rather than calling the begin/end pairs by hand.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{EngineConfig, LevelLimits};
use crate::error::{EngineError, EngineResult};
use crate::flags::{CancelFlags, EngineFlags};
use crate::result::{Exception, ReturnCode};

/// Shared handle to a context.
pub type ContextRef = Arc<Mutex<ExecutionContext>>;

/// The independent nesting counters kept by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelKind {
    General,
    Script,
    Parser,
    Expression,
    EntryExpression,
    Catch,
    Unknown,
    Trace,
    SubCommand,
    Setting,
    Package,
    Security,
    Policy,
    Test,
}

impl LevelKind {
    pub const COUNT: usize = 14;

    pub const ALL: [LevelKind; Self::COUNT] = [
        LevelKind::General,
        LevelKind::Script,
        LevelKind::Parser,
        LevelKind::Expression,
        LevelKind::EntryExpression,
        LevelKind::Catch,
        LevelKind::Unknown,
        LevelKind::Trace,
        LevelKind::SubCommand,
        LevelKind::Setting,
        LevelKind::Package,
        LevelKind::Security,
        LevelKind::Policy,
        LevelKind::Test,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            LevelKind::General => "general",
            LevelKind::Script => "script",
            LevelKind::Parser => "parser",
            LevelKind::Expression => "expression",
            LevelKind::EntryExpression => "entry expression",
            LevelKind::Catch => "catch",
            LevelKind::Unknown => "unknown",
            LevelKind::Trace => "trace",
            LevelKind::SubCommand => "sub-command",
            LevelKind::Setting => "setting",
            LevelKind::Package => "package",
            LevelKind::Security => "security",
            LevelKind::Policy => "policy",
            LevelKind::Test => "test",
        }
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LevelCounter {
    current: usize,
    maximum: usize,
}

/// Where a script being evaluated came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocation {
    pub file: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

impl ScriptLocation {
    pub fn new(file: Option<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file,
            start_line,
            end_line,
        }
    }
}

/// An in-progress element walk over an array variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySearch {
    pub variable: String,
    keys: Vec<String>,
    position: usize,
}

impl ArraySearch {
    fn next_key(&mut self) -> Option<String> {
        let key = self.keys.get(self.position).cloned();
        if key.is_some() {
            self.position += 1;
        }
        key
    }

    pub fn any_more(&self) -> bool {
        self.position < self.keys.len()
    }
}

/// Execution state for one (interpreter, thread) pair.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Thread this context belongs to
    thread_id: u64,
    /// Configured nesting limits
    limits: LevelLimits,
    /// Whether external execution forces native stack checks
    force_stack_check: bool,

    levels: [LevelCounter; LevelKind::COUNT],
    /// General level recorded by the innermost nested-execution bracket
    previous_levels: usize,

    cancel: bool,
    unwind: bool,
    cancel_result: Option<String>,
    halt: bool,
    halt_result: Option<String>,
    stack_overflow: bool,

    engine_flags: EngineFlags,

    return_code: ReturnCode,
    error_line: u32,
    error_code: Option<String>,
    error_info: Option<String>,
    error_frames: usize,
    exception: Option<Exception>,
    complaint: Option<String>,

    script_locations: Vec<ScriptLocation>,
    previous_process_id: Option<u32>,
    array_searches: HashMap<String, ArraySearch>,
    next_search_id: u64,

    disposed: bool,
}

impl ExecutionContext {
    pub fn new(thread_id: u64, limits: LevelLimits, force_stack_check: bool) -> Self {
        Self {
            thread_id,
            limits,
            force_stack_check,
            levels: [LevelCounter::default(); LevelKind::COUNT],
            previous_levels: 0,
            cancel: false,
            unwind: false,
            cancel_result: None,
            halt: false,
            halt_result: None,
            stack_overflow: false,
            engine_flags: EngineFlags::empty(),
            return_code: ReturnCode::Ok,
            error_line: 0,
            error_code: None,
            error_info: None,
            error_frames: 0,
            exception: None,
            complaint: None,
            script_locations: Vec::new(),
            previous_process_id: None,
            array_searches: HashMap::new(),
            next_search_id: 0,
            disposed: false,
        }
    }

    /// Create a context using the limits and stack-check policy of `config`.
    pub fn from_config(thread_id: u64, config: &EngineConfig) -> Self {
        Self::new(
            thread_id,
            config.limits.clone(),
            config.execution.force_stack_check,
        )
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> ContextRef {
        Arc::new(Mutex::new(self))
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    // ---------------------------------------------------------------------
    // Nesting counters
    // ---------------------------------------------------------------------

    /// Current value of a nesting counter.
    pub fn level(&self, kind: LevelKind) -> usize {
        self.levels[kind.index()].current
    }

    /// Highest value a nesting counter has reached.
    pub fn max_level(&self, kind: LevelKind) -> usize {
        self.levels[kind.index()].maximum
    }

    /// Current general nesting level.
    pub fn levels(&self) -> usize {
        self.level(LevelKind::General)
    }

    /// Whether every nesting counter is zero.
    pub fn is_idle(&self) -> bool {
        self.levels.iter().all(|c| c.current == 0)
    }

    fn increment(&mut self, kind: LevelKind) -> usize {
        let counter = &mut self.levels[kind.index()];
        counter.current += 1;
        if counter.current > counter.maximum {
            counter.maximum = counter.current;
        }
        counter.current
    }

    /// Increment a counter, enforcing its configured limit.
    ///
    /// On overflow the counter is left unchanged and the stack-overflow flag
    /// is set.
    pub fn enter_level(&mut self, kind: LevelKind) -> EngineResult<usize> {
        if let Some(limit) = self.limits.limit_for(kind)
            && self.level(kind) >= limit
        {
            self.stack_overflow = true;
            return Err(EngineError::StackOverflow { kind, limit });
        }
        Ok(self.increment(kind))
    }

    /// Decrement a counter. Returns the new value.
    ///
    /// A decrement at zero is refused; the counter stays at zero.
    pub fn exit_level(&mut self, kind: LevelKind) -> usize {
        let counter = &mut self.levels[kind.index()];
        if counter.current == 0 {
            tracing::warn!(
                thread_id = self.thread_id,
                kind = %kind,
                "unbalanced level decrement ignored"
            );
            return 0;
        }
        counter.current -= 1;
        counter.current
    }

    /// Enter externally initiated evaluation. Returns the flags to hand back
    /// to [`end_external_execution`](Self::end_external_execution).
    pub fn begin_external_execution(&mut self) -> EngineFlags {
        let saved = self.engine_flags;
        self.increment(LevelKind::General);
        self.engine_flags.insert(EngineFlags::EXTERNAL_EXECUTION);
        if self.force_stack_check {
            self.engine_flags.insert(EngineFlags::FORCE_STACK_CHECK);
            self.engine_flags.remove(EngineFlags::NO_STACK_CHECK);
        }
        saved
    }

    /// Leave externally initiated evaluation. Returns the new general level.
    pub fn end_external_execution(&mut self, saved: EngineFlags) -> usize {
        let restored = EngineFlags::EXTERNAL_EXECUTION | EngineFlags::STACK_CHECK_MASK;
        self.engine_flags = (self.engine_flags - restored) | (saved & restored);
        self.exit_level(LevelKind::General)
    }

    /// Re-baseline nesting for a re-entrant evaluation. Returns the token to
    /// hand back to [`end_nested_execution`](Self::end_nested_execution).
    pub fn begin_nested_execution(&mut self) -> usize {
        let saved = self.previous_levels;
        self.previous_levels = self.levels();
        saved
    }

    pub fn end_nested_execution(&mut self, saved: usize) {
        self.previous_levels = saved;
    }

    /// General level at the start of the innermost nested evaluation.
    pub fn previous_levels(&self) -> usize {
        self.previous_levels
    }

    pub fn engine_flags(&self) -> EngineFlags {
        self.engine_flags
    }

    pub fn is_external_execution(&self) -> bool {
        self.engine_flags.contains(EngineFlags::EXTERNAL_EXECUTION)
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Request cancellation of the evaluation running in this context.
    pub fn cancel_evaluate(&mut self, result: Option<String>, unwind: bool, need_result: bool) -> bool {
        self.cancel = true;
        if unwind {
            self.unwind = true;
        }
        if need_result {
            self.cancel_result = result;
        }
        true
    }

    /// Request that evaluation halt.
    pub fn halt_evaluate(&mut self, result: Option<String>) -> bool {
        self.halt = true;
        self.halt_result = result;
        true
    }

    /// Clear cancellation state. Halt is only cleared when `HALT` is given.
    /// Returns whether anything was set before the reset.
    pub fn reset_cancel(&mut self, flags: CancelFlags) -> bool {
        let mut was_set = self.cancel || self.unwind;
        self.cancel = false;
        self.unwind = false;
        self.cancel_result = None;
        if flags.contains(CancelFlags::HALT) {
            was_set |= self.halt;
            self.halt = false;
            self.halt_result = None;
        }
        was_set
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel
    }

    pub fn is_unwinding(&self) -> bool {
        self.unwind
    }

    pub fn cancel_result(&self) -> Option<&str> {
        self.cancel_result.as_deref()
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }

    pub fn halt_result(&self) -> Option<&str> {
        self.halt_result.as_deref()
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.stack_overflow
    }

    pub fn clear_stack_overflow(&mut self) {
        self.stack_overflow = false;
    }

    // ---------------------------------------------------------------------
    // Error state
    // ---------------------------------------------------------------------

    /// Record the outcome of a completed evaluation.
    pub fn record_result(&mut self, code: ReturnCode, error_line: u32) {
        self.return_code = code;
        self.error_line = error_line;
    }

    /// Record a captured non-Ok completion.
    pub fn record_exception(&mut self, exception: &Exception) {
        self.return_code = exception.code;
        self.error_line = exception.error_line;
        if exception.is_error() {
            self.error_frames += 1;
        }
        self.exception = Some(exception.clone());
    }

    pub fn return_code(&self) -> ReturnCode {
        self.return_code
    }

    pub fn error_line(&self) -> u32 {
        self.error_line
    }

    pub fn set_error_line(&mut self, line: u32) {
        self.error_line = line;
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn set_error_code(&mut self, code: Option<String>) {
        self.error_code = code;
    }

    pub fn error_info(&self) -> Option<&str> {
        self.error_info.as_deref()
    }

    /// Append a line to the accumulated error trace.
    pub fn append_error_info(&mut self, line: &str) {
        match &mut self.error_info {
            Some(info) => {
                info.push('\n');
                info.push_str(line);
            }
            None => self.error_info = Some(line.to_string()),
        }
    }

    pub fn error_frames(&self) -> usize {
        self.error_frames
    }

    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    pub fn take_exception(&mut self) -> Option<Exception> {
        self.exception.take()
    }

    pub fn complaint(&self) -> Option<&str> {
        self.complaint.as_deref()
    }

    pub fn set_complaint(&mut self, complaint: Option<String>) {
        self.complaint = complaint;
    }

    /// Clear the error trace ahead of a fresh top-level evaluation.
    pub fn reset_error(&mut self) {
        self.return_code = ReturnCode::Ok;
        self.error_line = 0;
        self.error_code = None;
        self.error_info = None;
        self.error_frames = 0;
        self.exception = None;
    }

    // ---------------------------------------------------------------------
    // Script locations
    // ---------------------------------------------------------------------

    pub fn push_script_location(&mut self, location: ScriptLocation) {
        self.script_locations.push(location);
    }

    pub fn pop_script_location(&mut self) -> Option<ScriptLocation> {
        self.script_locations.pop()
    }

    /// Innermost script location.
    pub fn script_location(&self) -> Option<&ScriptLocation> {
        self.script_locations.last()
    }

    pub fn script_locations(&self) -> &[ScriptLocation] {
        &self.script_locations
    }

    pub fn previous_process_id(&self) -> Option<u32> {
        self.previous_process_id
    }

    pub fn set_previous_process_id(&mut self, id: Option<u32>) {
        self.previous_process_id = id;
    }

    // ---------------------------------------------------------------------
    // Array searches
    // ---------------------------------------------------------------------

    /// Start walking the given keys of an array variable. Returns the search id.
    pub fn start_array_search(&mut self, variable: &str, keys: Vec<String>) -> String {
        self.next_search_id += 1;
        let id = format!("s-{}-{}", self.next_search_id, variable);
        self.array_searches.insert(
            id.clone(),
            ArraySearch {
                variable: variable.to_string(),
                keys,
                position: 0,
            },
        );
        id
    }

    pub fn next_array_element(&mut self, search_id: &str) -> Option<String> {
        self.array_searches.get_mut(search_id)?.next_key()
    }

    pub fn array_search(&self, search_id: &str) -> Option<&ArraySearch> {
        self.array_searches.get(search_id)
    }

    pub fn done_array_search(&mut self, search_id: &str) -> bool {
        self.array_searches.remove(search_id).is_some()
    }

    pub fn array_search_count(&self) -> usize {
        self.array_searches.len()
    }

    // ---------------------------------------------------------------------
    // Disposal
    // ---------------------------------------------------------------------

    /// Reset every field to its default. A disposed context can be reused.
    pub fn dispose(&mut self) {
        self.levels = [LevelCounter::default(); LevelKind::COUNT];
        self.previous_levels = 0;
        self.cancel = false;
        self.unwind = false;
        self.cancel_result = None;
        self.halt = false;
        self.halt_result = None;
        self.stack_overflow = false;
        self.engine_flags = EngineFlags::empty();
        self.return_code = ReturnCode::Ok;
        self.error_line = 0;
        self.error_code = None;
        self.error_info = None;
        self.error_frames = 0;
        self.exception = None;
        self.complaint = None;
        self.script_locations.clear();
        self.previous_process_id = None;
        self.array_searches.clear();
        self.next_search_id = 0;
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

// -------------------------------------------------------------------------
// Scope guards
// -------------------------------------------------------------------------

/// Holds an external-execution bracket open until dropped.
#[must_use = "the bracket closes when the guard is dropped"]
pub struct ExternalExecutionGuard {
    context: ContextRef,
    saved: EngineFlags,
}

impl ExternalExecutionGuard {
    pub fn enter(context: &ContextRef) -> Self {
        let saved = context.lock().begin_external_execution();
        Self {
            context: Arc::clone(context),
            saved,
        }
    }
}

impl Drop for ExternalExecutionGuard {
    fn drop(&mut self) {
        self.context.lock().end_external_execution(self.saved);
    }
}

/// Holds a nested-execution baseline until dropped.
#[must_use = "the baseline is restored when the guard is dropped"]
pub struct NestedExecutionGuard {
    context: ContextRef,
    saved: usize,
}

impl NestedExecutionGuard {
    pub fn enter(context: &ContextRef) -> Self {
        let saved = context.lock().begin_nested_execution();
        Self {
            context: Arc::clone(context),
            saved,
        }
    }
}

impl Drop for NestedExecutionGuard {
    fn drop(&mut self) {
        self.context.lock().end_nested_execution(self.saved);
    }
}

/// Holds one nesting counter incremented until dropped.
#[must_use = "the level is released when the guard is dropped"]
pub struct LevelGuard {
    context: ContextRef,
    kind: LevelKind,
    level: usize,
}

impl LevelGuard {
    /// Fails with `StackOverflow` when the counter's limit is reached.
    pub fn enter(context: &ContextRef, kind: LevelKind) -> EngineResult<Self> {
        let level = context.lock().enter_level(kind)?;
        Ok(Self {
            context: Arc::clone(context),
            kind,
            level,
        })
    }

    /// Counter value while this guard is held.
    pub fn level(&self) -> usize {
        self.level
    }
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        self.context.lock().exit_level(self.kind);
    }
}
