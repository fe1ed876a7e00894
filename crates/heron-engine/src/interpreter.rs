//! The interpreter shell the execution core runs against.
//!
//! This is deliberately small: a command table with pluggable resolvers,
//! per-thread call stacks over shared namespaces, scopes and a global frame,
//! and the locks, gates and flags that the waiter, the background error
//! dispatcher and thread bindings coordinate through. Parsing and expression evaluation live
//! outside this crate; commands are native [`Execute`] implementations.
//!
//! # Locking
//!
//! The master lock is re-entrant and only guards cross-thread transitions:
//! readiness checks, cancellation delivery, background error dispatch and
//! disposal. Ordinary command execution does not hold it. Per-thread state
//! (the [`ExecutionContext`] and the call stack) is keyed by thread id.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::binding::ThreadBindingRegistry;
use crate::config::EngineConfig;
use crate::context::{ContextRef, ExecutionContext, ExternalExecutionGuard, LevelGuard, LevelKind};
use crate::error::{EngineError, EngineResult, VariableError, VariableOp};
use crate::event::{EventManager, EventQueue};
use crate::flags::{CallFrameFlags, CancelFlags, InterpreterFlags, VariableFlags};
use crate::frame::{CallFrame, Namespace};
use crate::host::{Host, StdHost};
use crate::result::{Exception, ScriptResult};
use crate::thread_id::current_thread_id;
use crate::thread_variable;
use crate::variable::{FrameStorage, Variable, VariableAccess, VariableStorage};
use crate::wait::{WaitReport, WaitRequest};

static NEXT_INTERPRETER_ID: AtomicU64 = AtomicU64::new(1);

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Opaque data handed to a command alongside its arguments.
pub type ClientData = Arc<dyn Any + Send + Sync>;

/// A native command.
pub trait Execute: Send + Sync {
    fn execute(
        &self,
        interpreter: &Interpreter,
        client_data: Option<&ClientData>,
        arguments: &[String],
    ) -> ScriptResult;
}

/// Adapts a closure into a command.
pub struct FnCommand<F>(pub F);

impl<F> Execute for FnCommand<F>
where
    F: Fn(&Interpreter, &[String]) -> ScriptResult + Send + Sync,
{
    fn execute(
        &self,
        interpreter: &Interpreter,
        _client_data: Option<&ClientData>,
        arguments: &[String],
    ) -> ScriptResult {
        (self.0)(interpreter, arguments)
    }
}

/// Command resolution hook, consulted before the command table.
pub trait Resolve: Send + Sync {
    fn resolve(&self, interpreter: &Interpreter, name: &str) -> Option<Arc<dyn Execute>>;
}

/// Runs before a wait is admitted; an error vetoes the wait.
pub type PreWaitCallback = Arc<dyn Fn(&Interpreter, &WaitRequest) -> EngineResult<()> + Send + Sync>;

/// Runs after a wait with its outcome; an error replaces the outcome.
pub type PostWaitCallback =
    Arc<dyn Fn(&Interpreter, &WaitRequest, &EngineResult<WaitReport>) -> EngineResult<()> + Send + Sync>;

/// Builder for [`Interpreter`].
#[derive(Default)]
pub struct InterpreterBuilder {
    config: EngineConfig,
    host: Option<Arc<dyn Host>>,
    event_manager: Option<Arc<dyn EventManager>>,
    no_event_manager: bool,
    registry: Option<Arc<ThreadBindingRegistry>>,
}

impl InterpreterBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn event_manager(mut self, manager: Arc<dyn EventManager>) -> Self {
        self.event_manager = Some(manager);
        self
    }

    /// Build without any event manager.
    pub fn without_event_manager(mut self) -> Self {
        self.no_event_manager = true;
        self
    }

    /// Share a thread binding registry with other interpreters.
    pub fn registry(mut self, registry: Arc<ThreadBindingRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Arc<Interpreter> {
        let event_manager = if self.no_event_manager {
            None
        } else {
            Some(
                self.event_manager
                    .unwrap_or_else(|| Arc::new(EventQueue::new()) as Arc<dyn EventManager>),
            )
        };

        let global_frame = Arc::new(CallFrame::new("global", CallFrameFlags::GLOBAL));
        let mut namespaces = IndexMap::new();
        namespaces.insert("::".to_string(), Arc::new(Namespace::new("::", None)));

        let config = self.config;
        let interpreter = Interpreter {
            id: NEXT_INTERPRETER_ID.fetch_add(1, Ordering::Relaxed),
            host: self.host.unwrap_or_else(|| Arc::new(StdHost)),
            event_manager: RwLock::new(event_manager),
            registry: self.registry.unwrap_or_else(ThreadBindingRegistry::new),
            master: ReentrantMutex::new(()),
            contexts: DashMap::new(),
            commands: RwLock::new(IndexMap::new()),
            resolvers: RwLock::new(Vec::new()),
            call_stacks: DashMap::new(),
            pending_cancel: Mutex::new(PendingCancel::default()),
            global_frame,
            namespaces: RwLock::new(namespaces),
            scopes: RwLock::new(IndexMap::new()),
            wait_count: AtomicUsize::new(0),
            waits_locked: AtomicBool::new(false),
            global_cancel: AtomicBool::new(false),
            background_error: RwLock::new(config.background_error.handler.clone()),
            flags: RwLock::new(config.background_error.interpreter_flags()),
            pre_wait: RwLock::new(None),
            post_wait: RwLock::new(None),
            deleted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            config,
        };
        tracing::debug!(interpreter = interpreter.id, "interpreter created");
        Arc::new(interpreter)
    }
}

#[derive(Debug, Clone, Default)]
struct PendingCancel {
    /// (result, unwind, need_result)
    cancel: Option<(Option<String>, bool, bool)>,
    halt: Option<Option<String>>,
}

impl PendingCancel {
    fn apply(&self, context: &mut ExecutionContext) {
        if let Some((result, unwind, need_result)) = &self.cancel {
            context.cancel_evaluate(result.clone(), *unwind, *need_result);
        }
        if let Some(result) = &self.halt {
            context.halt_evaluate(result.clone());
        }
    }
}

/// An interpreter instance.
pub struct Interpreter {
    id: u64,
    config: EngineConfig,
    host: Arc<dyn Host>,
    event_manager: RwLock<Option<Arc<dyn EventManager>>>,
    registry: Arc<ThreadBindingRegistry>,

    /// Serializes cross-thread transitions
    master: ReentrantMutex<()>,
    /// Execution contexts by thread id
    contexts: DashMap<u64, ContextRef>,

    commands: RwLock<IndexMap<String, Arc<dyn Execute>>>,
    resolvers: RwLock<Vec<Arc<dyn Resolve>>>,

    /// Call stacks by thread id; the global frame sits below each of them
    call_stacks: DashMap<u64, Vec<Arc<CallFrame>>>,
    global_frame: Arc<CallFrame>,
    namespaces: RwLock<IndexMap<String, Arc<Namespace>>>,
    /// Named scopes that outlive the call that created them
    scopes: RwLock<IndexMap<String, Arc<CallFrame>>>,

    /// Admitted waiters
    wait_count: AtomicUsize,
    waits_locked: AtomicBool,
    global_cancel: AtomicBool,
    /// Cancel or halt delivered to every thread, including threads that
    /// have no context yet
    pending_cancel: Mutex<PendingCancel>,

    background_error: RwLock<Option<String>>,
    flags: RwLock<InterpreterFlags>,
    pre_wait: RwLock<Option<PreWaitCallback>>,
    post_wait: RwLock<Option<PostWaitCallback>>,

    deleted: AtomicBool,
    disposed: AtomicBool,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("contexts", &self.contexts.len())
            .field("wait_count", &self.wait_count())
            .field("deleted", &self.is_deleted())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    /// Create an interpreter with default configuration.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> InterpreterBuilder {
        InterpreterBuilder::default()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn registry(&self) -> &Arc<ThreadBindingRegistry> {
        &self.registry
    }

    pub fn event_manager(&self) -> Option<Arc<dyn EventManager>> {
        self.event_manager.read().clone()
    }

    pub fn set_event_manager(&self, manager: Option<Arc<dyn EventManager>>) {
        *self.event_manager.write() = manager;
    }

    // ---------------------------------------------------------------------
    // Master lock
    // ---------------------------------------------------------------------

    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.master.lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.master.try_lock_for(timeout)
    }

    // ---------------------------------------------------------------------
    // Execution contexts
    // ---------------------------------------------------------------------

    /// Context of the calling thread, created on first use.
    pub fn context(&self) -> ContextRef {
        self.context_for_thread(current_thread_id())
    }

    fn context_for_thread(&self, thread_id: u64) -> ContextRef {
        self.contexts
            .entry(thread_id)
            .or_insert_with(|| {
                let mut context = ExecutionContext::from_config(thread_id, &self.config);
                self.pending_cancel.lock().apply(&mut context);
                context.into_ref()
            })
            .value()
            .clone()
    }

    /// Context of a thread, if it has one.
    pub fn existing_context(&self, thread_id: u64) -> Option<ContextRef> {
        self.contexts.get(&thread_id).map(|c| c.value().clone())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn live_contexts(&self) -> Vec<ContextRef> {
        self.contexts.iter().map(|c| c.value().clone()).collect()
    }

    /// Drop the calling thread's context if it is not mid-evaluation.
    pub fn maybe_dispose_thread(&self) -> bool {
        let thread_id = current_thread_id();
        self.call_stacks.remove_if(&thread_id, |_, stack| stack.is_empty());
        match self
            .contexts
            .remove_if(&thread_id, |_, context| context.lock().is_idle())
        {
            Some((_, context)) => {
                context.lock().dispose();
                tracing::trace!(interpreter = self.id, thread_id, "thread context disposed");
                true
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------------
    // Wait admission
    // ---------------------------------------------------------------------

    /// Admit a waiter. Returns the new waiter count, or 0 when refused.
    pub fn enter_wait(&self) -> usize {
        if self.waits_locked.load(Ordering::Acquire) {
            return 0;
        }
        let max = self.config.wait.max_concurrent_waits;
        self.wait_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map(|previous| previous + 1)
            .unwrap_or(0)
    }

    /// Release an admitted waiter. Returns the remaining waiter count.
    pub fn exit_wait(&self) -> usize {
        self.wait_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0)
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count.load(Ordering::Acquire)
    }

    /// Refuse all new waits. Returns whether waits were already locked.
    pub fn lock_waits(&self) -> bool {
        self.waits_locked.swap(true, Ordering::AcqRel)
    }

    pub fn unlock_waits(&self) -> bool {
        self.waits_locked.swap(false, Ordering::AcqRel)
    }

    pub fn set_pre_wait_callback(&self, callback: Option<PreWaitCallback>) {
        *self.pre_wait.write() = callback;
    }

    pub fn pre_wait_callback(&self) -> Option<PreWaitCallback> {
        self.pre_wait.read().clone()
    }

    pub fn set_post_wait_callback(&self, callback: Option<PostWaitCallback>) {
        *self.post_wait.write() = callback;
    }

    pub fn post_wait_callback(&self) -> Option<PostWaitCallback> {
        self.post_wait.read().clone()
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Cancel evaluation on every thread: those with a context now and
    /// those that enter the interpreter before the cancel is reset.
    ///
    /// `UNWIND` also unwinds through catch handlers, `NEED_RESULT` stores
    /// `result` as the cancellation result and `GLOBAL` raises the
    /// interpreter-wide cancel flag.
    pub fn cancel_evaluate(&self, result: Option<String>, flags: CancelFlags) -> bool {
        let _guard = self.lock();
        if flags.contains(CancelFlags::GLOBAL) {
            self.global_cancel.store(true, Ordering::Release);
        }
        let unwind = flags.contains(CancelFlags::UNWIND);
        let need_result = flags.contains(CancelFlags::NEED_RESULT);
        self.pending_cancel.lock().cancel = Some((result.clone(), unwind, need_result));
        self.context();
        let contexts = self.live_contexts();
        for context in &contexts {
            context.lock().cancel_evaluate(result.clone(), unwind, need_result);
        }
        tracing::debug!(
            interpreter = self.id,
            contexts = contexts.len(),
            ?flags,
            "evaluation canceled"
        );
        true
    }

    /// Halt evaluation on every thread, present and future, until reset.
    pub fn halt_evaluate(&self, result: Option<String>) -> bool {
        let _guard = self.lock();
        self.pending_cancel.lock().halt = Some(result.clone());
        self.context();
        for context in self.live_contexts() {
            context.lock().halt_evaluate(result.clone());
        }
        tracing::debug!(interpreter = self.id, "evaluation halted");
        true
    }

    /// Clear the calling thread's cancellation state and stop delivering a
    /// pending cancel (halt too with `HALT`) to threads entering later;
    /// `GLOBAL` also clears the interpreter-wide flag. Returns whether
    /// anything was reset.
    pub fn reset_cancel(&self, flags: CancelFlags) -> bool {
        let _guard = self.lock();
        {
            let mut pending = self.pending_cancel.lock();
            pending.cancel = None;
            if flags.contains(CancelFlags::HALT) {
                pending.halt = None;
            }
        }
        let mut was_set = self.context().lock().reset_cancel(flags);
        if flags.contains(CancelFlags::GLOBAL) {
            was_set |= self.global_cancel.swap(false, Ordering::AcqRel);
        }
        was_set
    }

    pub fn is_global_cancel(&self) -> bool {
        self.global_cancel.load(Ordering::Acquire)
    }

    /// Whether the calling thread may keep evaluating.
    ///
    /// With a `timeout` the master lock must be obtained within it, otherwise
    /// the check fails with [`EngineError::LockTimeout`].
    pub fn event_ready(
        &self,
        timeout: Option<Duration>,
        no_cancel: bool,
        no_global_cancel: bool,
    ) -> EngineResult<()> {
        if self.is_deleted_or_disposed() {
            return Err(EngineError::InterpreterDisposed);
        }
        let _guard = match timeout {
            Some(timeout) => self.try_lock_for(timeout).ok_or(EngineError::LockTimeout {
                millis: saturating_millis(timeout),
            })?,
            None => self.lock(),
        };
        if self.is_deleted_or_disposed() {
            return Err(EngineError::InterpreterDisposed);
        }

        if !no_cancel {
            let context = self.context();
            let context = context.lock();
            if context.is_canceled() {
                let unwind = context.is_unwinding();
                let message = match context.cancel_result() {
                    Some(result) => result.to_string(),
                    None if unwind => "eval unwound".to_string(),
                    None => "eval canceled".to_string(),
                };
                return Err(EngineError::Canceled { message, unwind });
            }
            if context.is_halted() {
                return Err(EngineError::Halted {
                    message: context.halt_result().unwrap_or("eval halted").to_string(),
                });
            }
        }

        if !no_global_cancel && self.is_global_cancel() {
            return Err(EngineError::Canceled {
                message: "eval canceled".to_string(),
                unwind: false,
            });
        }
        Ok(())
    }

    /// Readiness check with no timeout, honouring all cancellation.
    pub fn ready(&self) -> EngineResult<()> {
        self.event_ready(None, false, false)
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    pub fn add_command(&self, name: impl Into<String>, command: Arc<dyn Execute>) -> Option<Arc<dyn Execute>> {
        self.commands.write().insert(name.into(), command)
    }

    pub fn add_fn_command<F>(&self, name: impl Into<String>, f: F) -> Option<Arc<dyn Execute>>
    where
        F: Fn(&Interpreter, &[String]) -> ScriptResult + Send + Sync + 'static,
    {
        self.add_command(name, Arc::new(FnCommand(f)))
    }

    pub fn remove_command(&self, name: &str) -> bool {
        self.commands.write().shift_remove(name).is_some()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.read().contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    pub fn add_resolver(&self, resolver: Arc<dyn Resolve>) {
        self.resolvers.write().push(resolver);
    }

    /// Resolve a command name through the resolvers, then the command table.
    pub fn resolve_command(&self, name: &str) -> EngineResult<Arc<dyn Execute>> {
        let resolvers = self.resolvers.read().clone();
        for resolver in resolvers {
            if let Some(command) = resolver.resolve(self, name) {
                return Ok(command);
            }
        }
        self.commands
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::CommandNotFound(name.to_string()))
    }

    /// Run an already resolved command on the calling thread.
    pub fn execute(
        &self,
        name: &str,
        command: &dyn Execute,
        client_data: Option<&ClientData>,
        arguments: &[String],
    ) -> ScriptResult {
        self.ready()?;
        let context = self.context();
        let _level = LevelGuard::enter(&context, LevelKind::Script)?;

        tracing::trace!(interpreter = self.id, command = name, "execute");
        let result = command.execute(self, client_data, arguments);
        if let Err(exception) = &result {
            context.lock().record_exception(exception);
        }
        result
    }

    /// Resolve `arguments[0]` and run it.
    pub fn invoke(&self, arguments: &[String]) -> ScriptResult {
        let Some(name) = arguments.first() else {
            return Err(Exception::error("wrong # args: no command name"));
        };
        let command = self.resolve_command(name)?;
        self.execute(name, command.as_ref(), None, arguments)
    }

    /// [`invoke`](Self::invoke) inside an external-execution bracket.
    pub fn invoke_external(&self, arguments: &[String]) -> ScriptResult {
        let context = self.context();
        let _external = ExternalExecutionGuard::enter(&context);
        self.invoke(arguments)
    }

    // ---------------------------------------------------------------------
    // Call frames, scopes and namespaces
    // ---------------------------------------------------------------------

    pub fn global_frame(&self) -> Arc<CallFrame> {
        Arc::clone(&self.global_frame)
    }

    /// Innermost frame of the calling thread's call stack.
    pub fn current_frame(&self) -> Arc<CallFrame> {
        self.call_stacks
            .get(&current_thread_id())
            .and_then(|stack| stack.last().cloned())
            .unwrap_or_else(|| self.global_frame())
    }

    pub fn push_call_frame(&self, frame: Arc<CallFrame>) {
        self.call_stacks
            .entry(current_thread_id())
            .or_default()
            .push(frame);
    }

    /// Pop the calling thread's innermost frame. The global frame is never popped.
    pub fn pop_call_frame(&self) -> EngineResult<Arc<CallFrame>> {
        self.call_stacks
            .get_mut(&current_thread_id())
            .and_then(|mut stack| stack.pop())
            .ok_or_else(|| EngineError::call_frame("cannot pop the global call frame"))
    }

    /// Number of frames above the global frame on the calling thread.
    pub fn call_frame_depth(&self) -> usize {
        self.call_stacks
            .get(&current_thread_id())
            .map_or(0, |stack| stack.len())
    }

    /// A frame used only to mark an activation, e.g. background error handling.
    pub fn new_tracking_call_frame(&self, name: &str, flags: CallFrameFlags) -> Arc<CallFrame> {
        Arc::new(CallFrame::new(name, flags | CallFrameFlags::TRACKING))
    }

    /// Pop any scope frames left on top, then one more. Returns the number popped.
    pub fn pop_scope_call_frames_and_one_more(&self) -> usize {
        let Some(mut frames) = self.call_stacks.get_mut(&current_thread_id()) else {
            return 0;
        };
        let mut popped = 0;
        while frames.last().is_some_and(|f| f.is_scope()) {
            frames.pop();
            popped += 1;
        }
        if frames.pop().is_some() {
            popped += 1;
        }
        popped
    }

    /// Create a named scope frame.
    pub fn create_scope(&self, name: &str, flags: CallFrameFlags) -> EngineResult<Arc<CallFrame>> {
        let mut scopes = self.scopes.write();
        if scopes.contains_key(name) {
            return Err(EngineError::call_frame(format!("scope \"{}\" already exists", name)));
        }
        let frame = Arc::new(CallFrame::new(name, flags | CallFrameFlags::SCOPE));
        scopes.insert(name.to_string(), Arc::clone(&frame));
        Ok(frame)
    }

    pub fn scope(&self, name: &str) -> Option<Arc<CallFrame>> {
        self.scopes.read().get(name).cloned()
    }

    pub fn remove_scope(&self, name: &str) -> bool {
        self.scopes.write().shift_remove(name).is_some()
    }

    /// Named scopes plus every procedure or scope frame on any thread's call stack.
    fn scope_frames(&self) -> Vec<Arc<CallFrame>> {
        let mut frames: IndexMap<u64, Arc<CallFrame>> = self
            .scopes
            .read()
            .values()
            .map(|f| (f.id(), Arc::clone(f)))
            .collect();
        for stack in self.call_stacks.iter() {
            for frame in stack.value() {
                if frame
                    .flags()
                    .intersects(CallFrameFlags::SCOPE | CallFrameFlags::PROCEDURE)
                {
                    frames.entry(frame.id()).or_insert_with(|| Arc::clone(frame));
                }
            }
        }
        frames.into_values().collect()
    }

    /// Visit every live scope frame, stopping at the first error.
    pub fn for_each_scope<F>(&self, mut visit: F) -> EngineResult<()>
    where
        F: FnMut(&Arc<CallFrame>) -> EngineResult<()>,
    {
        for frame in self.scope_frames() {
            visit(&frame)?;
        }
        Ok(())
    }

    fn qualify(name: &str) -> String {
        if name.starts_with("::") {
            name.to_string()
        } else {
            format!("::{}", name)
        }
    }

    /// Create (or return the existing) namespace.
    pub fn create_namespace(&self, name: &str) -> Arc<Namespace> {
        let qualified = Self::qualify(name);
        let mut namespaces = self.namespaces.write();
        if let Some(existing) = namespaces.get(&qualified) {
            return Arc::clone(existing);
        }
        let frame = Arc::new(CallFrame::new(
            qualified.clone(),
            CallFrameFlags::NAMESPACE,
        ));
        let namespace = Arc::new(Namespace::new(qualified.clone(), Some(frame)));
        namespaces.insert(qualified, Arc::clone(&namespace));
        namespace
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(&Self::qualify(name)).cloned()
    }

    /// Delete a namespace. The global namespace cannot be deleted.
    pub fn delete_namespace(&self, name: &str) -> bool {
        let qualified = Self::qualify(name);
        if qualified == "::" {
            return false;
        }
        self.namespaces.write().shift_remove(&qualified).is_some()
    }

    /// Visit every namespace, stopping at the first error.
    pub fn for_each_namespace<F>(&self, mut visit: F) -> EngineResult<()>
    where
        F: FnMut(&Arc<Namespace>) -> EngineResult<()>,
    {
        let namespaces: Vec<_> = self.namespaces.read().values().cloned().collect();
        for namespace in &namespaces {
            visit(namespace)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Variables
    // ---------------------------------------------------------------------

    /// Frame a variable name refers to, and the unqualified name.
    fn variable_frame<'a>(&self, name: &'a str, flags: VariableFlags) -> EngineResult<(Arc<CallFrame>, &'a str)> {
        if let Some(rest) = name.strip_prefix("::") {
            if let Some(pos) = rest.rfind("::") {
                let frame = self
                    .namespace(&rest[..pos])
                    .and_then(|ns| ns.variable_frame().cloned())
                    .ok_or_else(|| {
                        EngineError::call_frame(format!(
                            "can't access \"{}\": parent namespace doesn't exist",
                            name
                        ))
                    })?;
                return Ok((frame, &rest[pos + 2..]));
            }
            return Ok((self.global_frame(), rest));
        }
        if flags.contains(VariableFlags::GLOBAL_ONLY) {
            return Ok((self.global_frame(), name));
        }
        let frame = self
            .call_stacks
            .get(&current_thread_id())
            .and_then(|stack| stack.iter().rev().find(|f| f.has_variables()).cloned())
            .unwrap_or_else(|| self.global_frame());
        Ok((frame, name))
    }

    /// Declare a variable backed by `storage`.
    pub fn add_variable(
        &self,
        flags: VariableFlags,
        name: &str,
        storage: Arc<dyn VariableStorage>,
    ) -> EngineResult<Arc<Variable>> {
        let (frame, local) = self.variable_frame(name, flags)?;
        let variable = Arc::new(Variable::new(
            local,
            flags - VariableFlags::GLOBAL_ONLY,
            storage,
        ));
        frame.add_variable(Arc::clone(&variable))?;
        Ok(variable)
    }

    pub fn lookup_variable(&self, name: &str, flags: VariableFlags) -> EngineResult<Option<Arc<Variable>>> {
        let (frame, local) = self.variable_frame(name, flags)?;
        Ok(frame.lookup(local))
    }

    fn missing(op: VariableOp, name: &str) -> EngineError {
        VariableError::Missing {
            op,
            name: name.to_string(),
            suffix: "",
        }
        .into()
    }

    pub fn get_variable(&self, name: &str, index: Option<&str>, flags: VariableFlags) -> EngineResult<String> {
        let (frame, local) = self.variable_frame(name, flags)?;
        let variable = frame
            .lookup(local)
            .ok_or_else(|| Self::missing(VariableOp::Get, name))?;
        let access = VariableAccess::new(local, index, current_thread_id()).with_flags(flags);
        Ok(variable.get(&access)?)
    }

    /// Set a variable, declaring it with frame storage if needed.
    pub fn set_variable(
        &self,
        name: &str,
        index: Option<&str>,
        value: &str,
        flags: VariableFlags,
    ) -> EngineResult<String> {
        let (frame, local) = self.variable_frame(name, flags)?;
        let variable = match frame.lookup(local) {
            Some(variable) => variable,
            None => {
                let variable = Arc::new(Variable::new(
                    local,
                    VariableFlags::empty(),
                    Arc::new(FrameStorage::new()),
                ));
                frame.add_variable(Arc::clone(&variable))?;
                variable
            }
        };
        let access = VariableAccess::new(local, index, current_thread_id()).with_flags(flags);
        Ok(variable.set(&access, value)?)
    }

    pub fn unset_variable(&self, name: &str, index: Option<&str>, flags: VariableFlags) -> EngineResult<()> {
        let (frame, local) = self.variable_frame(name, flags)?;
        let variable = frame
            .lookup(local)
            .ok_or_else(|| Self::missing(VariableOp::Unset, name))?;
        let access = VariableAccess::new(local, index, current_thread_id()).with_flags(flags);
        variable.unset(&access)?;
        // Frame-backed variables disappear entirely; thread variables stay
        // declared for the other threads.
        if index.is_none() && variable.thread_variable().is_none() {
            frame.remove_variable(local);
        }
        Ok(())
    }

    pub fn variable_exists(&self, name: &str, index: Option<&str>, flags: VariableFlags) -> bool {
        let Ok((frame, local)) = self.variable_frame(name, flags) else {
            return false;
        };
        frame.lookup(local).is_some_and(|variable| {
            variable.exists(&VariableAccess::new(local, index, current_thread_id()))
        })
    }

    // ---------------------------------------------------------------------
    // Background error policy
    // ---------------------------------------------------------------------

    pub fn background_error_handler(&self) -> Option<String> {
        self.background_error.read().clone()
    }

    pub fn set_background_error_handler(&self, handler: Option<String>) {
        *self.background_error.write() = handler;
    }

    pub fn flags(&self) -> InterpreterFlags {
        *self.flags.read()
    }

    pub fn has_flags(&self, flags: InterpreterFlags) -> bool {
        self.flags.read().contains(flags)
    }

    pub fn set_flags(&self, flags: InterpreterFlags, on: bool) {
        self.flags.write().set(flags, on);
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    fn require_event_manager(&self) -> EngineResult<Arc<dyn EventManager>> {
        self.event_manager()
            .ok_or_else(|| EngineError::Event("event manager not available".to_string()))
    }

    /// Process queued events. Returns the number processed.
    pub fn process_events(&self, limit: Option<usize>) -> EngineResult<usize> {
        if self.is_deleted_or_disposed() {
            return Err(EngineError::InterpreterDisposed);
        }
        self.require_event_manager()?.process_events(self, limit)
    }

    pub fn do_one_event(&self) -> EngineResult<bool> {
        if self.is_deleted_or_disposed() {
            return Err(EngineError::InterpreterDisposed);
        }
        self.require_event_manager()?.do_one_event(self)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Mark the interpreter deleted; it refuses further evaluation.
    pub fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn is_deleted_or_disposed(&self) -> bool {
        self.is_deleted() || self.is_disposed()
    }

    /// Tear the interpreter down.
    ///
    /// New waits are refused, active waiters get a few sleep slices to
    /// observe disposal, then thread variables, contexts and registry
    /// associations are released. Disposing twice is a no-op.
    pub fn dispose(&self) -> EngineResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.lock_waits();

        let wait = &self.config.wait;
        let deadline = Instant::now() + Duration::from_millis(wait.max_sleep_slice_ms.saturating_mul(4));
        let pause_ms = wait.dispose_sleep_ms(wait.max_sleep_slice_ms);
        while self.wait_count() > 0 && Instant::now() < deadline {
            if let Err(error) = self.host.sleep(pause_ms) {
                tracing::warn!(interpreter = self.id, %error, "host sleep failed while disposing");
                break;
            }
        }
        if self.wait_count() > 0 {
            tracing::warn!(
                interpreter = self.id,
                waiters = self.wait_count(),
                "disposing with waiters still active"
            );
        }

        let _guard = self.lock();
        if let Some(manager) = self.event_manager() {
            manager.save_enabled_and_force_disabled();
        }

        let values = thread_variable::cleanup_for_all_threads(self);
        let contexts = self.live_contexts();
        for context in &contexts {
            context.lock().dispose();
        }
        self.contexts.clear();
        self.call_stacks.clear();
        *self.pending_cancel.lock() = PendingCancel::default();
        self.scopes.write().clear();
        let associations = self.registry.cleanup_interpreter(self);

        tracing::debug!(
            interpreter = self.id,
            thread_values = values,
            contexts = contexts.len(),
            associations,
            "interpreter disposed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ReturnCode;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_wait_gate_capacity() {
        let config = EngineConfig::from_toml_str("[wait]\nmax_concurrent_waits = 2").unwrap();
        let interp = Interpreter::builder().config(config).build();
        assert_eq!(interp.enter_wait(), 1);
        assert_eq!(interp.enter_wait(), 2);
        assert_eq!(interp.enter_wait(), 0);
        assert_eq!(interp.exit_wait(), 1);
        assert_eq!(interp.exit_wait(), 0);
        assert_eq!(interp.exit_wait(), 0);

        interp.lock_waits();
        assert_eq!(interp.enter_wait(), 0);
        interp.unlock_waits();
        assert_eq!(interp.enter_wait(), 1);
    }

    #[test]
    fn test_event_ready_reports_cancel_and_halt() {
        let interp = Interpreter::new();
        assert!(interp.ready().is_ok());

        interp.cancel_evaluate(None, CancelFlags::UNWIND);
        let err = interp.ready().unwrap_err();
        assert_eq!(err.to_string(), "eval unwound");
        assert!(interp.event_ready(None, true, false).is_ok());

        assert!(interp.reset_cancel(CancelFlags::empty()));
        interp.halt_evaluate(None);
        assert!(matches!(interp.ready(), Err(EngineError::Halted { .. })));
        interp.reset_cancel(CancelFlags::HALT);

        interp.cancel_evaluate(Some("stop now".into()), CancelFlags::GLOBAL | CancelFlags::NEED_RESULT);
        assert_eq!(interp.ready().unwrap_err().to_string(), "stop now");
        interp.reset_cancel(CancelFlags::empty());
        // Local state cleared; the global flag remains until reset with GLOBAL.
        assert!(interp.ready().is_err());
        assert!(interp.event_ready(None, false, true).is_ok());
        interp.reset_cancel(CancelFlags::GLOBAL);
        assert!(interp.ready().is_ok());
    }

    #[test]
    fn test_event_ready_lock_timeout() {
        let interp = Interpreter::new();
        let holder = Arc::clone(&interp);
        let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            let _guard = holder.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();
        let err = interp
            .event_ready(Some(Duration::from_millis(5)), false, false)
            .unwrap_err();
        assert!(err.is_timed_out());
        assert!(matches!(err, EngineError::LockTimeout { millis: 5 }));
        release_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_micros(2_500)), 2);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_commands_and_resolvers() {
        struct Upper;
        impl Resolve for Upper {
            fn resolve(&self, _interpreter: &Interpreter, name: &str) -> Option<Arc<dyn Execute>> {
                (name == "shout").then(|| {
                    Arc::new(FnCommand(|_: &Interpreter, args: &[String]| {
                        Ok(args[1..].join(" ").to_uppercase())
                    })) as Arc<dyn Execute>
                })
            }
        }

        let interp = Interpreter::new();
        interp.add_fn_command("echo", |_, args| Ok(args[1..].join(" ")));
        interp.add_resolver(Arc::new(Upper));

        assert_eq!(interp.invoke(&args(&["echo", "a", "b"])).unwrap(), "a b");
        assert_eq!(interp.invoke(&args(&["shout", "hi"])).unwrap(), "HI");
        let err = interp.invoke(&args(&["nope"])).unwrap_err();
        assert_eq!(err.value, "invalid command name \"nope\"");
        assert!(interp.remove_command("echo"));
        assert!(!interp.has_command("echo"));
    }

    #[test]
    fn test_execute_records_error_and_balances_levels() {
        let interp = Interpreter::new();
        interp.add_fn_command("fail", |_, _| Err(Exception::error("boom").with_line(3)));
        let err = interp.invoke_external(&args(&["fail"])).unwrap_err();
        assert_eq!(err.code, ReturnCode::Error);

        let context = interp.context();
        let context = context.lock();
        assert_eq!(context.error_line(), 3);
        assert_eq!(context.return_code(), ReturnCode::Error);
        assert!(context.is_idle());
        assert_eq!(context.max_level(LevelKind::Script), 1);
    }

    #[test]
    fn test_variables_across_frames() {
        let interp = Interpreter::new();
        interp.set_variable("g", None, "1", VariableFlags::empty()).unwrap();

        let proc_frame = Arc::new(CallFrame::new("p", CallFrameFlags::PROCEDURE));
        interp.push_call_frame(proc_frame);
        interp.set_variable("local", None, "2", VariableFlags::empty()).unwrap();
        assert!(interp.get_variable("g", None, VariableFlags::empty()).is_err());
        assert_eq!(interp.get_variable("::g", None, VariableFlags::empty()).unwrap(), "1");
        assert_eq!(interp.get_variable("g", None, VariableFlags::GLOBAL_ONLY).unwrap(), "1");
        interp.pop_call_frame().unwrap();

        assert!(!interp.variable_exists("local", None, VariableFlags::empty()));
        interp.unset_variable("g", None, VariableFlags::empty()).unwrap();
        assert!(interp.global_frame().lookup("g").is_none());
        assert_eq!(
            interp.get_variable("g", None, VariableFlags::empty()).unwrap_err().to_string(),
            "can't read \"g\": no such variable"
        );
    }

    #[test]
    fn test_call_stacks_are_per_thread() {
        let interp = Interpreter::new();
        interp.set_variable("g", None, "global", VariableFlags::empty()).unwrap();

        let worker = Arc::clone(&interp);
        let (pushed_tx, pushed_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            worker.push_call_frame(Arc::new(CallFrame::new("p", CallFrameFlags::PROCEDURE)));
            worker.set_variable("x", None, "worker-local", VariableFlags::empty()).unwrap();
            pushed_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            let frame = worker.current_frame();
            let depth = worker.call_frame_depth();
            let x = worker.get_variable("x", None, VariableFlags::empty()).unwrap();
            worker.pop_call_frame().unwrap();
            (frame.name().to_string(), depth, x)
        });
        pushed_rx.recv().unwrap();

        // The worker's procedure frame is invisible here.
        assert_eq!(interp.call_frame_depth(), 0);
        assert!(Arc::ptr_eq(&interp.current_frame(), &interp.global_frame()));
        assert!(interp.get_variable("x", None, VariableFlags::empty()).is_err());
        assert_eq!(interp.get_variable("g", None, VariableFlags::empty()).unwrap(), "global");

        // Popping here cannot take the worker's frame.
        interp.push_call_frame(interp.new_tracking_call_frame("mine", CallFrameFlags::empty()));
        assert_eq!(interp.pop_scope_call_frames_and_one_more(), 1);
        assert!(interp.pop_call_frame().is_err());

        release_tx.send(()).unwrap();
        let (name, depth, x) = handle.join().unwrap();
        assert_eq!(name, "p");
        assert_eq!(depth, 1);
        assert_eq!(x, "worker-local");
    }

    #[test]
    fn test_cancel_reaches_threads_entering_later() {
        let interp = Interpreter::new();
        let ready_on_new_thread = |interp: &Arc<Interpreter>| {
            let worker = Arc::clone(interp);
            std::thread::spawn(move || worker.ready().map_err(|e| e.to_string()))
                .join()
                .unwrap()
        };

        interp.cancel_evaluate(Some("stop".into()), CancelFlags::EVALUATE);
        assert_eq!(ready_on_new_thread(&interp), Err("stop".to_string()));
        interp.reset_cancel(CancelFlags::empty());
        assert_eq!(ready_on_new_thread(&interp), Ok(()));

        interp.halt_evaluate(None);
        assert_eq!(ready_on_new_thread(&interp), Err("eval halted".to_string()));
        interp.reset_cancel(CancelFlags::empty());
        assert_eq!(ready_on_new_thread(&interp), Err("eval halted".to_string()));
        interp.reset_cancel(CancelFlags::HALT);
        assert_eq!(ready_on_new_thread(&interp), Ok(()));
    }

    #[test]
    fn test_namespace_variables() {
        let interp = Interpreter::new();
        let ns = interp.create_namespace("util");
        assert_eq!(ns.name(), "::util");
        assert!(Arc::ptr_eq(&ns, &interp.create_namespace("::util")));
        interp.set_variable("::util::x", None, "v", VariableFlags::empty()).unwrap();
        assert_eq!(ns.variable_frame().unwrap().variable_names(), vec!["x"]);
        assert!(interp.set_variable("::missing::x", None, "v", VariableFlags::empty()).is_err());
        assert!(!interp.delete_namespace("::"));
        assert!(interp.delete_namespace("util"));
    }

    #[test]
    fn test_pop_scope_frames_and_one_more() {
        let interp = Interpreter::new();
        let tracking = interp.new_tracking_call_frame("bgerror", CallFrameFlags::BACKGROUND_ERROR);
        assert!(tracking.flags().contains(CallFrameFlags::TRACKING));
        interp.push_call_frame(tracking);
        interp.push_call_frame(Arc::new(CallFrame::new("s1", CallFrameFlags::SCOPE)));
        interp.push_call_frame(Arc::new(CallFrame::new("s2", CallFrameFlags::SCOPE)));
        assert_eq!(interp.pop_scope_call_frames_and_one_more(), 3);
        assert_eq!(interp.call_frame_depth(), 0);
        assert_eq!(interp.pop_scope_call_frames_and_one_more(), 0);
        assert!(interp.pop_call_frame().is_err());
    }

    #[test]
    fn test_maybe_dispose_thread_keeps_busy_context() {
        let interp = Interpreter::new();
        let context = interp.context();
        let guard = ExternalExecutionGuard::enter(&context);
        assert!(!interp.maybe_dispose_thread());
        drop(guard);
        assert!(interp.maybe_dispose_thread());
        assert_eq!(interp.context_count(), 0);
    }

    #[test]
    fn test_dispose_refuses_further_work() {
        let interp = Interpreter::new();
        interp.add_fn_command("noop", |_, _| Ok(String::new()));
        interp.context();
        interp.dispose().unwrap();
        interp.dispose().unwrap();

        assert!(interp.is_disposed());
        assert_eq!(interp.context_count(), 0);
        assert_eq!(interp.enter_wait(), 0);
        assert!(matches!(interp.ready(), Err(EngineError::InterpreterDisposed)));
        assert!(interp.invoke(&args(&["noop"])).is_err());
    }
}
