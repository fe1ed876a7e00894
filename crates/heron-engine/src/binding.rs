//! Thread bindings.
//!
//! A [`ThreadBinding`] wraps a start routine that runs on its own thread on
//! behalf of one interpreter. While the routine runs, the binding holds an
//! association in the [`ThreadBindingRegistry`]; at most one association
//! exists per thread. Teardown is symmetric whatever the routine does:
//! panics are contained at the thread boundary, and the identity,
//! association, thread variables and execution context are always released.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use scopeguard::defer;

use crate::error::EngineResult;
use crate::flags::CancelFlags;
use crate::interpreter::Interpreter;
use crate::thread_id::current_thread_id;
use crate::thread_variable;

/// Argument handed to a parameterized start routine.
pub type ThreadArg = Box<dyn Any + Send>;

/// Panic payload requesting that a bound thread stop. The binding resets the
/// thread's cancellation state and finishes teardown normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAbort;

/// Panic payload signalling that a bound thread was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInterrupt;

/// Unwind out of the current start routine as an abort.
pub fn abort_thread() -> ! {
    std::panic::panic_any(ThreadAbort)
}

/// Unwind out of the current start routine as an interrupt.
pub fn interrupt_thread() -> ! {
    std::panic::panic_any(ThreadInterrupt)
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if payload.is::<ThreadAbort>() {
        "thread aborted".to_string()
    } else if payload.is::<ThreadInterrupt>() {
        "thread interrupted".to_string()
    } else {
        "unknown error".to_string()
    }
}

/// The code a bound thread runs.
pub enum StartRoutine {
    Plain(Box<dyn FnOnce() + Send>),
    Parameterized(Box<dyn FnOnce(Option<ThreadArg>) + Send>),
}

impl StartRoutine {
    pub fn plain(f: impl FnOnce() + Send + 'static) -> Self {
        StartRoutine::Plain(Box::new(f))
    }

    pub fn parameterized(f: impl FnOnce(Option<ThreadArg>) + Send + 'static) -> Self {
        StartRoutine::Parameterized(Box::new(f))
    }

    fn invoke(self, arg: Option<ThreadArg>) {
        match self {
            StartRoutine::Plain(f) => f(),
            StartRoutine::Parameterized(f) => f(arg),
        }
    }
}

impl fmt::Debug for StartRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartRoutine::Plain(_) => f.write_str("StartRoutine::Plain"),
            StartRoutine::Parameterized(_) => f.write_str("StartRoutine::Parameterized"),
        }
    }
}

struct Association {
    thread_id: u64,
    interpreter: Arc<Interpreter>,
}

/// Counters reported by [`ThreadBindingRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingStats {
    /// Bindings ever created
    pub created: u64,
    /// Bindings currently running their thread entry
    pub active: usize,
    /// Live thread associations
    pub associations: usize,
}

/// Registry of live thread-to-interpreter associations.
///
/// Every operation holds the registry mutex only for its own duration.
pub struct ThreadBindingRegistry {
    associations: Mutex<HashMap<u64, Association>>,
    next_key: AtomicU64,
    created: AtomicU64,
    active: AtomicUsize,
}

impl ThreadBindingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            associations: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            created: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        })
    }

    fn next_key(&self) -> u64 {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Record that `thread_id` now runs on behalf of `interpreter`.
    ///
    /// Refused when the binding already has an association or the thread is
    /// already associated through another binding.
    pub fn associate(&self, key: u64, thread_id: u64, interpreter: &Arc<Interpreter>) -> bool {
        let mut associations = self.associations.lock();
        if associations.contains_key(&key) || associations.values().any(|a| a.thread_id == thread_id) {
            return false;
        }
        associations.insert(
            key,
            Association {
                thread_id,
                interpreter: Arc::clone(interpreter),
            },
        );
        true
    }

    pub fn disassociate(&self, key: u64) -> bool {
        self.associations.lock().remove(&key).is_some()
    }

    /// Interpreter the thread is currently bound to.
    pub fn interpreter_for_thread(&self, thread_id: u64) -> Option<Arc<Interpreter>> {
        self.associations
            .lock()
            .values()
            .find(|a| a.thread_id == thread_id)
            .map(|a| Arc::clone(&a.interpreter))
    }

    pub fn len(&self) -> usize {
        self.associations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.lock().is_empty()
    }

    /// Remove every association with `interpreter`. Returns the number removed.
    pub fn cleanup_interpreter(&self, interpreter: &Interpreter) -> usize {
        let id = interpreter.id();
        // Dropped after the lock is released.
        let removed: Vec<Association>;
        {
            let mut associations = self.associations.lock();
            let keys: Vec<u64> = associations
                .iter()
                .filter(|(_, a)| a.interpreter.id() == id)
                .map(|(key, _)| *key)
                .collect();
            removed = keys.iter().filter_map(|key| associations.remove(key)).collect();
        }
        removed.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BindingStats {
        BindingStats {
            created: self.created.load(Ordering::Relaxed),
            active: self.active_count(),
            associations: self.len(),
        }
    }
}

impl fmt::Debug for ThreadBindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBindingRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

thread_local! {
    static ACTIVE_INTERPRETERS: RefCell<Vec<Arc<Interpreter>>> = const { RefCell::new(Vec::new()) };
}

pub fn push_active_interpreter(interpreter: Arc<Interpreter>) {
    ACTIVE_INTERPRETERS.with(|stack| stack.borrow_mut().push(interpreter));
}

pub fn pop_active_interpreter() -> Option<Arc<Interpreter>> {
    ACTIVE_INTERPRETERS.with(|stack| stack.borrow_mut().pop())
}

/// Innermost interpreter pushed on the calling thread.
pub fn active_interpreter() -> Option<Arc<Interpreter>> {
    ACTIVE_INTERPRETERS.with(|stack| stack.borrow().last().cloned())
}

pub fn active_interpreter_depth() -> usize {
    ACTIVE_INTERPRETERS.with(|stack| stack.borrow().len())
}

/// A start routine bound to an interpreter.
pub struct ThreadBinding {
    key: u64,
    interpreter: Arc<Interpreter>,
    registry: Arc<ThreadBindingRegistry>,
    routine: Mutex<Option<StartRoutine>>,
    use_active_stack: bool,
    /// 0 while no thread owns the binding
    thread_id: AtomicU64,
}

impl ThreadBinding {
    pub fn create(interpreter: Arc<Interpreter>, routine: StartRoutine, use_active_stack: bool) -> Arc<Self> {
        let registry = Arc::clone(interpreter.registry());
        let key = registry.next_key();
        tracing::trace!(binding = key, interpreter = interpreter.id(), "thread binding created");
        Arc::new(Self {
            key,
            interpreter,
            registry,
            routine: Mutex::new(Some(routine)),
            use_active_stack,
            thread_id: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interpreter
    }

    /// Thread currently running the binding.
    pub fn thread_id(&self) -> Option<u64> {
        match self.thread_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn setup_id(&self, thread_id: u64) -> bool {
        match self
            .thread_id
            .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(existing) if existing == thread_id => true,
            Err(existing) => {
                tracing::error!(
                    binding = self.key,
                    thread_id,
                    active_thread_id = existing,
                    "thread binding already owned by another thread"
                );
                false
            }
        }
    }

    fn unsetup_id(&self, thread_id: u64) -> bool {
        self.thread_id
            .compare_exchange(thread_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn contain_panic(&self, payload: Box<dyn Any + Send>) {
        if payload.is::<ThreadAbort>() {
            tracing::warn!(binding = self.key, "thread aborted");
            self.interpreter.reset_cancel(CancelFlags::empty());
        } else if payload.is::<ThreadInterrupt>() {
            tracing::warn!(binding = self.key, "thread interrupted");
        } else {
            tracing::error!(
                binding = self.key,
                panic = %panic_message(payload.as_ref()),
                "thread start routine panicked"
            );
        }
    }

    /// Thread entry: bind, run the start routine, unbind.
    ///
    /// Call on the thread that should run the routine; [`spawn`](Self::spawn)
    /// does this for a fresh thread. A binding's routine runs at most once.
    pub fn run(&self, arg: Option<ThreadArg>) {
        let thread_id = current_thread_id();
        self.registry.active.fetch_add(1, Ordering::AcqRel);
        defer! {
            self.registry.active.fetch_sub(1, Ordering::AcqRel);
        }

        // A refused binding leaves the calling thread's state alone.
        if !self.setup_id(thread_id) {
            return;
        }
        defer! {
            thread_variable::cleanup_for_thread(&self.interpreter, thread_id, false);
            self.interpreter.maybe_dispose_thread();
        }
        defer! {
            self.unsetup_id(thread_id);
        }

        let associated = self.registry.associate(self.key, thread_id, &self.interpreter);
        if !associated {
            tracing::warn!(binding = self.key, thread_id, "thread association refused");
        }
        defer! {
            if associated {
                self.registry.disassociate(self.key);
            }
        }

        if self.use_active_stack {
            push_active_interpreter(Arc::clone(&self.interpreter));
        }
        defer! {
            if self.use_active_stack {
                pop_active_interpreter();
            }
        }

        let Some(routine) = self.routine.lock().take() else {
            tracing::error!(binding = self.key, "no delegate available");
            return;
        };
        tracing::trace!(binding = self.key, thread_id, "thread start routine entered");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| routine.invoke(arg))) {
            self.contain_panic(payload);
        }
    }

    /// Run the binding on a new OS thread.
    pub fn spawn(self: &Arc<Self>, name: Option<String>, arg: Option<ThreadArg>) -> EngineResult<JoinHandle<()>> {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let binding = Arc::clone(self);
        Ok(builder.spawn(move || binding.run(arg))?)
    }
}

impl fmt::Debug for ThreadBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBinding")
            .field("key", &self.key)
            .field("interpreter", &self.interpreter.id())
            .field("thread_id", &self.thread_id())
            .field("use_active_stack", &self.use_active_stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::VariableFlags;
    use crate::thread_variable::ThreadVariable;

    #[test]
    fn test_association_is_unique_per_thread() {
        let interp = Interpreter::new();
        let registry = ThreadBindingRegistry::new();
        assert!(registry.associate(1, 10, &interp));
        assert!(!registry.associate(1, 11, &interp));
        assert!(!registry.associate(2, 10, &interp));
        assert!(registry.associate(2, 11, &interp));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.interpreter_for_thread(11).map(|i| i.id()), Some(interp.id()));

        assert!(registry.disassociate(1));
        assert!(!registry.disassociate(1));
        assert_eq!(registry.cleanup_interpreter(&interp), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_run_binds_and_unbinds() {
        let interp = Interpreter::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let probe = Arc::clone(&interp);
        let binding = ThreadBinding::create(
            Arc::clone(&interp),
            StartRoutine::parameterized(move |arg| {
                let value = arg.and_then(|a| a.downcast::<u32>().ok()).map(|v| *v);
                let bound = probe.registry().interpreter_for_thread(current_thread_id()).is_some();
                let active = active_interpreter().map(|i| i.id());
                *sink.lock() = Some((value, bound, active, probe.registry().active_count()));
            }),
            true,
        );

        binding.spawn(Some("bound".into()), Some(Box::new(7u32))).unwrap().join().unwrap();

        assert_eq!(*seen.lock(), Some((Some(7), true, Some(interp.id()), 1)));
        assert_eq!(binding.thread_id(), None);
        let stats = interp.registry().stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.associations, 0);
        assert!(stats.created >= 1);
        assert_eq!(active_interpreter_depth(), 0);
    }

    #[test]
    fn test_panic_is_contained_and_teardown_runs() {
        let interp = Interpreter::new();
        let tv = ThreadVariable::add_variable(&interp, VariableFlags::empty(), "tv").unwrap();
        let probe = Arc::clone(&interp);
        let binding = ThreadBinding::create(
            Arc::clone(&interp),
            StartRoutine::plain(move || {
                probe.set_variable("tv", None, "mine", VariableFlags::empty()).unwrap();
                panic!("boom");
            }),
            false,
        );

        // The panic never reaches the join handle.
        binding.spawn(None, None).unwrap().join().unwrap();
        assert_eq!(tv.thread_count(), 0);
        assert!(interp.registry().is_empty());
        assert_eq!(interp.registry().active_count(), 0);
    }

    /// Run `finish` on a bound thread whose context is canceled and left
    /// busy, so it survives teardown. Returns the context afterwards.
    fn canceled_busy_thread(finish: fn()) -> (Arc<Interpreter>, crate::context::ContextRef) {
        let interp = Interpreter::new();
        let probe = Arc::clone(&interp);
        let worker = Arc::new(AtomicU64::new(0));
        let worker_id = Arc::clone(&worker);
        let binding = ThreadBinding::create(
            Arc::clone(&interp),
            StartRoutine::plain(move || {
                worker_id.store(current_thread_id(), Ordering::SeqCst);
                let context = probe.context();
                let mut context = context.lock();
                context.begin_external_execution();
                context.cancel_evaluate(None, false, false);
                drop(context);
                finish();
            }),
            false,
        );
        binding.spawn(None, None).unwrap().join().unwrap();
        let context = interp
            .existing_context(worker.load(Ordering::SeqCst))
            .unwrap();
        (interp, context)
    }

    #[test]
    fn test_abort_resets_cancel() {
        let (interp, context) = canceled_busy_thread(|| abort_thread());
        assert!(!context.lock().is_canceled());
        assert!(interp.registry().is_empty());
    }

    #[test]
    fn test_plain_panic_keeps_cancel() {
        let (_interp, context) = canceled_busy_thread(|| panic!("boom"));
        assert!(context.lock().is_canceled());
    }

    #[test]
    fn test_refused_binding_leaves_caller_state() {
        let interp = Interpreter::new();
        let tv = ThreadVariable::add_variable(&interp, VariableFlags::empty(), "tv").unwrap();
        interp.set_variable("tv", None, "caller", VariableFlags::empty()).unwrap();
        interp.context();

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let binding = ThreadBinding::create(
            Arc::clone(&interp),
            StartRoutine::plain(move || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }),
            false,
        );
        let owner = binding.spawn(None, None).unwrap();
        entered_rx.recv().unwrap();

        // The binding belongs to the spawned thread; running it here is refused.
        binding.run(None);
        assert_eq!(interp.get_variable("tv", None, VariableFlags::empty()).unwrap(), "caller");
        assert!(interp.existing_context(current_thread_id()).is_some());

        release_tx.send(()).unwrap();
        owner.join().unwrap();
        assert_eq!(tv.thread_count(), 1);
    }

    #[test]
    fn test_routine_runs_once() {
        let interp = Interpreter::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let binding = ThreadBinding::create(
            Arc::clone(&interp),
            StartRoutine::plain(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );
        binding.run(None);
        binding.run(None);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(binding.thread_id(), None);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(ThreadAbort);
        assert_eq!(panic_message(payload.as_ref()), "thread aborted");
    }
}
