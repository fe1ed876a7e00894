//! External signals and event processing.
//!
//! [`Signal`] is the manual-reset event a cooperative wait can watch.
//! [`EventManager`] is the event-loop capability an interpreter consults;
//! [`EventQueue`] is the default, channel-backed implementation. Events that
//! fail with no other receiver are routed to the background error
//! dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::bgerror::{BackgroundErrorState, dispatch_background_error};
use crate::error::{EngineError, EngineResult};
use crate::interpreter::Interpreter;
use crate::result::ReturnCode;

/// A manual-reset event: once set it stays set until reset.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until set or `timeout` elapses. Returns whether the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}

/// Event-loop capability of an interpreter.
pub trait EventManager: Send + Sync {
    /// Process up to `limit` pending events (all when `None`). Returns the
    /// number processed.
    fn process_events(&self, interpreter: &Interpreter, limit: Option<usize>) -> EngineResult<usize>;

    /// Process one pending event. Returns whether one was processed.
    fn do_one_event(&self, interpreter: &Interpreter) -> EngineResult<bool>;

    /// Sleep on behalf of the event loop.
    fn sleep(&self, millis: u64) -> EngineResult<()>;

    /// Disable event processing. Returns the previous enabled state.
    fn save_enabled_and_force_disabled(&self) -> bool;

    /// Restore a state returned by
    /// [`save_enabled_and_force_disabled`](Self::save_enabled_and_force_disabled).
    fn restore_enabled(&self, saved: bool);
}

/// A queued script event: a command and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub id: u64,
    pub arguments: Vec<String>,
}

/// Channel-backed event queue.
///
/// Any thread may queue events through a [`Sender`]; events run on the thread
/// that processes them, inside an external-execution bracket.
#[derive(Debug)]
pub struct EventQueue {
    sender: Sender<QueuedEvent>,
    receiver: Receiver<QueuedEvent>,
    enabled: AtomicBool,
    next_id: AtomicU64,
    /// Lower bound for event-loop sleeps
    min_sleep_ms: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_min_sleep(0)
    }

    pub fn with_min_sleep(min_sleep_ms: u64) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            enabled: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            min_sleep_ms,
        }
    }

    /// Queue a command for later execution. Returns the event id.
    pub fn queue(&self, arguments: Vec<String>) -> EngineResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(QueuedEvent { id, arguments })
            .map_err(|e| EngineError::Event(format!("failed to queue event: {}", e)))?;
        Ok(id)
    }

    /// Handle for queueing from other threads.
    pub fn sender(&self) -> Sender<QueuedEvent> {
        self.sender.clone()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn next_event(&self) -> EngineResult<Option<QueuedEvent>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(EngineError::Event("event queue disconnected".to_string())),
        }
    }

    /// Run one event. Returns whether further errors in this pass should
    /// still go to the background error handler.
    fn run_event(&self, interpreter: &Interpreter, event: &QueuedEvent, report_errors: bool) -> bool {
        match interpreter.invoke_external(&event.arguments) {
            Ok(_) => report_errors,
            Err(exception) if exception.code == ReturnCode::Error => {
                tracing::debug!(event = event.id, error = %exception, "event failed");
                if !report_errors {
                    return false;
                }
                let state = dispatch_background_error(Some(interpreter), exception.code, &exception.value);
                state != BackgroundErrorState::Suppressed
            }
            Err(exception) => {
                tracing::trace!(event = event.id, code = %exception.code, "event completed");
                report_errors
            }
        }
    }
}

impl EventManager for EventQueue {
    fn process_events(&self, interpreter: &Interpreter, limit: Option<usize>) -> EngineResult<usize> {
        let mut processed = 0;
        // A handler returning break silences further reports until the next pass.
        let mut report_errors = true;
        while limit.is_none_or(|limit| processed < limit) {
            let Some(event) = self.next_event()? else {
                break;
            };
            report_errors = self.run_event(interpreter, &event, report_errors);
            processed += 1;
        }
        Ok(processed)
    }

    fn do_one_event(&self, interpreter: &Interpreter) -> EngineResult<bool> {
        match self.next_event()? {
            Some(event) => {
                self.run_event(interpreter, &event, true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn sleep(&self, millis: u64) -> EngineResult<()> {
        std::thread::sleep(Duration::from_millis(millis.max(self.min_sleep_ms)));
        Ok(())
    }

    fn save_enabled_and_force_disabled(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    fn restore_enabled(&self, saved: bool) {
        self.enabled.store(saved, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_set_and_reset() {
        let signal = Signal::new();
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        signal.set();
        assert!(signal.is_set());
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        signal.reset();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Signal::new();
        let setter = Arc::clone(&signal);
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_queue_runs_events_in_order() {
        let interp = Interpreter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        interp.add_fn_command("record", move |_, args| {
            sink.lock().push(args[1].clone());
            Ok(String::new())
        });

        let queue = EventQueue::new();
        queue.queue(vec!["record".into(), "a".into()]).unwrap();
        queue.queue(vec!["record".into(), "b".into()]).unwrap();
        queue.queue(vec!["record".into(), "c".into()]).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.process_events(&interp, Some(2)).unwrap(), 2);
        assert!(queue.do_one_event(&interp).unwrap());
        assert!(!queue.do_one_event(&interp).unwrap());
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_disabled_queue_processes_nothing() {
        let interp = Interpreter::new();
        let queue = EventQueue::new();
        queue.queue(vec!["missing".into()]).unwrap();

        let saved = queue.save_enabled_and_force_disabled();
        assert!(saved);
        assert_eq!(queue.process_events(&interp, None).unwrap(), 0);
        queue.restore_enabled(saved);
        assert!(queue.is_enabled());
        assert_eq!(queue.len(), 1);
    }
}
