//! Cooperative waits.
//!
//! A wait is a bounded polling loop standing in for a blocking sleep. Each
//! iteration re-checks interpreter readiness (cancellation, halt, disposal),
//! the optional external [`Signal`] and the elapsed budget, so a cancel or
//! signal is observed within one sleep slice. The slice is half the request,
//! capped at the configured maximum; a small slop is deducted from the
//! deadline so the loop does not overshoot by a whole slice.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scopeguard::defer;

use crate::binding::panic_message;
use crate::error::{EngineError, EngineResult};
use crate::event::Signal;
use crate::flags::WaitFlags;
use crate::interpreter::Interpreter;

/// Parameters of one wait.
#[derive(Debug, Clone, Default)]
pub struct WaitRequest {
    /// External event that ends the wait early
    pub signal: Option<Arc<Signal>>,
    /// Requested duration; `None` uses the configured default
    pub wait_micros: Option<u64>,
    /// Bound for each readiness check when `TIMEOUT` is set; defaults to
    /// the wait duration
    pub ready_micros: Option<u64>,
    pub flags: WaitFlags,
}

impl WaitRequest {
    pub fn new(wait_micros: u64) -> Self {
        Self {
            wait_micros: Some(wait_micros),
            ..Self::default()
        }
    }

    pub fn with_signal(mut self, signal: Arc<Signal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_ready_micros(mut self, ready_micros: u64) -> Self {
        self.ready_micros = Some(ready_micros);
        self
    }

    pub fn with_flags(mut self, flags: WaitFlags) -> Self {
        self.flags = flags;
        self
    }

    fn has(&self, flags: WaitFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// What a completed wait did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitReport {
    pub iterations: usize,
    pub elapsed: Duration,
    /// Sum of the sleep slices taken
    pub slept_ms: u64,
    pub wait_slice_ms: u64,
    pub ready_slice_ms: u64,
    pub slop_us: u64,
    /// Waiters admitted, this one included, when the wait started
    pub wait_count: usize,
}

fn run_callback(callback: impl FnOnce() -> EngineResult<()>) -> EngineResult<()> {
    catch_unwind(AssertUnwindSafe(callback)).unwrap_or_else(|payload| {
        Err(EngineError::Callback(format!(
            "wait callback panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

/// Wait cooperatively on behalf of `interpreter`.
///
/// Returns the wait's report when the requested duration elapsed. Fails
/// with [`EngineError::EventSignaled`] when the signal fired,
/// [`EngineError::WaitLocked`] when admission was refused,
/// [`EngineError::LockTimeout`] when a bounded readiness check timed out,
/// or the readiness or host error that ended the loop.
///
/// The pre-wait callback may veto the wait; the post-wait callback sees the
/// outcome and its error, if any, replaces it.
pub fn wait(interpreter: &Interpreter, request: &WaitRequest) -> EngineResult<WaitReport> {
    if let Some(pre) = interpreter.pre_wait_callback() {
        run_callback(|| pre(interpreter, request))?;
    }

    let outcome = wait_admitted(interpreter, request);

    if let Some(post) = interpreter.post_wait_callback() {
        run_callback(|| post(interpreter, request, &outcome))?;
    }
    outcome
}

fn wait_admitted(interpreter: &Interpreter, request: &WaitRequest) -> EngineResult<WaitReport> {
    let wait_count = interpreter.enter_wait();
    if wait_count == 0 {
        return Err(EngineError::WaitLocked);
    }
    defer! {
        interpreter.exit_wait();
    }

    if request.wait_micros == Some(0) {
        return wait_zero(interpreter, request, wait_count);
    }

    let config = &interpreter.config().wait;
    let host = interpreter.host();
    let wait_us = request.wait_micros.unwrap_or_else(|| config.default_wait_us());
    let ready_us = request.ready_micros.unwrap_or(wait_us);
    let wait_slice_ms = config.slice_ms(wait_us);
    let ready_slice_ms = config.slice_ms(ready_us).min(wait_slice_ms);
    let slop_us = config.slop_us(wait_us);
    let budget = Duration::from_micros(wait_us.saturating_sub(slop_us));
    let ready_timeout = request
        .has(WaitFlags::TIMEOUT)
        .then(|| Duration::from_millis(ready_slice_ms));
    let no_cancel = request.has(WaitFlags::NO_CANCEL);
    let no_global_cancel = request.has(WaitFlags::NO_GLOBAL_CANCEL);
    let slice = Duration::from_millis(wait_slice_ms);

    let mut report = WaitReport {
        wait_slice_ms,
        ready_slice_ms,
        slop_us,
        wait_count,
        ..WaitReport::default()
    };
    let start = Instant::now();

    let outcome = loop {
        if let Err(e) = interpreter.event_ready(ready_timeout, no_cancel, no_global_cancel) {
            break Err(e);
        }
        if start.elapsed() >= budget {
            break Ok(());
        }
        if request.signal.as_ref().is_some_and(|s| s.is_set()) {
            break Err(EngineError::EventSignaled);
        }
        if !request.has(WaitFlags::STRICT)
            && let Some(Err(e)) = host.pump_messages()
        {
            break Err(e);
        }
        match &request.signal {
            Some(signal) => {
                if signal.wait_timeout(slice) {
                    break Err(EngineError::EventSignaled);
                }
            }
            None => {
                if let Err(e) = host.sleep(wait_slice_ms) {
                    break Err(e);
                }
            }
        }
        report.slept_ms += wait_slice_ms;
        report.iterations += 1;
    };

    report.elapsed = start.elapsed();
    let elapsed_us = u64::try_from(report.elapsed.as_micros()).unwrap_or(u64::MAX);
    let overshoot_us = elapsed_us.saturating_sub(wait_us);
    let error = outcome.as_ref().err().map(ToString::to_string);
    if overshoot_us > config.trace_threshold_us {
        tracing::warn!(
            interpreter = interpreter.id(),
            iterations = report.iterations,
            wait_us,
            elapsed_us,
            overshoot_us,
            wait_slice_ms,
            slop_us,
            error = ?error,
            "wait overshot its request"
        );
    } else {
        tracing::debug!(
            interpreter = interpreter.id(),
            iterations = report.iterations,
            wait_us,
            ready_us,
            elapsed_us,
            wait_slice_ms,
            ready_slice_ms,
            slop_us,
            slept_ms = report.slept_ms,
            wait_count,
            error = ?error,
            "wait finished"
        );
    }

    outcome.map(|()| report)
}

/// A zero-length wait: report the signal if already set, otherwise give
/// other threads one chance to run.
fn wait_zero(interpreter: &Interpreter, request: &WaitRequest, wait_count: usize) -> EngineResult<WaitReport> {
    if request.signal.as_ref().is_some_and(|s| s.is_set()) {
        return Err(EngineError::EventSignaled);
    }
    let host = interpreter.host();
    if !request.has(WaitFlags::STRICT)
        && let Some(pumped) = host.pump_messages()
    {
        pumped?;
    }
    host.yield_now()?;
    Ok(WaitReport {
        wait_count,
        ..WaitReport::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_wait_returns_immediately() {
        let interp = Interpreter::new();
        let report = wait(&interp, &WaitRequest::new(0)).unwrap();
        assert_eq!(report.iterations, 0);
        assert_eq!(report.wait_count, 1);
        assert_eq!(interp.wait_count(), 0);
    }

    #[test]
    fn test_zero_wait_reports_set_signal() {
        let interp = Interpreter::new();
        let signal = Signal::new();
        signal.set();
        let err = wait(&interp, &WaitRequest::new(0).with_signal(signal)).unwrap_err();
        assert!(err.is_signaled());
        assert_eq!(err.to_string(), "event was signaled");
    }

    #[test]
    fn test_locked_gate_refuses() {
        let interp = Interpreter::new();
        interp.lock_waits();
        let start = Instant::now();
        let err = wait(&interp, &WaitRequest::new(1_000_000)).unwrap_err();
        assert!(matches!(err, EngineError::WaitLocked));
        assert!(start.elapsed() < Duration::from_millis(500));
        interp.unlock_waits();
        assert!(wait(&interp, &WaitRequest::new(0)).is_ok());
    }

    #[test]
    fn test_short_wait_elapses() {
        let interp = Interpreter::new();
        let start = Instant::now();
        let report = wait(&interp, &WaitRequest::new(20_000)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(report.wait_slice_ms, 10);
        assert_eq!(report.slop_us, 500);
        assert!(report.iterations >= 1);
        assert_eq!(interp.wait_count(), 0);
    }

    #[test]
    fn test_pre_callback_vetoes() {
        let interp = Interpreter::new();
        interp.set_pre_wait_callback(Some(Arc::new(|_: &Interpreter, _: &WaitRequest| {
            Err(EngineError::Callback("not now".into()))
        })));
        let err = wait(&interp, &WaitRequest::new(0)).unwrap_err();
        assert_eq!(err.to_string(), "not now");
        assert_eq!(interp.wait_count(), 0);
    }

    #[test]
    fn test_post_callback_sees_outcome_and_may_replace_it() {
        let interp = Interpreter::new();
        interp.set_post_wait_callback(Some(Arc::new(
            |_: &Interpreter, _: &WaitRequest, outcome: &EngineResult<WaitReport>| match outcome {
                Ok(_) => Err(EngineError::Callback("replaced".into())),
                Err(_) => Ok(()),
            },
        )));
        let err = wait(&interp, &WaitRequest::new(0)).unwrap_err();
        assert_eq!(err.to_string(), "replaced");

        interp.lock_waits();
        let err = wait(&interp, &WaitRequest::new(0)).unwrap_err();
        assert!(matches!(err, EngineError::WaitLocked));
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let interp = Interpreter::new();
        interp.set_pre_wait_callback(Some(Arc::new(
            |_: &Interpreter, _: &WaitRequest| -> EngineResult<()> { panic!("bad callback") },
        )));
        let err = wait(&interp, &WaitRequest::new(0)).unwrap_err();
        assert_eq!(err.to_string(), "wait callback panicked: bad callback");
    }
}
