//! Wait command - run one cooperative wait and print what it did.

use anyhow::Result;
use clap::Args;
use heron_engine::{CancelFlags, EngineConfig, Interpreter, Signal, WaitFlags, WaitRequest, wait};
use std::sync::Arc;
use std::time::Duration;

#[derive(Args)]
pub struct WaitCommand {
    /// Wait duration in microseconds (configured default when omitted)
    pub micros: Option<u64>,

    /// Bound each readiness check by this many microseconds
    #[arg(long, value_name = "MICROS")]
    pub ready_timeout: Option<u64>,

    /// Do not pump host messages on a zero-length wait
    #[arg(long)]
    pub strict: bool,

    /// Ignore cancellation of the calling thread
    #[arg(long)]
    pub no_cancel: bool,

    /// Ignore interpreter-wide cancellation
    #[arg(long)]
    pub no_global_cancel: bool,

    /// Set the wake-up signal after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub signal_after: Option<u64>,

    /// Cancel the interpreter after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub cancel_after: Option<u64>,
}

impl WaitCommand {
    fn flags(&self) -> WaitFlags {
        let mut flags = WaitFlags::empty();
        flags.set(WaitFlags::TIMEOUT, self.ready_timeout.is_some());
        flags.set(WaitFlags::STRICT, self.strict);
        flags.set(WaitFlags::NO_CANCEL, self.no_cancel);
        flags.set(WaitFlags::NO_GLOBAL_CANCEL, self.no_global_cancel);
        flags
    }

    pub fn run(&self, config: EngineConfig) -> Result<()> {
        let interp = Interpreter::builder().config(config).build();
        let mut request = WaitRequest {
            wait_micros: self.micros,
            ready_micros: self.ready_timeout,
            flags: self.flags(),
            ..WaitRequest::default()
        };

        let mut helpers = Vec::new();
        if let Some(ms) = self.signal_after {
            let signal = Signal::new();
            request = request.with_signal(Arc::clone(&signal));
            helpers.push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                signal.set();
            }));
        }
        if let Some(ms) = self.cancel_after {
            let target = Arc::clone(&interp);
            helpers.push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                target.cancel_evaluate(None, CancelFlags::GLOBAL);
            }));
        }

        let outcome = wait(&interp, &request);
        for helper in helpers {
            if helper.join().is_err() {
                tracing::warn!("wait helper thread panicked");
            }
        }

        match outcome {
            Ok(report) => {
                println!("completed after {:?}", report.elapsed);
                println!("  iterations:  {}", report.iterations);
                println!("  slept:       {} ms", report.slept_ms);
                println!("  wait slice:  {} ms", report.wait_slice_ms);
                println!("  ready slice: {} ms", report.ready_slice_ms);
                println!("  slop:        {} us", report.slop_us);
                Ok(())
            }
            Err(e) if e.is_signaled() || e.is_canceled() || e.is_timed_out() => {
                println!("ended early: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
