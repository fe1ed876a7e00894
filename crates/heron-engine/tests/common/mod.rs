//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use heron_engine::{EngineError, EngineResult, Host, Interpreter};
use parking_lot::Mutex;

/// Host that counts scheduling calls and keeps diagnostic reports.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub yields: AtomicUsize,
    pub sleeps: AtomicUsize,
    pub pumps: AtomicUsize,
    pub fail_sleep: bool,
    pub diagnostics: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_sleep() -> Arc<Self> {
        Arc::new(Self {
            fail_sleep: true,
            ..Self::default()
        })
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn pumps(&self) -> usize {
        self.pumps.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }
}

impl Host for RecordingHost {
    fn yield_now(&self) -> EngineResult<()> {
        self.yields.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        Ok(())
    }

    fn sleep(&self, millis: u64) -> EngineResult<()> {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        if self.fail_sleep {
            return Err(EngineError::host("sleep interrupted"));
        }
        std::thread::sleep(Duration::from_millis(millis));
        Ok(())
    }

    fn pump_messages(&self) -> Option<EngineResult<()>> {
        self.pumps.fetch_add(1, Ordering::SeqCst);
        Some(Ok(()))
    }

    fn write_diagnostic(&self, text: &str) {
        self.diagnostics.lock().push(text.to_string());
    }
}

/// Interpreter wired to a recording host.
pub fn interpreter_with_host() -> (Arc<Interpreter>, Arc<RecordingHost>) {
    let host = RecordingHost::new();
    let interp = Interpreter::builder()
        .host(Arc::clone(&host) as Arc<dyn Host>)
        .build();
    (interp, host)
}

pub fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}
