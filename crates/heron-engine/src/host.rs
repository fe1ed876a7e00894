//! Host abstraction: the embedding application's scheduling hooks and
//! diagnostic channel.

use std::fmt;
use std::time::Duration;

use crate::error::EngineResult;

/// Services the embedding application provides to the engine.
pub trait Host: Send + Sync + fmt::Debug {
    /// Give other threads a chance to run.
    fn yield_now(&self) -> EngineResult<()>;

    /// Block the calling thread for `millis` milliseconds.
    fn sleep(&self, millis: u64) -> EngineResult<()>;

    /// Drain the platform message queue, if the host has one.
    ///
    /// Returns `None` when there is no message pump.
    fn pump_messages(&self) -> Option<EngineResult<()>> {
        None
    }

    /// Write an unhandled-error report to the host's diagnostic channel.
    fn write_diagnostic(&self, text: &str);
}

/// Default host: OS scheduling and standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHost;

impl Host for StdHost {
    fn yield_now(&self) -> EngineResult<()> {
        std::thread::yield_now();
        Ok(())
    }

    fn sleep(&self, millis: u64) -> EngineResult<()> {
        std::thread::sleep(Duration::from_millis(millis));
        Ok(())
    }

    fn write_diagnostic(&self, text: &str) {
        tracing::error!(target: "heron::diagnostic", "{}", text);
        eprintln!("{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_host_has_no_pump() {
        let host = StdHost;
        assert!(host.pump_messages().is_none());
        assert!(host.yield_now().is_ok());
        assert!(host.sleep(0).is_ok());
    }
}
