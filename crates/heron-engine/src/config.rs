//! Engine configuration.
//!
//! Every section has defaults, so an empty file (or no file) yields the
//! stock configuration. The wait timing values are tunable parameters with
//! no derivation beyond long use; they are kept here rather than baked into
//! the wait loop.

use std::path::Path;

use serde::Deserialize;

use crate::context::LevelKind;
use crate::error::{EngineError, EngineResult};
use crate::flags::InterpreterFlags;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cooperative wait tuning
    pub wait: WaitConfig,
    /// Background error dispatch policy
    pub background_error: BackgroundErrorConfig,
    /// Nesting limits
    pub limits: LevelLimits,
    /// Execution bracket policy
    pub execution: ExecutionConfig,
}

/// Timing and admission parameters for cooperative waits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Longest single sleep slice, in milliseconds
    pub max_sleep_slice_ms: u64,
    /// The requested duration is divided by this to get the sleep slice
    pub general_divisor: u64,
    /// Slop is the requested duration divided by this...
    pub slop_divisor: u64,
    /// ...capped at this many microseconds
    pub slop_floor_us: u64,
    /// Waits overshooting by more than this are logged as warnings
    pub trace_threshold_us: u64,
    /// Concurrently blocked waiters allowed per interpreter
    pub max_concurrent_waits: usize,
    pub dispose_sleep_min_ms: u64,
    pub dispose_sleep_divisor: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            max_sleep_slice_ms: 50,
            general_divisor: 2,
            slop_divisor: 40,
            slop_floor_us: 25_000,
            trace_threshold_us: 2_000_000,
            max_concurrent_waits: 64,
            dispose_sleep_min_ms: 1,
            dispose_sleep_divisor: 10,
        }
    }
}

impl WaitConfig {
    /// Duration used when a wait does not specify one, in microseconds.
    pub fn default_wait_us(&self) -> u64 {
        self.max_sleep_slice_ms.saturating_mul(1000)
    }

    /// Sleep slice for a requested duration: half of it, capped at the max slice.
    pub fn slice_ms(&self, requested_us: u64) -> u64 {
        let ms = requested_us / 1000 / self.general_divisor.max(1);
        ms.min(self.max_sleep_slice_ms)
    }

    /// Deadline deduction for a requested duration; never exceeds the wait itself.
    pub fn slop_us(&self, requested_us: u64) -> u64 {
        (requested_us / self.slop_divisor.max(1)).min(self.slop_floor_us)
    }

    /// Sleep used while waiting for a disposal to finish.
    pub fn dispose_sleep_ms(&self, ms: u64) -> u64 {
        (ms / self.dispose_sleep_divisor.max(1)).max(self.dispose_sleep_min_ms)
    }
}

/// Background error dispatch policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackgroundErrorConfig {
    /// Command invoked for unhandled background errors
    pub handler: Option<String>,
    /// Suppress reports about missing or failing handlers
    pub ignore_failures: bool,
    /// Reset cancellation state before invoking the handler
    pub reset_cancel: bool,
}

impl Default for BackgroundErrorConfig {
    fn default() -> Self {
        Self {
            handler: Some("bgerror".to_string()),
            ignore_failures: false,
            reset_cancel: false,
        }
    }
}

impl BackgroundErrorConfig {
    pub fn interpreter_flags(&self) -> InterpreterFlags {
        let mut flags = InterpreterFlags::empty();
        if self.ignore_failures {
            flags |= InterpreterFlags::IGNORE_BG_ERROR_FAILURE;
        }
        if self.reset_cancel {
            flags |= InterpreterFlags::BG_ERROR_RESET_CANCEL;
        }
        flags
    }
}

/// Optional nesting limits; `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LevelLimits {
    pub max_levels: Option<usize>,
    pub max_script_levels: Option<usize>,
    pub max_parser_levels: Option<usize>,
    pub max_expression_levels: Option<usize>,
}

impl LevelLimits {
    pub fn limit_for(&self, kind: LevelKind) -> Option<usize> {
        match kind {
            LevelKind::General => self.max_levels,
            LevelKind::Script => self.max_script_levels,
            LevelKind::Parser => self.max_parser_levels,
            LevelKind::Expression => self.max_expression_levels,
            _ => None,
        }
    }
}

/// Execution bracket policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Force native stack checks while externally entered code runs
    pub force_stack_check: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            force_stack_check: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}
