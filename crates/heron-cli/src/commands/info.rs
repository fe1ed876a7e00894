//! Info command - show the effective configuration.

use clap::Args;
use heron_engine::EngineConfig;

#[derive(Args)]
pub struct InfoCommand {}

impl InfoCommand {
    pub fn run(&self, config: &EngineConfig) {
        println!("heron {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("[wait]");
        println!("  max sleep slice:      {} ms", config.wait.max_sleep_slice_ms);
        println!("  general divisor:      {}", config.wait.general_divisor);
        println!("  slop divisor:         {}", config.wait.slop_divisor);
        println!("  slop floor:           {} us", config.wait.slop_floor_us);
        println!("  trace threshold:      {} us", config.wait.trace_threshold_us);
        println!("  max concurrent waits: {}", config.wait.max_concurrent_waits);
        println!("[background_error]");
        println!(
            "  handler:              {}",
            config.background_error.handler.as_deref().unwrap_or("<none>")
        );
        println!("  flags:                {:?}", config.background_error.interpreter_flags());
        println!("[limits]");
        println!("  {:?}", config.limits);
        println!("[execution]");
        println!("  force stack check:    {}", config.execution.force_stack_check);
    }
}
