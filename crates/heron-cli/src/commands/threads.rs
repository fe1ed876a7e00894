//! Threads command - run bound threads that share one thread variable.

use anyhow::Result;
use clap::Args;
use heron_engine::{EngineConfig, Interpreter, StartRoutine, ThreadBinding, ThreadVariable, VariableFlags};
use std::sync::{Arc, Barrier};

#[derive(Args)]
pub struct ThreadsCommand {
    /// Number of bound threads
    #[arg(long, short = 'n', default_value_t = 4)]
    pub count: usize,

    /// Store an array per thread instead of a scalar
    #[arg(long)]
    pub array: bool,

    /// List array contents instead of element counts
    #[arg(long)]
    pub full: bool,
}

impl ThreadsCommand {
    pub fn run(&self, config: EngineConfig) -> Result<()> {
        let interp = Interpreter::builder().config(config).build();
        let variable = ThreadVariable::add_variable(&interp, VariableFlags::empty(), "worker")?;

        // Workers park after storing their value so the listing sees all of them.
        let stored = Arc::new(Barrier::new(self.count + 1));
        let release = Arc::new(Barrier::new(self.count + 1));
        let mut handles = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let worker = Arc::clone(&interp);
            let stored = Arc::clone(&stored);
            let release = Arc::clone(&release);
            let array = self.array;
            let binding = ThreadBinding::create(
                Arc::clone(&interp),
                StartRoutine::plain(move || {
                    let outcome = if array {
                        worker
                            .set_variable("worker", Some("index"), &i.to_string(), VariableFlags::empty())
                            .and_then(|_| {
                                worker.set_variable("worker", Some("name"), &format!("worker-{}", i), VariableFlags::empty())
                            })
                    } else {
                        worker.set_variable("worker", None, &format!("worker-{}", i), VariableFlags::empty())
                    };
                    if let Err(e) = outcome {
                        tracing::error!(error = %e, "failed to set thread variable");
                    }
                    stored.wait();
                    release.wait();
                }),
                true,
            );
            handles.push(binding.spawn(Some(format!("heron-worker-{}", i)), None)?);
        }

        stored.wait();
        if self.full {
            println!("{:#}", variable);
        } else {
            println!("{}", variable);
        }
        let stats = interp.registry().stats();
        println!(
            "bindings: {} created, {} active, {} associated",
            stats.created, stats.active, stats.associations
        );
        release.wait();

        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("bound thread panicked");
            }
        }
        println!("values left after exit: {}", variable.thread_count());
        interp.dispose()?;
        Ok(())
    }
}
