//! Bgerror command - push an error through background error dispatch.

use anyhow::Result;
use clap::Args;
use heron_engine::{
    EngineConfig, Exception, Interpreter, InterpreterFlags, ReturnCode, dispatch_background_error,
};

#[derive(Args)]
pub struct BgErrorCommand {
    /// Error message to dispatch
    pub message: String,

    /// Handler command name (configured handler when omitted)
    #[arg(long)]
    pub handler: Option<String>,

    /// Do not register the handler command
    #[arg(long)]
    pub unregistered: bool,

    /// Make the handler fail with this message
    #[arg(long, value_name = "MESSAGE")]
    pub fail_with: Option<String>,

    /// Make the handler return break
    #[arg(long, conflicts_with = "fail_with")]
    pub suppress: bool,

    /// Do not report missing or failing handlers
    #[arg(long)]
    pub ignore_failures: bool,
}

impl BgErrorCommand {
    pub fn run(&self, config: EngineConfig) -> Result<()> {
        let interp = Interpreter::builder().config(config).build();
        if self.handler.is_some() {
            interp.set_background_error_handler(self.handler.clone());
        }
        if self.ignore_failures {
            interp.set_flags(InterpreterFlags::IGNORE_BG_ERROR_FAILURE, true);
        }

        if let Some(name) = interp.background_error_handler()
            && !self.unregistered
        {
            let fail_with = self.fail_with.clone();
            let suppress = self.suppress;
            interp.add_fn_command(name, move |_, args| {
                if suppress {
                    return Err(Exception::break_());
                }
                if let Some(message) = &fail_with {
                    return Err(Exception::error(message.clone()));
                }
                println!("handled: {}", args.get(1).map(String::as_str).unwrap_or(""));
                Ok(String::new())
            });
        }

        let state = dispatch_background_error(Some(&interp), ReturnCode::Error, &self.message);
        println!("dispatch: {:?}", state);
        interp.dispose()?;
        Ok(())
    }
}
