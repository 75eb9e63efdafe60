//! Subcommand dispatch and execution.
//!
//! [`dispatch`] routes the parsed CLI to [`run`], [`validate`] or
//! [`health`]. Each handler lives in its own submodule.

pub mod health;
pub mod run;
pub mod validate;

use crate::cli::{Cli, Commands};
use crate::error::WatchtowerError;

pub async fn dispatch(cli: Cli) -> Result<(), WatchtowerError> {
    match cli.command {
        Some(Commands::Run(args)) => run::execute(*args).await,
        Some(Commands::Validate(ref args)) => validate::execute(args),
        Some(Commands::Health(args)) => health::execute(args).await,
        None => {
            print_welcome();
            Ok(())
        }
    }
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        "\n  watchtower v{version}: authenticating observability gateway\n\n  \
         No command provided. To get started:\n\n    \
         watchtower run                          Start (auto-detects ./watchtower.yaml)\n    \
         watchtower run --profile metrics        Enable only the metrics module\n    \
         watchtower validate watchtower.yaml     Check a config file\n    \
         watchtower --help                       See all commands and options\n"
    );
}
