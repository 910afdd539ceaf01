mod cli;
mod commands;

use clap::Parser;
use vmfleet_shared::errors::FleetError;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Spawn(args) => commands::spawn::execute(args, &cli.global).await,
        Commands::Status(args) => commands::status::execute(args, &cli.global).await,
        Commands::Reset(args) => commands::reset::execute(args, &cli.global).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Exit status for a failed command.
///
/// Host and request problems get distinct codes so scripts can tell them
/// apart from everything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FleetError>() {
        Some(FleetError::Precondition(_)) => 2,
        Some(FleetError::Allocation(_)) => 3,
        Some(FleetError::Config(_)) => 4,
        _ => 1,
    }
}
