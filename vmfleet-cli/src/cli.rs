use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vmfleet::FleetLayout;

use crate::commands::{reset::ResetArgs, spawn::SpawnArgs, status::StatusArgs};

/// Provision fleets of copy-on-write QEMU instances from one golden image
#[derive(Parser, Debug)]
#[command(name = "vmfleet", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Directory holding base/, overlays/, seeds/ and run/
    #[arg(long, global = true, env = "VMFLEET_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalFlags {
    pub fn layout(&self) -> FleetLayout {
        FleetLayout::new(&self.workdir)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, configure and launch a fleet of instances
    Spawn(SpawnArgs),

    /// Show which instances of the last spawn are still running
    Status(StatusArgs),

    /// Delete every artifact of the given instance indices
    Reset(ResetArgs),
}
