use clap::Args;
use vmfleet::fleet::{read_instances_file, reset_instance};

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Instance indices to reset (1-based)
    #[arg(required = true)]
    pub indices: Vec<u32>,

    /// Reset even if the instance's engine is still running
    #[arg(short, long)]
    pub force: bool,

    /// Name prefix for indices missing from instances.csv
    #[arg(long, default_value = "overlay")]
    pub name_prefix: String,
}

pub async fn execute(args: ResetArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let instances_file = layout.instances_file();
    let rows = if instances_file.exists() {
        read_instances_file(&instances_file)?
    } else {
        Vec::new()
    };

    let mut errors = Vec::new();
    for index in &args.indices {
        match reset_instance(&layout, &rows, *index, &args.name_prefix, args.force) {
            Ok(outcome) if outcome.removed.is_empty() => {
                println!("{}: nothing to remove", outcome.name);
            }
            Ok(outcome) => {
                for path in &outcome.removed {
                    println!("{}: removed {}", outcome.name, path.display());
                }
            }
            Err(e) => errors.push(format!("{index}: {e}")),
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("{}", errors.join("\n"));
    }

    Ok(())
}
