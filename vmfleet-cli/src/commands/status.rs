use clap::Args;
use vmfleet::fleet::fleet_status;

use super::plain_table;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: StatusArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let entries = fleet_status(&global.layout())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut table = plain_table(&["NAME", "IP", "PID", "STATUS", "ALIVE"]);
    for entry in &entries {
        table.add_row(vec![
            entry.row.name.clone(),
            entry.row.ip.to_string(),
            entry
                .row
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.row.status.clone(),
            if entry.alive { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
