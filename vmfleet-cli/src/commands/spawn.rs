use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Args;
use vmfleet::auth::AuthMode;
use vmfleet::fleet::{DEFAULT_FIRMWARE, Fleet, FleetOptions, FleetSummary, FleetTools};
use vmfleet::layout::dirs;
use vmfleet::request::{FleetRequest, Resources};
use vmfleet::util::{init_logging, init_stderr_logging};
use vmfleet::vmm::{Accelerator, LaunchMode, NetBackend, QemuLauncher, TerminalKind};
use vmfleet::{InstanceStatus, allocate};
use vmfleet_shared::errors::FleetError;

use super::plain_table;

#[derive(Args, Debug)]
pub struct SpawnArgs {
    /// Number of instances
    #[arg(short = 'n', long, default_value_t = 3, allow_negative_numbers = true)]
    pub count: i64,

    /// Address of the first instance; the rest follow consecutively
    #[arg(long, default_value = "10.193.80.101")]
    pub start_ip: Ipv4Addr,

    /// Default gateway (default: first host of the start address's subnet)
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,

    /// Subnet prefix length
    #[arg(long, default_value_t = 24)]
    pub prefix: u8,

    /// Extra name servers, after the gateway
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<Ipv4Addr>,

    /// Instance names are <prefix>-<index>
    #[arg(long, default_value = "overlay")]
    pub name_prefix: String,

    /// Host interface the instances are bridged onto
    #[arg(long, default_value = "en1")]
    pub bridge: String,

    /// Virtual CPUs per instance
    #[arg(long, env = "VMFLEET_SMP", default_value_t = 4)]
    pub smp: u32,

    /// Memory per instance in MiB
    #[arg(long, env = "VMFLEET_MEM_MB", default_value_t = 4096)]
    pub mem: u32,

    /// Golden image (relative to the workdir)
    #[arg(long, env = "VMFLEET_BASE_IMAGE", default_value = dirs::BASE_IMAGE)]
    pub base_image: PathBuf,

    /// Firmware variable-store template (relative to the workdir)
    #[arg(long, default_value = dirs::VARS_TEMPLATE)]
    pub vars: PathBuf,

    /// Firmware code blob
    #[arg(long, env = "VMFLEET_BIOS", default_value = DEFAULT_FIRMWARE)]
    pub bios: PathBuf,

    /// QEMU system emulator
    #[arg(long, default_value = QemuLauncher::DEFAULT_BINARY)]
    pub qemu: String,

    /// vmnet-bridged (macOS) or bridge (Linux); follows the host by default
    #[arg(long)]
    pub net_backend: Option<NetBackend>,

    /// Open a console window per instance: terminal, xterm, gnome-terminal, tmux
    #[arg(long, env = "VMFLEET_TERMINAL")]
    pub terminal: Option<TerminalKind>,

    /// Instances provisioned concurrently
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,

    /// Run engines as detached children instead of daemonizing them
    #[arg(long)]
    pub no_daemonize: bool,

    /// Never elevate with sudo
    #[arg(long)]
    pub no_sudo: bool,

    /// Print what would be done without doing it
    #[arg(long)]
    pub dry_run: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

impl SpawnArgs {
    fn request(&self) -> FleetRequest {
        let mut request = FleetRequest::new(self.count, self.start_ip)
            .with_prefix_len(self.prefix)
            .with_name_servers(self.dns.iter().copied())
            .with_name_prefix(&self.name_prefix)
            .with_bridge(&self.bridge)
            .with_resources(Resources {
                vcpus: self.smp,
                memory_mib: self.mem,
            });
        if let Some(gateway) = self.gateway {
            request = request.with_gateway(gateway);
        }
        request
    }

    fn options(&self, global: &crate::cli::GlobalFlags) -> FleetOptions {
        FleetOptions {
            workdir: global.workdir.clone(),
            base_image: self.base_image.clone(),
            vars_template: self.vars.clone(),
            firmware: self.bios.clone(),
            qemu_binary: self.qemu.clone(),
            net_backend: self.net_backend.unwrap_or_else(NetBackend::host_default),
            accel: Accelerator::host_default(),
            launch_mode: if self.no_daemonize {
                LaunchMode::Foreground
            } else {
                LaunchMode::Daemonized
            },
            auth: if self.no_sudo {
                AuthMode::Unprivileged
            } else {
                AuthMode::Auto
            },
            terminal: self.terminal,
            jobs: self.jobs.max(1),
            ..Default::default()
        }
    }
}

pub async fn execute(args: SpawnArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let request = args.request();
    let options = args.options(global);

    if args.dry_run {
        init_stderr_logging(global.verbose);
        let launcher = QemuLauncher::new(&options.qemu_binary);
        let plan = Fleet::plan(&options, &request, &launcher)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            print!("{plan}");
        }
        return Ok(());
    }

    // Request problems are reported before the host is touched
    request.validate()?;
    allocate(&request).map_err(FleetError::from)?;

    let _guard = init_logging(&global.layout().logs_dir(), global.verbose)?;
    let fleet = Fleet::preflight(options, FleetTools::locate).await?;
    let summary = fleet.spawn(&request).await?;
    tracing::debug!(workdir = %global.workdir.display(), "Spawn complete");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary.rows())?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &FleetSummary) {
    let mut table = plain_table(&["NAME", "IP", "MAC", "STATUS", "DETAIL"]);
    for inst in summary.instances() {
        let detail = match &inst.status {
            InstanceStatus::Running { pid } => format!("pid {pid}"),
            InstanceStatus::Starting => "pid unknown".to_string(),
            InstanceStatus::Exited { .. } => match inst.process.and_then(|p| p.pid) {
                Some(pid) => format!("pid {pid} exited during startup"),
                None => "exited during startup".to_string(),
            },
            InstanceStatus::Failed { reason, .. } => reason.clone(),
        };
        table.add_row(vec![
            inst.name().to_string(),
            inst.identity.ip.to_string(),
            vmfleet::net::mac_string(&inst.identity.mac),
            inst.status.label(),
            detail,
        ]);
    }
    println!("{table}");
    println!(
        "{} launched, {} exited, {} failed",
        summary.launched_count(),
        summary.exited_count(),
        summary.failed_count()
    );
}
