//! Fleet coordinator.
//!
//! Drives every instance through its pipeline:
//!
//! ```text
//! preflight (fatal) → allocate (fatal) → per instance:
//!     storage → documents → init volume → launch → [console window]
//! ```
//!
//! Preflight and allocation failures abort the run before anything is
//! written. After that, a failing instance is recorded and the others keep
//! going.

pub mod maintenance;
pub mod state;
pub mod summary;

use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use vmfleet_shared::errors::{
    BestEffortError, FleetResult, InstanceError, PreconditionError,
};

use crate::auth::{AuthContext, AuthMode};
use crate::disk::{BaseArtifacts, OverlayManager, OverlayTool, QemuImg, StorageHandle};
use crate::layout::{FleetLayout, InstanceLayout, dirs};
use crate::net::{InstanceIdentity, NetworkSettings, allocate, mac_string};
use crate::request::FleetRequest;
use crate::seed::{
    DocumentBuilder, GuestSettings, InitVolume, IsoTool, Packager, SeedDocuments, VolumeBuilder,
};
use crate::vmm::{
    Accelerator, LaunchMode, LaunchSpec, NetBackend, QemuLauncher, Terminal, TerminalKind,
    TerminalSurface, VmLauncher,
};
pub use maintenance::{ResetOutcome, StatusEntry, fleet_status, reset_instance};
pub use state::{InstanceStage, InstanceStatus, LaunchedInstance};
pub use summary::{FleetSummary, InstanceRow, read_instances_file, write_instances_file};

/// Firmware code blob used when none is configured (Homebrew QEMU on Apple
/// silicon).
pub const DEFAULT_FIRMWARE: &str = "/opt/homebrew/share/qemu/edk2-aarch64-code.fd";

/// Host-side settings of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetOptions {
    pub workdir: PathBuf,
    /// Relative paths are resolved against `workdir`
    pub base_image: PathBuf,
    pub vars_template: PathBuf,
    pub firmware: PathBuf,
    /// Emulator name in `PATH` or a path
    pub qemu_binary: String,
    pub net_backend: NetBackend,
    pub accel: Accelerator,
    pub launch_mode: LaunchMode,
    pub auth: AuthMode,
    /// Console window per instance, daemonized mode only
    #[serde(skip)]
    pub terminal: Option<TerminalKind>,
    /// Pipelines in flight at once
    pub jobs: usize,
    pub guest: GuestSettings,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            base_image: PathBuf::from(dirs::BASE_IMAGE),
            vars_template: PathBuf::from(dirs::VARS_TEMPLATE),
            firmware: PathBuf::from(DEFAULT_FIRMWARE),
            qemu_binary: QemuLauncher::DEFAULT_BINARY.to_string(),
            net_backend: NetBackend::host_default(),
            accel: Accelerator::host_default(),
            launch_mode: LaunchMode::default(),
            auth: AuthMode::default(),
            terminal: None,
            jobs: 1,
            guest: GuestSettings::default(),
        }
    }
}

impl FleetOptions {
    pub fn layout(&self) -> FleetLayout {
        FleetLayout::new(&self.workdir)
    }

    pub fn base_artifacts(&self) -> BaseArtifacts {
        let layout = self.layout();
        BaseArtifacts::new(
            layout.resolve(&self.base_image),
            layout.resolve(&self.vars_template),
        )
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.layout().resolve(&self.firmware)
    }
}

/// External mechanisms the pipelines use.
#[derive(Clone)]
pub struct FleetTools {
    pub overlay: Arc<dyn OverlayTool>,
    /// Init-volume builders in preference order
    pub volumes: Vec<Arc<dyn VolumeBuilder>>,
    pub launcher: Arc<dyn VmLauncher>,
    pub terminal: Option<Arc<dyn TerminalSurface>>,
}

impl FleetTools {
    /// Find every host tool `options` needs.
    pub fn locate(options: &FleetOptions) -> Result<Self, PreconditionError> {
        let overlay = QemuImg::locate()?;
        let volumes = IsoTool::locate_all()?;
        let launcher = QemuLauncher::locate(&options.qemu_binary)?;
        let terminal = options.terminal.map(Terminal::locate).transpose()?;

        tracing::info!(
            overlay = QemuImg::BINARY,
            volume = ?volumes.iter().map(|v| v.name()).collect::<Vec<_>>(),
            launcher = %launcher.binary().display(),
            terminal = terminal.as_ref().map(|t| t.name()),
            "Located host tools"
        );

        Ok(Self {
            overlay: Arc::new(overlay),
            volumes: volumes
                .into_iter()
                .map(|v| Arc::new(v) as Arc<dyn VolumeBuilder>)
                .collect(),
            launcher: Arc::new(launcher),
            terminal: terminal.map(|t| Arc::new(t) as Arc<dyn TerminalSurface>),
        })
    }
}

/// Dry-run view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedInstance {
    pub index: u32,
    pub name: String,
    pub ip: std::net::Ipv4Addr,
    pub mac: String,
    pub overlay: PathBuf,
    pub vars: PathBuf,
    pub seed_dir: PathBuf,
    pub seed_volume: PathBuf,
    pub command_line: Vec<String>,
    pub documents: SeedDocuments,
}

/// What a spawn would do.
#[derive(Debug, Clone, Serialize)]
pub struct FleetPlan {
    pub network: NetworkSettings,
    pub instances: Vec<PlannedInstance>,
}

impl std::fmt::Display for FleetPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers: Vec<String> = self
            .network
            .name_servers
            .iter()
            .map(|s| s.to_string())
            .collect();
        writeln!(
            f,
            "gateway {} /{} dns {}",
            self.network.gateway,
            self.network.prefix_len,
            servers.join(",")
        )?;
        for inst in &self.instances {
            writeln!(f)?;
            writeln!(f, "{} {} {}", inst.name, inst.ip, inst.mac)?;
            writeln!(f, "  overlay  {}", inst.overlay.display())?;
            writeln!(f, "  vars     {}", inst.vars.display())?;
            writeln!(f, "  seed     {}", inst.seed_volume.display())?;
            writeln!(f, "  launch   {}", inst.command_line.join(" "))?;
        }
        Ok(())
    }
}

/// A fleet whose preconditions hold.
pub struct Fleet {
    options: FleetOptions,
    layout: FleetLayout,
    base: BaseArtifacts,
    tools: FleetTools,
    auth: AuthContext,
}

impl Fleet {
    /// Check every fatal precondition, in order: shared inputs, host tools,
    /// then authorization. Nothing is written.
    pub async fn preflight(
        options: FleetOptions,
        locate: impl FnOnce(&FleetOptions) -> Result<FleetTools, PreconditionError>,
    ) -> FleetResult<Self> {
        options.guest.validate()?;

        let base = options.base_artifacts();
        base.check()?;
        let firmware = options.firmware_path();
        if !firmware.is_file() {
            return Err(PreconditionError::MissingFirmware { path: firmware }.into());
        }

        let tools = locate(&options)?;
        let auth = AuthContext::acquire(options.auth).await?;

        tracing::info!(
            workdir = %options.workdir.display(),
            base = %base.image.display(),
            auth = ?auth,
            "Preflight passed"
        );

        Ok(Self {
            layout: options.layout(),
            base,
            tools,
            auth,
            options,
        })
    }

    pub fn layout(&self) -> &FleetLayout {
        &self.layout
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Allocate, render, and build the launch command of every instance
    /// without touching the filesystem or starting anything.
    pub fn plan(
        options: &FleetOptions,
        request: &FleetRequest,
        launcher: &dyn VmLauncher,
    ) -> FleetResult<FleetPlan> {
        request.validate()?;
        options.guest.validate()?;
        let allocation = allocate(request)?;

        let layout = options.layout();
        let documents = DocumentBuilder::new(options.guest.clone());
        let auth = AuthContext::preview(options.auth);

        let mut instances = Vec::with_capacity(allocation.identities.len());
        for identity in &allocation.identities {
            let inst_layout = layout.instance(identity.index, &identity.name);
            let docs = documents.render(identity, &allocation.network)?;
            let spec = launch_spec(
                options,
                request,
                identity,
                &inst_layout,
                &inst_layout.overlay_path(),
                &inst_layout.vars_path(),
                &inst_layout.seed_volume_path(),
            );

            instances.push(PlannedInstance {
                index: identity.index,
                name: identity.name.clone(),
                ip: identity.ip,
                mac: mac_string(&identity.mac),
                overlay: inst_layout.overlay_path(),
                vars: inst_layout.vars_path(),
                seed_dir: inst_layout.seed_dir(),
                seed_volume: inst_layout.seed_volume_path(),
                command_line: launcher.command_line(&spec, &auth),
                documents: docs,
            });
        }

        Ok(FleetPlan {
            network: allocation.network,
            instances,
        })
    }

    /// Provision and launch the fleet.
    ///
    /// Returns `Err` only for request and allocation errors, before any
    /// per-instance state exists. Instance failures are in the summary.
    pub async fn spawn(&self, request: &FleetRequest) -> FleetResult<FleetSummary> {
        request.validate()?;
        let allocation = allocate(request)?;

        self.layout.prepare()?;

        let pipeline = Pipeline {
            fleet: self,
            request,
            network: &allocation.network,
            storage: OverlayManager::new(self.base.clone(), self.tools.overlay.clone()),
            documents: DocumentBuilder::new(self.options.guest.clone()),
            packager: Packager::from_builders(self.tools.volumes.clone()),
        };

        tracing::info!(
            count = allocation.identities.len(),
            jobs = self.options.jobs,
            "Spawning fleet"
        );

        let pipeline = &pipeline;
        let instances: Vec<LaunchedInstance> = stream::iter(allocation.identities.iter().cloned())
            .map(move |identity| {
                let span = tracing::info_span!(
                    "instance",
                    index = identity.index,
                    name = %identity.name
                );
                pipeline.run(identity).instrument(span)
            })
            .buffered(self.options.jobs.max(1))
            .collect()
            .await;

        let summary = FleetSummary::new(instances);
        let instances_file = self.layout.instances_file();
        if let Err(e) = write_instances_file(&instances_file, &summary.rows()) {
            tracing::warn!(error = %e, "Could not write instances file");
        }

        tracing::info!(
            launched = summary.launched_count(),
            exited = summary.exited_count(),
            failed = summary.failed_count(),
            "Fleet spawn finished"
        );
        Ok(summary)
    }
}

fn launch_spec(
    options: &FleetOptions,
    request: &FleetRequest,
    identity: &InstanceIdentity,
    layout: &InstanceLayout,
    overlay: &std::path::Path,
    vars: &std::path::Path,
    seed_volume: &std::path::Path,
) -> LaunchSpec {
    LaunchSpec {
        index: identity.index,
        name: identity.name.clone(),
        uuid: identity.uuid,
        mac: identity.mac,
        resources: request.resources,
        firmware: options.firmware_path(),
        vars: vars.to_path_buf(),
        overlay: overlay.to_path_buf(),
        seed_volume: seed_volume.to_path_buf(),
        bridge: request.bridge.clone(),
        backend: options.net_backend,
        accel: options.accel,
        mode: options.launch_mode,
        pid_file: layout.pid_file_path(),
        log_file: layout.log_path(),
        console_socket: layout.console_socket_path(),
    }
}

/// Shared state of one spawn's pipelines.
struct Pipeline<'a> {
    fleet: &'a Fleet,
    request: &'a FleetRequest,
    network: &'a NetworkSettings,
    storage: OverlayManager,
    documents: DocumentBuilder,
    packager: Packager,
}

impl Pipeline<'_> {
    async fn run(&self, identity: InstanceIdentity) -> LaunchedInstance {
        let layout = self.fleet.layout.instance(identity.index, &identity.name);
        let mut inst = LaunchedInstance::new(identity);
        inst.advance(InstanceStage::Allocated);

        if let Err(e) = self.provision(&mut inst, &layout).await {
            tracing::error!(stage = %e.stage(), error = %e, "Instance failed");
            inst.fail(&e);
            return inst;
        }

        if let Some(warning) = self.open_console(&inst, &layout).await {
            inst.warnings.push(warning);
        }
        inst
    }

    async fn provision(
        &self,
        inst: &mut LaunchedInstance,
        layout: &InstanceLayout,
    ) -> Result<(), InstanceError> {
        let storage: StorageHandle = self.storage.ensure(layout).await?;
        inst.storage = Some(storage.clone());
        inst.advance(InstanceStage::StorageReady);

        let docs = self.documents.render(&inst.identity, self.network)?;
        inst.advance(InstanceStage::DocumentsRendered);

        let volume: InitVolume = self.packager.package(layout, &docs).await?;
        inst.volume = Some(volume.clone());
        inst.advance(InstanceStage::VolumePacked);

        let spec = launch_spec(
            &self.fleet.options,
            self.request,
            &inst.identity,
            layout,
            &storage.overlay_path,
            &storage.vars_path,
            &volume.path,
        );
        let handle = self
            .fleet
            .tools
            .launcher
            .launch(&spec, &self.fleet.auth)
            .await
            .map_err(|reason| InstanceError::LaunchFailed {
                index: inst.index(),
                reason,
            })?;

        match handle.exit {
            Some(exit) => tracing::warn!(
                pid = ?handle.pid,
                code = ?exit.code,
                log = %layout.log_path().display(),
                "Instance engine exited during startup"
            ),
            None => tracing::info!(pid = ?handle.pid, ip = %inst.identity.ip, "Instance launched"),
        }
        inst.launched(handle);
        Ok(())
    }

    /// Open a console window. Returns the failure, if any, as a warning.
    async fn open_console(&self, inst: &LaunchedInstance, layout: &InstanceLayout) -> Option<String> {
        let terminal = self.fleet.tools.terminal.as_ref()?;
        if self.fleet.options.launch_mode != LaunchMode::Daemonized {
            return None;
        }

        let mut command = Vec::new();
        // The socket belongs to root; the window's shell may prompt for sudo
        if let AuthContext::Sudo { binary } = &self.fleet.auth {
            command.push(binary.to_string_lossy().into_owned());
        }
        command.extend([
            "nc".to_string(),
            "-U".to_string(),
            layout.console_socket_path().to_string_lossy().into_owned(),
        ]);

        match terminal.open(inst.name(), &command).await {
            Ok(()) => None,
            Err(reason) => {
                let err = BestEffortError::TerminalOpenFailed {
                    name: inst.name().to_string(),
                    terminal: terminal.name().to_string(),
                    reason,
                };
                tracing::warn!(error = %err, "Console window not opened");
                Some(err.to_string())
            }
        }
    }
}
