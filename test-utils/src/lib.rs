//! Test fixtures for vmfleet.
//!
//! `FleetFixture` lays out a workdir with fake shared inputs, and the
//! `Recording*` types stand in for the external tools, recording every call
//! and failing on demand for chosen instance indices.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use vmfleet::auth::{AuthContext, AuthMode};
use vmfleet::disk::qcow2::header_bytes;
use vmfleet::disk::{BackingFormat, OverlayTool};
use vmfleet::fleet::{FleetOptions, FleetTools};
use vmfleet::seed::VolumeBuilder;
use vmfleet::vmm::{LaunchSpec, ProcessHandle, QemuCommand, TerminalSurface, VmLauncher};

/// Pid reported by `RecordingLauncher` for instance `index`.
pub fn fake_pid(index: u32) -> u32 {
    40_000 + index
}

/// Index encoded in a per-instance file name such as `root-2.qcow2`.
fn index_of(path: &Path, prefix: &str) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(prefix)?
        .split('.')
        .next()?
        .parse()
        .ok()
}

// ============================================================================
// OVERLAY TOOL
// ============================================================================

/// Writes a qcow2 header backed by the base, like `qemu-img create` would.
#[derive(Default)]
pub struct RecordingOverlayTool {
    fail_on: HashSet<u32>,
    created: Mutex<Vec<PathBuf>>,
}

impl RecordingOverlayTool {
    pub fn failing_on(indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fail_on: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl OverlayTool for RecordingOverlayTool {
    fn name(&self) -> &str {
        "fake-qemu-img"
    }

    async fn create_overlay(
        &self,
        base: &Path,
        _format: BackingFormat,
        overlay: &Path,
    ) -> Result<(), String> {
        if index_of(overlay, "root-").is_some_and(|i| self.fail_on.contains(&i)) {
            return Err("simulated qemu-img failure".to_string());
        }
        std::fs::write(overlay, header_bytes(1 << 30, Some(base))).map_err(|e| e.to_string())?;
        self.created.lock().push(overlay.to_path_buf());
        Ok(())
    }
}

// ============================================================================
// VOLUME BUILDER
// ============================================================================

/// One recorded `VolumeBuilder::build` call.
#[derive(Debug, Clone)]
pub struct BuildCall {
    pub source: PathBuf,
    pub label: String,
    pub output: PathBuf,
}

/// Writes the label and every seed file into the output, sorted by name.
#[derive(Default)]
pub struct RecordingVolumeBuilder {
    fail_on: HashSet<u32>,
    calls: Mutex<Vec<BuildCall>>,
}

impl RecordingVolumeBuilder {
    pub fn failing_on(indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fail_on: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<BuildCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl VolumeBuilder for RecordingVolumeBuilder {
    fn name(&self) -> &str {
        "fake-iso"
    }

    async fn build(&self, source: &Path, label: &str, output: &Path) -> Result<(), String> {
        self.calls.lock().push(BuildCall {
            source: source.to_path_buf(),
            label: label.to_string(),
            output: output.to_path_buf(),
        });
        if index_of(source, "seed-init-").is_some_and(|i| self.fail_on.contains(&i)) {
            return Err("simulated builder failure".to_string());
        }

        let mut names: Vec<String> = std::fs::read_dir(source)
            .map_err(|e| e.to_string())?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let mut volume = format!("LABEL {label}\n");
        for name in names {
            let content = std::fs::read_to_string(source.join(&name)).map_err(|e| e.to_string())?;
            volume.push_str(&format!("== {name}\n{content}\n"));
        }
        std::fs::write(output, volume).map_err(|e| e.to_string())
    }
}

// ============================================================================
// LAUNCHER
// ============================================================================

/// Records launch specs and reports [`fake_pid`] without starting anything.
#[derive(Default)]
pub struct RecordingLauncher {
    fail_on: HashSet<u32>,
    exit_on: HashSet<u32>,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl RecordingLauncher {
    pub fn failing_on(indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fail_on: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Engines for these indices start but are gone before launch returns,
    /// with exit code 1.
    pub fn exiting_on(indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            exit_on: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl VmLauncher for RecordingLauncher {
    fn name(&self) -> &str {
        "fake-qemu"
    }

    fn command_line(&self, spec: &LaunchSpec, auth: &AuthContext) -> Vec<String> {
        let mut line = auth.prefix();
        line.push("fake-qemu".to_string());
        line.extend(QemuCommand::for_spec(spec).into_args());
        line
    }

    async fn launch(&self, spec: &LaunchSpec, _auth: &AuthContext) -> Result<ProcessHandle, String> {
        if self.fail_on.contains(&spec.index) {
            return Err("simulated engine failure".to_string());
        }
        self.launches.lock().push(spec.clone());
        let pid = Some(fake_pid(spec.index));
        if self.exit_on.contains(&spec.index) {
            return Ok(ProcessHandle::exited(pid, Some(1)));
        }
        Ok(ProcessHandle::running(pid))
    }
}

// ============================================================================
// TERMINAL
// ============================================================================

#[derive(Default)]
pub struct RecordingTerminal {
    fail: bool,
    opened: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingTerminal {
    /// A terminal whose windows never open.
    pub fn broken() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn opened(&self) -> Vec<(String, Vec<String>)> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl TerminalSurface for RecordingTerminal {
    fn name(&self) -> &str {
        "fake-terminal"
    }

    async fn open(&self, title: &str, command: &[String]) -> Result<(), String> {
        if self.fail {
            return Err("no display".to_string());
        }
        self.opened
            .lock()
            .push((title.to_string(), command.to_vec()));
        Ok(())
    }
}

// ============================================================================
// FIXTURE
// ============================================================================

/// The fakes handed to a fleet, kept for inspection.
#[derive(Clone, Default)]
pub struct FakeTools {
    pub overlay: Arc<RecordingOverlayTool>,
    pub volume: Arc<RecordingVolumeBuilder>,
    pub launcher: Arc<RecordingLauncher>,
    pub terminal: Option<Arc<RecordingTerminal>>,
}

impl FakeTools {
    pub fn tools(&self) -> FleetTools {
        FleetTools {
            overlay: self.overlay.clone(),
            volumes: vec![self.volume.clone() as Arc<dyn VolumeBuilder>],
            launcher: self.launcher.clone(),
            terminal: self
                .terminal
                .clone()
                .map(|t| t as Arc<dyn TerminalSurface>),
        }
    }
}

/// Temporary workdir with a golden image, variable template and firmware.
pub struct FleetFixture {
    pub options: FleetOptions,
    _temp_dir: TempDir, // Dropped after test
}

impl FleetFixture {
    pub const FIRMWARE: &'static str = "base/edk2-code.fd";

    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().join("base");
        std::fs::create_dir_all(&base).expect("Failed to create base dir");
        std::fs::write(base.join("root.qcow2"), header_bytes(10 << 30, None))
            .expect("Failed to write base image");
        std::fs::write(base.join("vars.fd"), vec![0u8; 64 * 1024])
            .expect("Failed to write vars template");
        std::fs::write(temp_dir.path().join(Self::FIRMWARE), b"firmware")
            .expect("Failed to write firmware");

        let options = FleetOptions {
            workdir: temp_dir.path().to_path_buf(),
            firmware: PathBuf::from(Self::FIRMWARE),
            auth: AuthMode::Unprivileged,
            ..Default::default()
        };

        Self {
            options,
            _temp_dir: temp_dir,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.options.workdir
    }

    pub fn base_image(&self) -> PathBuf {
        self.workdir().join("base/root.qcow2")
    }
}

impl Default for FleetFixture {
    fn default() -> Self {
        Self::new()
    }
}
