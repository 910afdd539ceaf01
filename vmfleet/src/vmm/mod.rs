//! Engine abstraction: how an instance process is described and started.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vmfleet_shared::errors::FleetError;

pub mod qemu;
pub mod terminal;

use crate::auth::AuthContext;
use crate::request::Resources;
pub use qemu::{QemuCommand, QemuLauncher};
pub use terminal::{Terminal, TerminalKind, TerminalSurface};

/// Host networking backend the instance NIC is attached through.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetBackend {
    /// macOS vmnet.framework bridged mode
    VmnetBridged,
    /// Linux bridge helper
    Bridge,
}

impl NetBackend {
    /// Backend matching the host OS.
    pub fn host_default() -> Self {
        if cfg!(target_os = "macos") {
            NetBackend::VmnetBridged
        } else {
            NetBackend::Bridge
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetBackend::VmnetBridged => "vmnet-bridged",
            NetBackend::Bridge => "bridge",
        }
    }

    /// Option naming the host interface for this backend.
    fn interface_key(&self) -> &'static str {
        match self {
            NetBackend::VmnetBridged => "ifname",
            NetBackend::Bridge => "br",
        }
    }
}

impl FromStr for NetBackend {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vmnet-bridged" | "vmnet" => Ok(NetBackend::VmnetBridged),
            "bridge" => Ok(NetBackend::Bridge),
            _ => Err(FleetError::Config(format!(
                "Unknown network backend: '{}'. Supported: vmnet-bridged, bridge",
                s
            ))),
        }
    }
}

/// Hardware acceleration for the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Hvf,
    Kvm,
}

impl Accelerator {
    pub fn host_default() -> Self {
        if cfg!(target_os = "macos") {
            Accelerator::Hvf
        } else {
            Accelerator::Kvm
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::Hvf => "hvf",
            Accelerator::Kvm => "kvm",
        }
    }
}

/// Whether the engine daemonizes itself or runs as a detached child.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Daemonized,
    Foreground,
}

/// Everything needed to start one instance.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub index: u32,
    pub name: String,
    pub uuid: Uuid,
    pub mac: MacAddr6,
    pub resources: Resources,
    /// Firmware code blob (read-only, shared)
    pub firmware: PathBuf,
    pub vars: PathBuf,
    pub overlay: PathBuf,
    pub seed_volume: PathBuf,
    pub bridge: String,
    pub backend: NetBackend,
    pub accel: Accelerator,
    pub mode: LaunchMode,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub console_socket: PathBuf,
}

/// Handle to a started engine process.
///
/// The process is not owned: it outlives the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    /// Unknown when the engine started but its pidfile could not be read
    pub pid: Option<u32>,
    /// Set when the engine was already gone by the time launch returned
    pub exit: Option<EngineExit>,
}

impl ProcessHandle {
    pub fn running(pid: Option<u32>) -> Self {
        Self { pid, exit: None }
    }

    pub fn exited(pid: Option<u32>, code: Option<i32>) -> Self {
        Self {
            pid,
            exit: Some(EngineExit { code }),
        }
    }
}

/// Early exit of an engine process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EngineExit {
    /// Only known for children of this process
    pub code: Option<i32>,
}

/// Starts instance processes.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    fn name(&self) -> &str;

    /// Full command line, including any elevation prefix.
    fn command_line(&self, spec: &LaunchSpec, auth: &AuthContext) -> Vec<String>;

    /// Start the instance as an independent process.
    async fn launch(&self, spec: &LaunchSpec, auth: &AuthContext) -> Result<ProcessHandle, String>;
}
