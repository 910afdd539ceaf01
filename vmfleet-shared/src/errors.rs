//! Hierarchical error types for fleet provisioning.
//!
//! Errors are categorized by how far they are allowed to propagate:
//! - [`PreconditionError`]: missing inputs or tooling (fatal, before any instance work)
//! - [`AllocationError`]: the requested address batch is invalid (fatal, before any instance work)
//! - [`InstanceError`]: one instance's pipeline failed (recovered by the coordinator)
//! - [`BestEffortError`]: cosmetic failures after a successful launch (logged only)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors that can occur while provisioning a fleet.
///
/// ```ignore
/// match fleet.spawn().await {
///     Err(FleetError::Precondition(_)) => { /* fix the host, nothing was touched */ }
///     Err(FleetError::Allocation(_)) => { /* fix the request, nothing was touched */ }
///     Ok(summary) => { /* per-instance failures live inside the summary */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Error)]
pub enum FleetError {
    /// A host-side precondition is not met.
    #[error("precondition: {0}")]
    Precondition(#[from] PreconditionError),

    /// The requested address batch cannot be allocated.
    #[error("allocation: {0}")]
    Allocation(#[from] AllocationError),

    /// A single instance's pipeline failed.
    #[error("{0}")]
    Instance(#[from] InstanceError),

    /// Cosmetic failure after the instance was launched.
    #[error("best effort: {0}")]
    BestEffort(#[from] BestEffortError),

    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),

    /// Generic IO error (catch-all).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl FleetError {
    /// Whether this error must abort the whole run.
    ///
    /// Per-instance and best-effort errors never stop the fleet.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FleetError::Instance(_) | FleetError::BestEffort(_))
    }
}

// ============================================================================
// Precondition Errors (fatal, checked before any instance work)
// ============================================================================

#[derive(Debug, Error)]
pub enum PreconditionError {
    /// A shared base artifact (image or variable-store template) is absent.
    #[error("{what} not found: {}", path.display())]
    MissingBase { what: &'static str, path: PathBuf },

    /// Firmware code blob is absent.
    #[error("firmware not found: {}", path.display())]
    MissingFirmware { path: PathBuf },

    /// A required host tool is not installed.
    #[error("required tool '{tool}' not found in PATH")]
    MissingTool { tool: String },

    /// No init-volume builder is installed.
    #[error("no volume builder found (searched: {})", searched.join(", "))]
    NoVolumeBuilder { searched: Vec<String> },

    /// The requested terminal emulator is not installed.
    #[error("terminal '{terminal}' not available (needs '{program}')")]
    MissingTerminal { terminal: String, program: String },

    /// Privilege elevation could not be acquired up front.
    #[error("authorization: {0}")]
    Authorization(String),
}

// ============================================================================
// Allocation Errors (fatal, invalidate the whole batch)
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Requested fleet size is zero or negative.
    #[error("fleet size must be at least 1 (got {count})")]
    EmptyFleet { count: i64 },

    /// Prefix length outside [0, 32].
    #[error("prefix length {prefix} is outside [0, 32]")]
    InvalidPrefix { prefix: u8 },

    /// Last address of the batch would overflow the IPv4 space.
    #[error("{count} addresses starting at {start} overflow the IPv4 address space")]
    InvalidRange { start: Ipv4Addr, count: u32 },

    /// More instances than distinct MAC suffixes.
    #[error("fleet of {count} exceeds {max} distinct MAC addresses")]
    MacSpaceExhausted { count: u32, max: u32 },

    /// An instance address equals the gateway.
    #[error("instance {index} address {address} collides with the gateway")]
    GatewayCollision { index: u32, address: Ipv4Addr },

    /// Index outside [1, count].
    #[error("index {index} outside fleet range 1..={count}")]
    IndexOutOfRange { index: u32, count: u32 },
}

// ============================================================================
// Per-Instance Errors (recovered by the coordinator)
// ============================================================================

/// Pipeline stage in which an instance failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Storage,
    Render,
    Package,
    Launch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Storage => "storage",
            Stage::Render => "render",
            Stage::Package => "package",
            Stage::Launch => "launch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    /// Base image or variable-store template vanished before this instance.
    #[error("instance {index}: {what} not found: {}", path.display())]
    MissingBase {
        index: u32,
        what: &'static str,
        path: PathBuf,
    },

    /// Overlay or variable-store creation failed.
    #[error("instance {index}: storage creation failed: {reason}")]
    StorageCreateFailed { index: u32, reason: String },

    /// Documents could not be rendered or written.
    #[error("instance {index}: rendering seed documents failed: {reason}")]
    RenderFailed { index: u32, reason: String },

    /// The volume builder failed.
    #[error("instance {index}: building init volume failed: {reason}")]
    BuildFailed { index: u32, reason: String },

    /// The engine process could not be started.
    #[error("instance {index}: launch failed: {reason}")]
    LaunchFailed { index: u32, reason: String },
}

impl InstanceError {
    /// Stage that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            InstanceError::MissingBase { .. } | InstanceError::StorageCreateFailed { .. } => {
                Stage::Storage
            }
            InstanceError::RenderFailed { .. } => Stage::Render,
            InstanceError::BuildFailed { .. } => Stage::Package,
            InstanceError::LaunchFailed { .. } => Stage::Launch,
        }
    }

    /// Instance index this error belongs to.
    pub fn index(&self) -> u32 {
        match self {
            InstanceError::MissingBase { index, .. }
            | InstanceError::StorageCreateFailed { index, .. }
            | InstanceError::RenderFailed { index, .. }
            | InstanceError::BuildFailed { index, .. }
            | InstanceError::LaunchFailed { index, .. } => *index,
        }
    }
}

// ============================================================================
// Best-Effort Errors (logged only)
// ============================================================================

#[derive(Debug, Error)]
pub enum BestEffortError {
    /// Console window could not be opened for a running instance.
    #[error("opening {terminal} console for {name}: {reason}")]
    TerminalOpenFailed {
        name: String,
        terminal: String,
        reason: String,
    },

    /// The instances file could not be written.
    #[error("writing {}: {reason}", path.display())]
    InstancesFile { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let pre: FleetError = PreconditionError::MissingTool {
            tool: "qemu-img".into(),
        }
        .into();
        assert!(pre.is_fatal());

        let alloc: FleetError = AllocationError::EmptyFleet { count: 0 }.into();
        assert!(alloc.is_fatal());

        let inst: FleetError = InstanceError::LaunchFailed {
            index: 2,
            reason: "no such file".into(),
        }
        .into();
        assert!(!inst.is_fatal());

        let cosmetic: FleetError = BestEffortError::TerminalOpenFailed {
            name: "overlay-1".into(),
            terminal: "xterm".into(),
            reason: "no display".into(),
        }
        .into();
        assert!(!cosmetic.is_fatal());
    }

    #[test]
    fn test_instance_error_names_stage_and_index() {
        let err = InstanceError::BuildFailed {
            index: 3,
            reason: "mkisofs exited with 1".into(),
        };
        assert_eq!(err.stage(), Stage::Package);
        assert_eq!(err.index(), 3);
        assert!(err.to_string().contains("instance 3"));

        let err = InstanceError::MissingBase {
            index: 1,
            what: "base image",
            path: PathBuf::from("/x/base/root.qcow2"),
        };
        assert_eq!(err.stage(), Stage::Storage);
        assert!(err.to_string().contains("/x/base/root.qcow2"));
    }

    #[test]
    fn test_no_volume_builder_lists_candidates() {
        let err = PreconditionError::NoVolumeBuilder {
            searched: vec!["hdiutil".into(), "mkisofs".into()],
        };
        assert_eq!(
            err.to_string(),
            "no volume builder found (searched: hdiutil, mkisofs)"
        );
    }
}
