//! Per-instance pipeline stage and status.
//!
//! ```text
//! Pending → Allocated → StorageReady → DocumentsRendered → VolumePacked → Launched
//!                 ↘            ↘                ↘                 ↘
//!                                     Failed(stage, reason)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use vmfleet_shared::errors::{InstanceError, Stage};

use crate::disk::StorageHandle;
use crate::net::InstanceIdentity;
use crate::seed::InitVolume;
use crate::vmm::ProcessHandle;

/// Where an instance is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStage {
    Pending,
    Allocated,
    StorageReady,
    DocumentsRendered,
    VolumePacked,
    Launched,
    Failed,
}

impl InstanceStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStage::Launched | InstanceStage::Failed)
    }

    /// Stages advance strictly in order; any non-terminal stage may fail.
    pub fn can_transition_to(&self, target: InstanceStage) -> bool {
        use InstanceStage::*;
        matches!(
            (self, target),
            (Pending, Allocated)
                | (Allocated, StorageReady)
                | (StorageReady, DocumentsRendered)
                | (DocumentsRendered, VolumePacked)
                | (VolumePacked, Launched)
                | (Allocated | StorageReady | DocumentsRendered | VolumePacked, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStage::Pending => "pending",
            InstanceStage::Allocated => "allocated",
            InstanceStage::StorageReady => "storage_ready",
            InstanceStage::DocumentsRendered => "documents_rendered",
            InstanceStage::VolumePacked => "volume_packed",
            InstanceStage::Launched => "launched",
            InstanceStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of the instance process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Launch accepted, pid not known
    Starting,
    Running { pid: u32 },
    /// Exit code is only known for children of this process
    Exited { code: Option<i32> },
    Failed { stage: Stage, reason: String },
}

impl InstanceStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, InstanceStatus::Failed { .. })
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, InstanceStatus::Exited { .. })
    }

    /// Short label for tables and the instances file.
    pub fn label(&self) -> String {
        match self {
            InstanceStatus::Starting => "starting".to_string(),
            InstanceStatus::Running { .. } => "running".to_string(),
            InstanceStatus::Exited { code: Some(code) } => format!("exited({code})"),
            InstanceStatus::Exited { code: None } => "exited".to_string(),
            InstanceStatus::Failed { stage, .. } => format!("failed:{stage}"),
        }
    }
}

/// One instance of the fleet and everything produced for it.
#[derive(Debug, Clone)]
pub struct LaunchedInstance {
    pub identity: InstanceIdentity,
    stage: InstanceStage,
    pub storage: Option<StorageHandle>,
    pub volume: Option<InitVolume>,
    pub process: Option<ProcessHandle>,
    pub status: InstanceStatus,
    pub launched_at: Option<DateTime<Utc>>,
    /// Best-effort failures after launch
    pub warnings: Vec<String>,
}

impl LaunchedInstance {
    pub fn new(identity: InstanceIdentity) -> Self {
        Self {
            identity,
            stage: InstanceStage::Pending,
            storage: None,
            volume: None,
            process: None,
            status: InstanceStatus::Starting,
            launched_at: None,
            warnings: Vec::new(),
        }
    }

    pub fn stage(&self) -> InstanceStage {
        self.stage
    }

    pub fn index(&self) -> u32 {
        self.identity.index
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Move to the next stage.
    pub fn advance(&mut self, next: InstanceStage) {
        debug_assert!(
            self.stage.can_transition_to(next),
            "invalid transition {} -> {}",
            self.stage,
            next
        );
        tracing::debug!(
            index = self.identity.index,
            from = %self.stage,
            to = %next,
            "Instance stage"
        );
        self.stage = next;
    }

    /// Record a successful launch.
    pub fn launched(&mut self, handle: ProcessHandle) {
        self.advance(InstanceStage::Launched);
        self.status = match (handle.exit, handle.pid) {
            (Some(exit), _) => InstanceStatus::Exited { code: exit.code },
            (None, Some(pid)) => InstanceStatus::Running { pid },
            (None, None) => InstanceStatus::Starting,
        };
        self.process = Some(handle);
        self.launched_at = Some(Utc::now());
    }

    /// Record a pipeline failure.
    pub fn fail(&mut self, error: &InstanceError) {
        self.advance(InstanceStage::Failed);
        self.status = InstanceStatus::Failed {
            stage: error.stage(),
            reason: error.to_string(),
        };
    }

    /// Pid of a live engine; an engine that already exited has none.
    pub fn pid(&self) -> Option<u32> {
        self.process
            .filter(|p| p.exit.is_none())
            .and_then(|p| p.pid)
    }
}
