//! Spawn outcome and the `instances.csv` file.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmfleet_shared::errors::{BestEffortError, FleetError, FleetResult};

use super::state::{InstanceStatus, LaunchedInstance};
use crate::net::mac_string;

/// One line of `instances.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRow {
    #[serde(rename = "INDEX")]
    pub index: u32,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "DISK")]
    pub disk: Option<PathBuf>,
    #[serde(rename = "SEED_ISO")]
    pub seed_iso: Option<PathBuf>,
    #[serde(rename = "PID")]
    pub pid: Option<u32>,
    #[serde(rename = "STATUS")]
    pub status: String,
}

impl From<&LaunchedInstance> for InstanceRow {
    fn from(inst: &LaunchedInstance) -> Self {
        Self {
            index: inst.index(),
            name: inst.identity.name.clone(),
            ip: inst.identity.ip,
            mac: mac_string(&inst.identity.mac),
            disk: inst.storage.as_ref().map(|s| s.overlay_path.clone()),
            seed_iso: inst.volume.as_ref().map(|v| v.path.clone()),
            pid: inst.pid(),
            status: inst.status.label(),
        }
    }
}

/// Write `rows` to `path`, replacing any previous file.
pub fn write_instances_file(path: &Path, rows: &[InstanceRow]) -> Result<(), BestEffortError> {
    let fail = |reason: String| BestEffortError::InstancesFile {
        path: path.to_path_buf(),
        reason,
    };

    let partial = path.with_extension("csv.partial");
    let mut writer = csv::Writer::from_path(&partial).map_err(|e| fail(e.to_string()))?;
    for row in rows {
        writer.serialize(row).map_err(|e| fail(e.to_string()))?;
    }
    writer.flush().map_err(|e| fail(e.to_string()))?;
    drop(writer);

    std::fs::rename(&partial, path).map_err(|e| fail(e.to_string()))
}

/// Read the rows of an instances file.
pub fn read_instances_file(path: &Path) -> FleetResult<Vec<InstanceRow>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        FleetError::Config(format!("failed to open {}: {e}", path.display()))
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<InstanceRow>, _>>()
        .map_err(|e| FleetError::Config(format!("invalid row in {}: {e}", path.display())))
}

/// Outcome of a spawn, in index order.
#[derive(Debug, Clone)]
pub struct FleetSummary {
    instances: Vec<LaunchedInstance>,
}

impl FleetSummary {
    pub fn new(mut instances: Vec<LaunchedInstance>) -> Self {
        instances.sort_by_key(|i| i.index());
        Self { instances }
    }

    pub fn instances(&self) -> &[LaunchedInstance] {
        &self.instances
    }

    /// (name, ip, status) per instance, in launch order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Ipv4Addr, &InstanceStatus)> {
        self.instances
            .iter()
            .map(|i| (i.name(), i.identity.ip, &i.status))
    }

    /// Instances whose engine was still up when launch returned.
    pub fn launched_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| !i.status.is_failed() && !i.status.is_exited())
            .count()
    }

    pub fn exited_count(&self) -> usize {
        self.instances.iter().filter(|i| i.status.is_exited()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.instances.iter().filter(|i| i.status.is_failed()).count()
    }

    pub fn rows(&self) -> Vec<InstanceRow> {
        self.instances.iter().map(InstanceRow::from).collect()
    }
}
