//! Operations on a fleet left behind by an earlier spawn.

use std::path::PathBuf;

use serde::Serialize;
use vmfleet_shared::errors::{FleetError, FleetResult};

use super::summary::{InstanceRow, read_instances_file};
use crate::layout::{FleetLayout, InstanceLayout};
use crate::net::instance_name;
use crate::util::process::{is_process_alive, read_pid_file};

/// Liveness of one recorded instance.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    #[serde(flatten)]
    pub row: InstanceRow,
    pub alive: bool,
}

/// Check which instances from the last spawn are still running.
pub fn fleet_status(layout: &FleetLayout) -> FleetResult<Vec<StatusEntry>> {
    let rows = read_instances_file(&layout.instances_file())?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let recorded = is_file_stem(&row.name)
                .then(|| current_pid(&layout.instance(row.index, &row.name)))
                .flatten();
            let pid = recorded.or(row.pid);
            let alive = pid.is_some_and(is_process_alive);
            StatusEntry { row, alive }
        })
        .collect())
}

/// What `reset_instance` removed.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub index: u32,
    pub name: String,
    pub removed: Vec<PathBuf>,
}

/// Remove every artifact of instance `index`.
///
/// The instance name comes from `rows` when the index was recorded there,
/// otherwise from `fallback_prefix`. A live process blocks the reset unless
/// `force` is set.
pub fn reset_instance(
    layout: &FleetLayout,
    rows: &[InstanceRow],
    index: u32,
    fallback_prefix: &str,
    force: bool,
) -> FleetResult<ResetOutcome> {
    if index == 0 {
        return Err(FleetError::Config("instance indices start at 1".into()));
    }

    let row = rows.iter().find(|r| r.index == index);
    let name = row
        .map(|r| r.name.clone())
        .unwrap_or_else(|| instance_name(fallback_prefix, index));
    // The name becomes part of run/ paths that get deleted
    if !is_file_stem(&name) {
        return Err(FleetError::Config(format!(
            "instance {index} has an unusable name {name:?}"
        )));
    }
    let instance: InstanceLayout = layout.instance(index, &name);

    let pid = current_pid(&instance).or(row.and_then(|r| r.pid));
    if let Some(pid) = pid.filter(|pid| is_process_alive(*pid)) {
        if !force {
            return Err(FleetError::Config(format!(
                "instance {index} ({name}) is still running as pid {pid}; stop it first or pass --force"
            )));
        }
        tracing::warn!(index, name = %name, pid, "Resetting instance with a live process");
    }

    let removed = instance.cleanup()?;
    tracing::info!(index, name = %name, removed = removed.len(), "Reset instance");

    Ok(ResetOutcome {
        index,
        name,
        removed,
    })
}

/// A name that stays a single component inside the run directory.
fn is_file_stem(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn current_pid(instance: &InstanceLayout) -> Option<u32> {
    read_pid_file(&instance.pid_file_path()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::summary::write_instances_file;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn row(index: u32, pid: Option<u32>) -> InstanceRow {
        InstanceRow {
            index,
            name: format!("lab-{index}"),
            ip: Ipv4Addr::new(10, 0, 0, index as u8 + 1),
            mac: "52:54:00:f1:33:11".into(),
            disk: None,
            seed_iso: None,
            pid,
            status: "running".into(),
        }
    }

    fn populated(index: u32, name: &str, layout: &FleetLayout) -> InstanceLayout {
        layout.prepare().unwrap();
        let inst = layout.instance(index, name);
        std::fs::write(inst.overlay_path(), b"qcow").unwrap();
        std::fs::write(inst.vars_path(), b"vars").unwrap();
        inst
    }

    #[test]
    fn test_reset_refuses_live_instance() {
        let temp = TempDir::new().unwrap();
        let layout = FleetLayout::new(temp.path());
        let inst = populated(1, "lab-1", &layout);
        let rows = [row(1, Some(std::process::id()))];

        let err = reset_instance(&layout, &rows, 1, "overlay", false).unwrap_err();
        assert!(err.to_string().contains("still running"));
        assert!(inst.overlay_path().exists());

        let outcome = reset_instance(&layout, &rows, 1, "overlay", true).unwrap();
        assert_eq!(outcome.name, "lab-1");
        assert!(!inst.overlay_path().exists());
    }

    #[test]
    fn test_reset_without_record_uses_prefix() {
        let temp = TempDir::new().unwrap();
        let layout = FleetLayout::new(temp.path());
        let inst = populated(4, "overlay-4", &layout);

        let outcome = reset_instance(&layout, &[], 4, "overlay", false).unwrap();
        assert_eq!(outcome.name, "overlay-4");
        assert_eq!(outcome.removed.len(), 2);
        assert!(!inst.vars_path().exists());
    }

    #[test]
    fn test_reset_rejects_name_escaping_run_dir() {
        let temp = TempDir::new().unwrap();
        let layout = FleetLayout::new(temp.path());
        let inst = populated(1, "lab-1", &layout);
        // run/../victim.pid resolves to the workdir itself
        let victim = temp.path().join("victim.pid");
        std::fs::write(&victim, b"keep").unwrap();

        let mut tampered = row(1, None);
        tampered.name = "../victim".into();
        let err = reset_instance(&layout, &[tampered], 1, "overlay", true).unwrap_err();

        assert!(matches!(err, FleetError::Config(_)));
        assert!(err.to_string().contains("unusable name"));
        assert!(victim.exists());
        assert!(inst.overlay_path().exists());

        for name in ["", "..", "a/b", "a\\b"] {
            assert!(!is_file_stem(name), "{name:?}");
        }
        assert!(is_file_stem("lab-1"));
    }

    #[test]
    fn test_status_reports_liveness() {
        let temp = TempDir::new().unwrap();
        let layout = FleetLayout::new(temp.path());
        let rows = [row(1, Some(std::process::id())), row(2, None)];
        write_instances_file(&layout.instances_file(), &rows).unwrap();

        let status = fleet_status(&layout).unwrap();
        assert_eq!(status.len(), 2);
        assert!(status[0].alive);
        assert!(!status[1].alive);
    }

    #[test]
    fn test_status_without_instances_file() {
        let temp = TempDir::new().unwrap();
        assert!(fleet_status(&FleetLayout::new(temp.path())).is_err());
    }
}
