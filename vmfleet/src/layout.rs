use std::path::{Path, PathBuf};
use vmfleet_shared::errors::{FleetError, FleetResult};

/// Directory structure constants
pub mod dirs {
    /// Shared, read-only inputs (golden image, firmware variable template)
    pub const BASE_DIR: &str = "base";

    /// Per-instance overlays and variable stores
    pub const OVERLAYS_DIR: &str = "overlays";

    /// Per-instance seed directories and init volumes
    pub const SEEDS_DIR: &str = "seeds";

    /// Pidfiles, engine logs and console sockets
    pub const RUN_DIR: &str = "run";

    /// Orchestrator log files
    pub const LOGS_DIR: &str = "logs";

    /// Default golden image, relative to the workdir
    pub const BASE_IMAGE: &str = "base/root.qcow2";

    /// Default variable-store template, relative to the workdir
    pub const VARS_TEMPLATE: &str = "base/vars.fd";

    /// Summary of the last spawn
    pub const INSTANCES_FILE: &str = "instances.csv";
}

// ============================================================================
// FLEET LAYOUT (workdir)
// ============================================================================

#[derive(Clone, Debug)]
pub struct FleetLayout {
    root: PathBuf,
}

impl FleetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_dir(&self) -> PathBuf {
        self.root.join(dirs::BASE_DIR)
    }

    pub fn overlays_dir(&self) -> PathBuf {
        self.root.join(dirs::OVERLAYS_DIR)
    }

    pub fn seeds_dir(&self) -> PathBuf {
        self.root.join(dirs::SEEDS_DIR)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(dirs::RUN_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(dirs::LOGS_DIR)
    }

    pub fn instances_file(&self) -> PathBuf {
        self.root.join(dirs::INSTANCES_FILE)
    }

    /// Resolve a user-supplied path against the workdir.
    ///
    /// Absolute paths are returned unchanged.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Create the generated-artifact directories.
    ///
    /// Never touches `base/`: shared inputs are provided by the operator.
    pub fn prepare(&self) -> FleetResult<()> {
        for dir in [self.overlays_dir(), self.seeds_dir(), self.run_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                FleetError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create {}: {e}", dir.display()),
                ))
            })?;
        }
        Ok(())
    }

    /// Per-instance paths for the given 1-based index.
    pub fn instance(&self, index: u32, name: &str) -> InstanceLayout {
        InstanceLayout {
            index,
            overlays_dir: self.overlays_dir(),
            seeds_dir: self.seeds_dir(),
            run_dir: self.run_dir(),
            name: name.to_string(),
        }
    }
}

// ============================================================================
// INSTANCE LAYOUT (per-index paths)
// ============================================================================

/// Paths owned by a single instance index.
///
/// - overlays/root-<i>.qcow2, overlays/vars-<i>.fd: persistent storage
/// - seeds/seed-init-<i>/, seeds/seed-<i>.iso: rebuilt on every spawn
/// - run/<name>.{pid,log,console.sock}: engine runtime files
#[derive(Clone, Debug)]
pub struct InstanceLayout {
    index: u32,
    name: String,
    overlays_dir: PathBuf,
    seeds_dir: PathBuf,
    run_dir: PathBuf,
}

impl InstanceLayout {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.overlays_dir.join(format!("root-{}.qcow2", self.index))
    }

    pub fn vars_path(&self) -> PathBuf {
        self.overlays_dir.join(format!("vars-{}.fd", self.index))
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.seeds_dir.join(format!("seed-init-{}", self.index))
    }

    pub fn seed_volume_path(&self) -> PathBuf {
        self.seeds_dir.join(format!("seed-{}.iso", self.index))
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.pid", self.name))
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.log", self.name))
    }

    /// Unix socket the engine exposes the serial console on.
    pub fn console_socket_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.console.sock", self.name))
    }

    /// Remove every artifact of this index.
    ///
    /// This is the only code path that deletes an overlay. Returns the paths
    /// that were actually removed.
    pub fn cleanup(&self) -> FleetResult<Vec<PathBuf>> {
        let mut removed = Vec::new();

        for file in [
            self.overlay_path(),
            self.vars_path(),
            self.seed_volume_path(),
            self.pid_file_path(),
            self.console_socket_path(),
        ] {
            if file.exists() {
                std::fs::remove_file(&file)?;
                tracing::debug!(path = %file.display(), "Removed instance file");
                removed.push(file);
            }
        }

        let seed_dir = self.seed_dir();
        if seed_dir.exists() {
            std::fs::remove_dir_all(&seed_dir)?;
            tracing::debug!(path = %seed_dir.display(), "Removed seed directory");
            removed.push(seed_dir);
        }

        Ok(removed)
    }
}
