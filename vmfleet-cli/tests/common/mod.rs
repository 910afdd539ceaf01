#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Environment variables that would otherwise leak host settings into a run
const CLEARED_ENV: &[&str] = &[
    "VMFLEET_WORKDIR",
    "VMFLEET_SMP",
    "VMFLEET_MEM_MB",
    "VMFLEET_BASE_IMAGE",
    "VMFLEET_BIOS",
    "VMFLEET_TERMINAL",
    "RUST_LOG",
];

pub struct TestContext {
    pub cmd: Command,
    pub workdir: PathBuf,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    /// Another invocation against the same workdir
    pub fn new_cmd(&self) -> Command {
        command_for(&self.workdir)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.workdir.join(relative)
    }

    /// Create `relative` (and its parents) with `content`.
    pub fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn command_for(workdir: &Path) -> Command {
    let bin_path = env!("CARGO_BIN_EXE_vmfleet");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    for var in CLEARED_ENV {
        cmd.env_remove(var);
    }
    cmd.arg("--workdir").arg(workdir);
    cmd
}

/// Fresh, empty workdir per test
pub fn vmfleet() -> TestContext {
    let temp_dir = TempDir::new().expect("Failed to create temp workdir");
    let workdir = temp_dir.path().to_path_buf();
    TestContext {
        cmd: command_for(&workdir),
        workdir,
        _temp_dir: temp_dir,
    }
}
