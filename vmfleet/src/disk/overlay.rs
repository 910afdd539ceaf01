//! Per-instance copy-on-write storage.
//!
//! Each instance gets a qcow2 overlay backed by the shared golden image and a
//! private copy of the firmware variable store. The shared inputs are only
//! ever read; every write goes to a per-index path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use vmfleet_shared::errors::{InstanceError, PreconditionError};

use super::qcow2::{BackingFormat, Qcow2Header};
use crate::layout::InstanceLayout;
use crate::util::{find_in_path, run_tool};

/// External mechanism that creates an overlay backed by a base image.
#[async_trait]
pub trait OverlayTool: Send + Sync {
    /// Tool name for logs.
    fn name(&self) -> &str;

    /// Create `overlay` as a qcow2 image backed by `base`.
    ///
    /// `base` is absolute. Must not modify `base`.
    async fn create_overlay(
        &self,
        base: &Path,
        format: BackingFormat,
        overlay: &Path,
    ) -> Result<(), String>;
}

/// `qemu-img create -f qcow2 -F <fmt> -b <base> <overlay>`
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub const BINARY: &'static str = "qemu-img";

    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locate `qemu-img` in `PATH`.
    pub fn locate() -> Result<Self, PreconditionError> {
        find_in_path(Self::BINARY)
            .map(Self::new)
            .ok_or_else(|| PreconditionError::MissingTool {
                tool: Self::BINARY.to_string(),
            })
    }
}

#[async_trait]
impl OverlayTool for QemuImg {
    fn name(&self) -> &str {
        Self::BINARY
    }

    async fn create_overlay(
        &self,
        base: &Path,
        format: BackingFormat,
        overlay: &Path,
    ) -> Result<(), String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["create", "-f", "qcow2", "-F", format.as_str()])
            .arg("-b")
            .arg(base)
            .arg(overlay);
        run_tool(&mut cmd).await.map(|_| ())
    }
}

/// Whether an artifact was made by this run or found from a previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioned {
    Created,
    Reused,
}

/// Storage owned by one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    pub overlay_path: PathBuf,
    pub vars_path: PathBuf,
    pub overlay: Provisioned,
    pub vars: Provisioned,
}

/// Shared, read-only inputs every overlay derives from.
#[derive(Debug, Clone)]
pub struct BaseArtifacts {
    pub image: PathBuf,
    pub vars_template: PathBuf,
}

impl BaseArtifacts {
    pub fn new(image: impl Into<PathBuf>, vars_template: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            vars_template: vars_template.into(),
        }
    }

    /// Fail if either shared input is absent.
    pub fn check(&self) -> Result<(), PreconditionError> {
        if !self.image.is_file() {
            return Err(PreconditionError::MissingBase {
                what: "base image",
                path: self.image.clone(),
            });
        }
        if !self.vars_template.is_file() {
            return Err(PreconditionError::MissingBase {
                what: "variable-store template",
                path: self.vars_template.clone(),
            });
        }
        Ok(())
    }
}

/// Creates or reuses per-instance storage.
pub struct OverlayManager {
    base: BaseArtifacts,
    tool: Arc<dyn OverlayTool>,
}

impl OverlayManager {
    pub fn new(base: BaseArtifacts, tool: Arc<dyn OverlayTool>) -> Self {
        Self { base, tool }
    }

    pub fn base(&self) -> &BaseArtifacts {
        &self.base
    }

    /// Ensure the overlay and variable store of one instance exist.
    ///
    /// Existing artifacts are reused as-is; nothing is ever overwritten.
    pub async fn ensure(&self, layout: &InstanceLayout) -> Result<StorageHandle, InstanceError> {
        let index = layout.index();

        for (what, path) in [
            ("base image", &self.base.image),
            ("variable-store template", &self.base.vars_template),
        ] {
            if !path.is_file() {
                return Err(InstanceError::MissingBase {
                    index,
                    what,
                    path: path.clone(),
                });
            }
        }

        let overlay_path = layout.overlay_path();
        let overlay = self.ensure_overlay(index, &overlay_path).await?;

        let vars_path = layout.vars_path();
        let vars = self.ensure_vars(index, &vars_path).await?;

        Ok(StorageHandle {
            overlay_path,
            vars_path,
            overlay,
            vars,
        })
    }

    async fn ensure_overlay(
        &self,
        index: u32,
        overlay_path: &Path,
    ) -> Result<Provisioned, InstanceError> {
        let storage_err = |reason: String| InstanceError::StorageCreateFailed { index, reason };

        let base = self.base.image.canonicalize().map_err(|e| {
            storage_err(format!(
                "failed to resolve base image {}: {e}",
                self.base.image.display()
            ))
        })?;

        if overlay_path.exists() {
            tracing::info!(
                index,
                overlay = %overlay_path.display(),
                "Overlay exists, skipping create"
            );
            self.check_backing(index, overlay_path, &base);
            return Ok(Provisioned::Reused);
        }

        if let Some(parent) = overlay_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                storage_err(format!(
                    "failed to create parent directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let format = BackingFormat::detect(&base).map_err(|e| storage_err(e.to_string()))?;

        tracing::info!(
            index,
            overlay = %overlay_path.display(),
            backing = %base.display(),
            format = format.as_str(),
            tool = self.tool.name(),
            "Creating COW overlay"
        );

        if let Err(reason) = self.tool.create_overlay(&base, format, overlay_path).await {
            // Created by this call and incomplete, so never worth reusing
            if overlay_path.exists() {
                let _ = std::fs::remove_file(overlay_path);
            }
            return Err(storage_err(reason));
        }

        if !overlay_path.exists() {
            return Err(storage_err(format!(
                "{} reported success but {} does not exist",
                self.tool.name(),
                overlay_path.display()
            )));
        }

        tracing::info!(index, overlay = %overlay_path.display(), "Created COW overlay");
        Ok(Provisioned::Created)
    }

    /// Warn when a reused overlay points at a different base than this run's.
    fn check_backing(&self, index: u32, overlay_path: &Path, base: &Path) {
        match Qcow2Header::read(overlay_path) {
            Ok(header) => match header.backing_file {
                Some(backing) if backing != base => tracing::warn!(
                    index,
                    overlay = %overlay_path.display(),
                    recorded = %backing.display(),
                    current = %base.display(),
                    "Reused overlay is backed by a different base image; reset the instance to rebase it"
                ),
                None => tracing::warn!(
                    index,
                    overlay = %overlay_path.display(),
                    "Reused overlay has no backing file"
                ),
                Some(_) => {}
            },
            Err(e) => tracing::warn!(
                index,
                overlay = %overlay_path.display(),
                error = %e,
                "Could not inspect reused overlay"
            ),
        }
    }

    async fn ensure_vars(&self, index: u32, vars_path: &Path) -> Result<Provisioned, InstanceError> {
        if vars_path.exists() {
            tracing::info!(
                index,
                vars = %vars_path.display(),
                "Variable store exists, skipping copy"
            );
            return Ok(Provisioned::Reused);
        }

        let template = self.base.vars_template.clone();
        let target = vars_path.to_path_buf();
        let partial = vars_path.with_extension("fd.partial");

        tracing::info!(
            index,
            vars = %vars_path.display(),
            template = %template.display(),
            "Copying variable store"
        );

        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            reflink_copy::reflink_or_copy(&template, &partial)?;
            std::fs::rename(&partial, &target).inspect_err(|_| {
                let _ = std::fs::remove_file(&partial);
            })
        })
        .await;

        match copied {
            Ok(Ok(())) => Ok(Provisioned::Created),
            Ok(Err(e)) => Err(InstanceError::StorageCreateFailed {
                index,
                reason: format!("failed to copy variable store: {e}"),
            }),
            Err(e) => Err(InstanceError::StorageCreateFailed {
                index,
                reason: format!("variable store copy task failed: {e}"),
            }),
        }
    }
}
