//! Packs rendered documents into a per-instance init volume.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vmfleet_shared::constants::seed::VOLUME_LABEL;
use vmfleet_shared::errors::InstanceError;

use super::builder::VolumeBuilder;
use super::document::SeedDocuments;
use crate::layout::InstanceLayout;

/// A freshly built init volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitVolume {
    pub path: PathBuf,
    pub seed_dir: PathBuf,
    /// Name of the builder that produced it
    pub builder: String,
}

/// Builds init volumes with the first builder that succeeds.
pub struct Packager {
    builders: Vec<Arc<dyn VolumeBuilder>>,
}

impl Packager {
    pub fn new(builder: Arc<dyn VolumeBuilder>) -> Self {
        Self {
            builders: vec![builder],
        }
    }

    /// Builders in preference order.
    pub fn from_builders(builders: Vec<Arc<dyn VolumeBuilder>>) -> Self {
        Self { builders }
    }

    /// Try `builder` when every earlier one failed.
    pub fn with_fallback(mut self, builder: Arc<dyn VolumeBuilder>) -> Self {
        self.builders.push(builder);
        self
    }

    /// Write `documents` to the seed directory of `layout`.
    ///
    /// Files left over from an earlier run that are not part of the current
    /// set are removed, so the volume contains exactly these documents.
    pub fn write_documents(
        &self,
        layout: &InstanceLayout,
        documents: &SeedDocuments,
    ) -> Result<PathBuf, InstanceError> {
        let index = layout.index();
        let render_err = |reason: String| InstanceError::RenderFailed { index, reason };
        let seed_dir = layout.seed_dir();

        std::fs::create_dir_all(&seed_dir)
            .map_err(|e| render_err(format!("failed to create {}: {e}", seed_dir.display())))?;

        let files = documents.files();
        let wanted: HashSet<&str> = files.iter().map(|(name, _)| *name).collect();

        let entries = std::fs::read_dir(&seed_dir)
            .map_err(|e| render_err(format!("failed to list {}: {e}", seed_dir.display())))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| render_err(format!("failed to list {}: {e}", seed_dir.display())))?;
            let name = entry.file_name();
            if wanted.contains(name.to_string_lossy().as_ref()) {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed
                .map_err(|e| render_err(format!("failed to remove stale {}: {e}", path.display())))?;
            tracing::debug!(index, path = %path.display(), "Removed stale seed file");
        }

        for (name, content) in files {
            let path = seed_dir.join(name);
            std::fs::write(&path, content)
                .map_err(|e| render_err(format!("failed to write {}: {e}", path.display())))?;
        }

        tracing::debug!(index, seed_dir = %seed_dir.display(), "Wrote seed documents");
        Ok(seed_dir)
    }

    /// Write the documents and build the instance's init volume.
    ///
    /// Always rebuilds. The volume is produced under a temporary name and
    /// renamed into place, so a failed build never leaves a partial volume
    /// at the final path.
    pub async fn package(
        &self,
        layout: &InstanceLayout,
        documents: &SeedDocuments,
    ) -> Result<InitVolume, InstanceError> {
        let seed_dir = self.write_documents(layout, documents)?;

        let index = layout.index();
        let build_err = |reason: String| InstanceError::BuildFailed { index, reason };
        let volume = layout.seed_volume_path();
        let partial = partial_path(&volume);

        for stale in [&volume, &partial] {
            if stale.exists() {
                std::fs::remove_file(stale).map_err(|e| {
                    build_err(format!("failed to remove old volume {}: {e}", stale.display()))
                })?;
            }
        }

        let mut failures = Vec::new();
        for (attempt, builder) in self.builders.iter().enumerate() {
            if attempt > 0 {
                tracing::warn!(index, builder = builder.name(), "Retrying with fallback builder");
            }
            tracing::info!(
                index,
                volume = %volume.display(),
                builder = builder.name(),
                "Building init volume"
            );

            match builder.build(&seed_dir, VOLUME_LABEL, &partial).await {
                Ok(()) if partial.exists() => {
                    std::fs::rename(&partial, &volume).map_err(|e| {
                        build_err(format!("failed to move volume into place: {e}"))
                    })?;
                    return Ok(InitVolume {
                        path: volume,
                        seed_dir,
                        builder: builder.name().to_string(),
                    });
                }
                Ok(()) => failures.push(format!(
                    "{} reported success but produced no volume",
                    builder.name()
                )),
                Err(reason) => {
                    let _ = std::fs::remove_file(&partial);
                    failures.push(format!("{}: {reason}", builder.name()));
                }
            }
            if let Some(failure) = failures.last() {
                tracing::warn!(index, error = %failure, "Init volume build failed");
            }
        }

        if failures.is_empty() {
            return Err(build_err("no volume builder configured".to_string()));
        }
        Err(build_err(failures.join("; ")))
    }
}

fn partial_path(volume: &Path) -> PathBuf {
    let mut name = volume.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
