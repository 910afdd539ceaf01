//! External ISO builders for init volumes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use vmfleet_shared::errors::PreconditionError;

use crate::util::{find_in_path, run_tool};

/// External mechanism that packs a directory into a read-only volume.
#[async_trait]
pub trait VolumeBuilder: Send + Sync {
    /// Builder name for logs and the summary.
    fn name(&self) -> &str;

    /// Pack every file of `source` into a volume labelled `label` at exactly
    /// `output`.
    async fn build(&self, source: &Path, label: &str, output: &Path) -> Result<(), String>;
}

/// Supported ISO builders, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoToolKind {
    Hdiutil,
    Mkisofs,
    Xorrisofs,
    Genisoimage,
}

impl IsoToolKind {
    pub const PREFERENCE: [IsoToolKind; 4] = [
        IsoToolKind::Hdiutil,
        IsoToolKind::Mkisofs,
        IsoToolKind::Xorrisofs,
        IsoToolKind::Genisoimage,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            IsoToolKind::Hdiutil => "hdiutil",
            IsoToolKind::Mkisofs => "mkisofs",
            IsoToolKind::Xorrisofs => "xorrisofs",
            IsoToolKind::Genisoimage => "genisoimage",
        }
    }

    /// Arguments for packing `source` into `output`.
    pub fn args(&self, source: &Path, label: &str, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy().into_owned();
        let output = output.to_string_lossy().into_owned();
        let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut args = match self {
            IsoToolKind::Hdiutil => owned(&[
                "makehybrid",
                "-iso",
                "-joliet",
                "-default-volume-name",
                label,
                "-o",
            ]),
            IsoToolKind::Mkisofs | IsoToolKind::Genisoimage => {
                owned(&["-output", &output, "-volid", label, "-joliet", "-rock"])
            }
            IsoToolKind::Xorrisofs => owned(&["-o", &output, "-V", label, "-J", "-R"]),
        };
        if *self == IsoToolKind::Hdiutil {
            args.push(output);
        }
        args.push(source);
        args
    }
}

/// A located ISO builder binary.
#[derive(Debug, Clone)]
pub struct IsoTool {
    kind: IsoToolKind,
    binary: PathBuf,
}

impl IsoTool {
    pub fn new(kind: IsoToolKind, binary: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    pub fn kind(&self) -> IsoToolKind {
        self.kind
    }

    /// Locate every available builder, in preference order.
    ///
    /// Later builders are fallbacks for a build the first one fails.
    pub fn locate_all() -> Result<Vec<Self>, PreconditionError> {
        Self::locate_all_with(find_in_path)
    }

    /// Same as [`IsoTool::locate_all`] with an injectable `PATH` lookup.
    pub fn locate_all_with(
        lookup: impl Fn(&str) -> Option<PathBuf>,
    ) -> Result<Vec<Self>, PreconditionError> {
        let found: Vec<Self> = IsoToolKind::PREFERENCE
            .iter()
            .filter_map(|kind| lookup(kind.binary()).map(|path| Self::new(*kind, path)))
            .collect();
        if found.is_empty() {
            return Err(PreconditionError::NoVolumeBuilder {
                searched: IsoToolKind::PREFERENCE
                    .iter()
                    .map(|k| k.binary().to_string())
                    .collect(),
            });
        }
        Ok(found)
    }
}

#[async_trait]
impl VolumeBuilder for IsoTool {
    fn name(&self) -> &str {
        self.kind.binary()
    }

    async fn build(&self, source: &Path, label: &str, output: &Path) -> Result<(), String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.kind.args(source, label, output));

        if self.kind == IsoToolKind::Hdiutil {
            // Avoids an Objective-C runtime abort when hdiutil forks helpers
            cmd.env("OBJC_DISABLE_INITIALIZE_FORK_SAFETY", "YES");
        }
        run_tool(&mut cmd).await?;

        // hdiutil appends ".iso" to outputs without that extension
        if self.kind == IsoToolKind::Hdiutil && !output.exists() {
            let mut produced = output.as_os_str().to_owned();
            produced.push(".iso");
            let produced = PathBuf::from(produced);
            std::fs::rename(&produced, output).map_err(|e| {
                format!(
                    "failed to move {} to {}: {e}",
                    produced.display(),
                    output.display()
                )
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_follows_preference_order() {
        let tools = IsoTool::locate_all_with(|name| match name {
            "genisoimage" | "xorrisofs" => Some(PathBuf::from(format!("/usr/bin/{name}"))),
            _ => None,
        })
        .unwrap();
        let kinds: Vec<_> = tools.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, [IsoToolKind::Xorrisofs, IsoToolKind::Genisoimage]);
        assert_eq!(tools[0].name(), "xorrisofs");
    }

    #[test]
    fn test_locate_none_available() {
        let err = IsoTool::locate_all_with(|_| None).unwrap_err();
        match err {
            PreconditionError::NoVolumeBuilder { searched } => {
                assert_eq!(searched, ["hdiutil", "mkisofs", "xorrisofs", "genisoimage"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_builder_arguments() {
        let src = Path::new("/w/seeds/seed-init-1");
        let out = Path::new("/w/seeds/seed-1.iso.partial");

        assert_eq!(
            IsoToolKind::Mkisofs.args(src, "cidata", out),
            [
                "-output",
                "/w/seeds/seed-1.iso.partial",
                "-volid",
                "cidata",
                "-joliet",
                "-rock",
                "/w/seeds/seed-init-1"
            ]
        );
        assert_eq!(
            IsoToolKind::Xorrisofs.args(src, "cidata", out),
            [
                "-o",
                "/w/seeds/seed-1.iso.partial",
                "-V",
                "cidata",
                "-J",
                "-R",
                "/w/seeds/seed-init-1"
            ]
        );

        let hdiutil = IsoToolKind::Hdiutil.args(src, "cidata", out);
        assert_eq!(hdiutil[0], "makehybrid");
        assert_eq!(
            &hdiutil[hdiutil.len() - 3..],
            ["-o", "/w/seeds/seed-1.iso.partial", "/w/seeds/seed-init-1"]
        );
    }
}
