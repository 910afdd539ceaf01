//! Disk image operations.
//!
//! This module provides per-instance storage management:
//! - `OverlayManager` - Create or reuse COW overlays and variable stores
//! - `OverlayTool` - External overlay creation (`QemuImg`)
//! - `Qcow2Header` - Read-only qcow2 header inspection

pub mod overlay;
pub mod qcow2;

pub use overlay::{
    BaseArtifacts, OverlayManager, OverlayTool, Provisioned, QemuImg, StorageHandle,
};
pub use qcow2::{BackingFormat, Qcow2Header};
