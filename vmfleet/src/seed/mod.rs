//! First-boot configuration for instances.
//!
//! - `DocumentBuilder` - Render typed cloud-init documents per instance
//! - `VolumeBuilder` - External ISO builders (`IsoTool`)
//! - `Packager` - Write the seed directory and build the init volume

pub mod builder;
pub mod document;
pub mod packager;

pub use builder::{IsoTool, IsoToolKind, VolumeBuilder};
pub use document::{CloudConfig, DocumentBuilder, GuestSettings, NetworkConfig, SeedDocuments};
pub use packager::{InitVolume, Packager};
