//! vmfleet - provision fleets of copy-on-write QEMU instances
//!
//! Every instance is cloned from one golden image through a qcow2 overlay,
//! receives its identity (hostname, static address, account, guest service)
//! through a cloud-init NoCloud seed volume, and is launched as an
//! independent engine process bridged onto the host network.

pub mod auth;
pub mod disk;
pub mod fleet;
pub mod layout;
pub mod net;
pub mod request;
pub mod seed;
pub mod util;
pub mod vmm;

pub use auth::{AuthContext, AuthMode};
pub use fleet::{
    Fleet, FleetOptions, FleetPlan, FleetSummary, FleetTools, InstanceStatus, LaunchedInstance,
};
pub use layout::{FleetLayout, InstanceLayout};
pub use net::{FleetAllocation, InstanceIdentity, NetworkSettings, allocate};
pub use request::{FleetRequest, Resources};
pub use vmfleet_shared::errors::{FleetError, FleetResult};
