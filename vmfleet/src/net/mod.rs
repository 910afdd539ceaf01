//! Instance network identity.
//!
//! - `allocate` - Validate a request and derive every instance's identity
//! - `InstanceIdentity` - Name, IP, MAC and UUID of one instance
//! - `NetworkSettings` - Gateway, prefix and name servers shared by the fleet

pub mod alloc;
pub mod constants;

pub use alloc::{
    FleetAllocation, InstanceIdentity, NetworkSettings, allocate, guess_gateway, instance_ip,
    instance_mac, instance_name, mac_string,
};
