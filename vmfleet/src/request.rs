//! Fleet request: what to provision.

use crate::net::constants::DEFAULT_PREFIX_LEN;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use vmfleet_shared::errors::{FleetError, FleetResult};

/// Per-instance engine resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Virtual CPUs per instance (default: 4)
    pub vcpus: u32,

    /// Memory in MiB per instance (default: 4096)
    pub memory_mib: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: 4,
            memory_mib: 4096,
        }
    }
}

/// What the caller asked for.
///
/// `count` is signed so that a negative request from the CLI reaches the
/// allocator and is rejected there with an allocation error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetRequest {
    pub count: i64,
    pub start_address: Ipv4Addr,

    /// Gateway; derived from `start_address/prefix_len` when absent.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,

    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Extra name servers, appended after the gateway.
    #[serde(default)]
    pub extra_name_servers: Vec<Ipv4Addr>,

    /// Instance names are `<name_prefix>-<index>`.
    pub name_prefix: String,

    /// Host interface the instances are bridged onto.
    pub bridge: String,

    #[serde(default)]
    pub resources: Resources,
}

fn default_prefix_len() -> u8 {
    DEFAULT_PREFIX_LEN
}

impl Default for FleetRequest {
    fn default() -> Self {
        Self {
            count: 3,
            start_address: Ipv4Addr::new(10, 193, 80, 101),
            gateway: None,
            prefix_len: DEFAULT_PREFIX_LEN,
            extra_name_servers: Vec::new(),
            name_prefix: "overlay".to_string(),
            bridge: "en1".to_string(),
            resources: Resources::default(),
        }
    }
}

impl FleetRequest {
    pub fn new(count: i64, start_address: Ipv4Addr) -> Self {
        Self {
            count,
            start_address,
            ..Default::default()
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    pub fn with_name_servers(mut self, servers: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.extra_name_servers = servers.into_iter().collect();
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Validate fields that are not part of address allocation.
    ///
    /// Names become guest hostnames, so the prefix must be a hostname label.
    pub fn validate(&self) -> FleetResult<()> {
        let prefix = &self.name_prefix;
        if prefix.is_empty() {
            return Err(FleetError::Config("name prefix must not be empty".into()));
        }
        if prefix.starts_with('-')
            || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(FleetError::Config(format!(
                "name prefix '{prefix}' is not a valid hostname label"
            )));
        }
        // "<prefix>-<index>" must fit a 63-byte label with up to 3 index digits
        if prefix.len() > 59 {
            return Err(FleetError::Config(format!(
                "name prefix '{prefix}' is longer than 59 characters"
            )));
        }
        if self.bridge.trim().is_empty() {
            return Err(FleetError::Config("bridge interface must not be empty".into()));
        }
        if self.resources.vcpus == 0 || self.resources.memory_mib == 0 {
            return Err(FleetError::Config(
                "vcpus and memory must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
