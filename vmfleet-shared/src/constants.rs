//! Shared constants between the host-rendered seed documents and the guest image.
//!
//! These values are conventions baked into the golden image. Changing one here
//! without rebuilding the image breaks first boot.

/// Guest network conventions
pub mod guest_net {
    /// Interface name the golden image assigns to its first virtio NIC.
    pub const INTERFACE: &str = "enp0s1";

    /// Static netplan file rewritten on every boot.
    pub const STATIC_NETPLAN_PATH: &str = "/etc/netplan/01-fleet-static.yaml";

    /// Netplan file cloud-init would generate on its own.
    pub const CLOUD_INIT_NETPLAN_PATH: &str = "/etc/netplan/50-cloud-init.yaml";
}

/// NoCloud seed volume conventions
pub mod seed {
    /// Volume label cloud-init's NoCloud datasource looks for.
    pub const VOLUME_LABEL: &str = "cidata";

    pub const USER_DATA: &str = "user-data";
    pub const META_DATA: &str = "meta-data";
    pub const NETWORK_CONFIG: &str = "network-config";
    pub const DISABLE_NETWORK_CFG: &str = "99-disable-network-config.cfg";
    pub const EXTRA_CLOUD_CFG: &str = "99-cloud-config.cfg";
}

/// Guest account defaults
pub mod account {
    pub const USER: &str = "gns3";
    pub const PASSWORD: &str = "gns3";
    pub const SHELL: &str = "/bin/bash";
    pub const GROUPS: &[&str] = &["sudo", "kvm"];
}

/// Downstream guest service (GNS3 server)
pub mod service {
    pub const NAME: &str = "gns3-server";

    /// API port exposed to students' GUI clients.
    pub const PORT: u16 = 3080;

    /// Console port range opened in the guest firewall.
    pub const CONSOLE_PORTS: (u16, u16) = (5000, 5999);

    pub const REPOSITORY: &str = "https://github.com/GNS3/gns3-server.git";

    /// Where the repository is cloned inside the guest.
    pub const SOURCE_DIR: &str = "/opt/gns3-server";
}
