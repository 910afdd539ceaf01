//! Typed first-boot documents for cloud-init's NoCloud datasource.
//!
//! Every document is a serde struct serialized with `serde_yaml`; no value is
//! ever spliced into YAML or shell text by hand. The one file a boot command
//! has to write (the static netplan file) travels as base64.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use vmfleet_shared::constants::{account, guest_net, seed, service};
use vmfleet_shared::errors::{FleetError, FleetResult, InstanceError};

use crate::net::{InstanceIdentity, NetworkSettings, mac_string};

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

// ============================================================================
// Guest settings
// ============================================================================

/// Guest-side conventions and credentials, shared by every instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuestSettings {
    /// Interface the static address is assigned to
    pub interface: String,
    pub user: String,
    pub password: String,
    pub service_port: u16,
    /// Git repository the guest service is installed from
    pub repository: String,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            interface: guest_net::INTERFACE.to_string(),
            user: account::USER.to_string(),
            password: account::PASSWORD.to_string(),
            service_port: service::PORT,
            repository: service::REPOSITORY.to_string(),
        }
    }
}

impl GuestSettings {
    /// Reject values that would be ambiguous in the files they end up in.
    pub fn validate(&self) -> FleetResult<()> {
        let plain = |field: &str, value: &str| -> FleetResult<()> {
            if value.is_empty() || value.chars().any(|c| c.is_control() || c == ':') {
                return Err(FleetError::Config(format!(
                    "guest {field} must be non-empty without control characters or ':'"
                )));
            }
            Ok(())
        };
        plain("interface", &self.interface)?;
        plain("password", &self.password)?;

        if !self
            .user
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
            || self.user.is_empty()
        {
            return Err(FleetError::Config(format!(
                "guest user '{}' is not a valid account name",
                self.user
            )));
        }
        if self.repository.is_empty() || self.repository.starts_with('-') {
            return Err(FleetError::Config(format!(
                "guest repository '{}' is not a valid git URL",
                self.repository
            )));
        }
        Ok(())
    }

    fn home(&self) -> String {
        format!("/home/{}", self.user)
    }

    fn server_config_path(&self) -> String {
        format!("{}/.config/GNS3/2.2/gns3_server.conf", self.home())
    }

    fn projects_path(&self) -> String {
        format!("{}/GNS3/projects", self.home())
    }
}

// ============================================================================
// user-data
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    pub preserve_hostname: bool,
    pub hostname: String,
    pub fqdn: String,
    pub ssh_pwauth: bool,
    pub users: Vec<UserEntry>,
    pub chpasswd: Chpasswd,
    pub package_update: bool,
    pub packages: Vec<String>,
    pub write_files: Vec<WriteFile>,
    /// Run on every boot, before networking is up
    pub bootcmd: Vec<Vec<String>>,
    /// Run once per instance, at the end of first boot
    pub runcmd: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    pub name: String,
    pub groups: Vec<String>,
    pub shell: String,
    pub sudo: String,
    pub lock_passwd: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chpasswd {
    pub expire: bool,
    pub users: Vec<ChpasswdUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChpasswdUser {
    pub name: String,
    pub password: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteFile {
    pub path: String,
    pub owner: String,
    pub permissions: String,
    pub content: String,
    /// Write after users exist (final stage)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub defer: bool,
}

// ============================================================================
// network-config / netplan
// ============================================================================

/// Netplan v2 network block, also accepted by cloud-init as `network-config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub version: u8,
    pub ethernets: BTreeMap<String, EthernetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EthernetConfig {
    #[serde(rename = "match")]
    pub match_mac: MacMatch,
    #[serde(rename = "set-name")]
    pub set_name: String,
    pub dhcp4: bool,
    pub dhcp6: bool,
    pub addresses: Vec<String>,
    pub routes: Vec<Route>,
    pub nameservers: NameServers,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacMatch {
    pub macaddress: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub to: String,
    pub via: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameServers {
    pub addresses: Vec<Ipv4Addr>,
}

/// The file netplan reads from `/etc/netplan`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetplanFile {
    pub network: NetworkConfig,
}

// ============================================================================
// meta-data and override fragments
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MetaData {
    pub instance_id: String,
    pub local_hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkToggle {
    pub config: String,
}

/// `network: {config: disabled}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisableNetworkFragment {
    pub network: NetworkToggle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraCloudFragment {
    pub cloud_final_modules: Vec<Vec<String>>,
    pub network: NetworkToggle,
}

fn network_disabled() -> NetworkToggle {
    NetworkToggle {
        config: "disabled".to_string(),
    }
}

// ============================================================================
// Rendered set
// ============================================================================

/// Everything that goes into one instance's seed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedDocuments {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
    pub disable_network_cfg: String,
    pub extra_cloud_cfg: String,
}

impl SeedDocuments {
    /// (file name, content) pairs in a stable order.
    pub fn files(&self) -> [(&'static str, &str); 5] {
        [
            (seed::USER_DATA, self.user_data.as_str()),
            (seed::META_DATA, self.meta_data.as_str()),
            (seed::NETWORK_CONFIG, self.network_config.as_str()),
            (seed::DISABLE_NETWORK_CFG, self.disable_network_cfg.as_str()),
            (seed::EXTRA_CLOUD_CFG, self.extra_cloud_cfg.as_str()),
        ]
    }
}

/// Renders the seed documents of an instance.
#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    settings: GuestSettings,
}

fn argv<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl DocumentBuilder {
    pub fn new(settings: GuestSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GuestSettings {
        &self.settings
    }

    /// Render every document for `identity`. Performs no I/O.
    pub fn render(
        &self,
        identity: &InstanceIdentity,
        network: &NetworkSettings,
    ) -> Result<SeedDocuments, InstanceError> {
        let render_err = |what: &str, e: serde_yaml::Error| InstanceError::RenderFailed {
            index: identity.index,
            reason: format!("serializing {what}: {e}"),
        };

        let network_config = self.network_config(identity, network);
        let cloud_config = self
            .cloud_config(identity, network)
            .map_err(|e| render_err("netplan file", e))?;

        let meta_data = MetaData {
            instance_id: identity.name.clone(),
            local_hostname: identity.name.clone(),
        };
        let extra = ExtraCloudFragment {
            cloud_final_modules: vec![argv(["scripts-per-once", "always"])],
            network: network_disabled(),
        };

        Ok(SeedDocuments {
            user_data: format!(
                "{CLOUD_CONFIG_HEADER}{}",
                serde_yaml::to_string(&cloud_config).map_err(|e| render_err("user-data", e))?
            ),
            meta_data: serde_yaml::to_string(&meta_data).map_err(|e| render_err("meta-data", e))?,
            network_config: serde_yaml::to_string(&network_config)
                .map_err(|e| render_err("network-config", e))?,
            disable_network_cfg: disable_network_fragment()
                .map_err(|e| render_err("network override", e))?,
            extra_cloud_cfg: serde_yaml::to_string(&extra)
                .map_err(|e| render_err("cloud override", e))?,
        })
    }

    /// Static network block for the instance's interface.
    pub fn network_config(
        &self,
        identity: &InstanceIdentity,
        network: &NetworkSettings,
    ) -> NetworkConfig {
        let ethernet = EthernetConfig {
            match_mac: MacMatch {
                macaddress: mac_string(&identity.mac),
            },
            set_name: self.settings.interface.clone(),
            dhcp4: false,
            dhcp6: false,
            addresses: vec![format!("{}/{}", identity.ip, network.prefix_len)],
            routes: vec![Route {
                to: "0.0.0.0/0".to_string(),
                via: network.gateway,
            }],
            nameservers: NameServers {
                addresses: network.name_servers.clone(),
            },
        };

        NetworkConfig {
            version: 2,
            ethernets: BTreeMap::from([(self.settings.interface.clone(), ethernet)]),
        }
    }

    /// The `#cloud-config` body.
    pub fn cloud_config(
        &self,
        identity: &InstanceIdentity,
        network: &NetworkSettings,
    ) -> Result<CloudConfig, serde_yaml::Error> {
        let s = &self.settings;
        let netplan = serde_yaml::to_string(&NetplanFile {
            network: self.network_config(identity, network),
        })?;

        Ok(CloudConfig {
            preserve_hostname: false,
            hostname: identity.name.clone(),
            fqdn: format!("{}.local", identity.name),
            ssh_pwauth: true,
            users: vec![UserEntry {
                name: s.user.clone(),
                groups: account::GROUPS.iter().map(|g| g.to_string()).collect(),
                shell: account::SHELL.to_string(),
                sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
                lock_passwd: false,
            }],
            chpasswd: Chpasswd {
                expire: false,
                users: vec![ChpasswdUser {
                    name: s.user.clone(),
                    password: s.password.clone(),
                    kind: "text".to_string(),
                }],
            },
            package_update: true,
            packages: [
                "openssh-server",
                "python3",
                "python3-pip",
                "git",
                "ufw",
                "qemu-guest-agent",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            write_files: self.write_files()?,
            bootcmd: self.boot_commands(&netplan),
            runcmd: self.post_boot_commands(),
        })
    }

    fn write_files(&self) -> Result<Vec<WriteFile>, serde_yaml::Error> {
        let s = &self.settings;
        let owner = format!("{0}:{0}", s.user);

        Ok(vec![
            WriteFile {
                path: "/etc/ssh/sshd_config.d/99-cloud-ssh.conf".to_string(),
                owner: "root:root".to_string(),
                permissions: "0644".to_string(),
                content: [
                    "PasswordAuthentication yes",
                    "PubkeyAuthentication yes",
                    "PermitRootLogin no",
                    "KbdInteractiveAuthentication no",
                    "UsePAM yes",
                    "",
                ]
                .join("\n"),
                defer: false,
            },
            WriteFile {
                path: format!("/etc/cloud/cloud.cfg.d/{}", seed::DISABLE_NETWORK_CFG),
                owner: "root:root".to_string(),
                permissions: "0644".to_string(),
                content: disable_network_fragment()?,
                defer: false,
            },
            WriteFile {
                path: s.server_config_path(),
                owner: owner.clone(),
                permissions: "0600".to_string(),
                content: self.server_config(),
                defer: true,
            },
            WriteFile {
                path: format!("/etc/systemd/system/{}.service", service::NAME),
                owner: "root:root".to_string(),
                permissions: "0644".to_string(),
                content: self.service_unit(),
                defer: false,
            },
        ])
    }

    /// GNS3 server configuration (INI).
    fn server_config(&self) -> String {
        let s = &self.settings;
        [
            "[Server]".to_string(),
            "host = 0.0.0.0".to_string(),
            format!("port = {}", s.service_port),
            "auth = True".to_string(),
            format!("user = {}", s.user),
            format!("password = {}", s.password),
            format!("projects_path = {}", s.projects_path()),
            String::new(),
        ]
        .join("\n")
    }

    fn service_unit(&self) -> String {
        let s = &self.settings;
        [
            "[Unit]".to_string(),
            "Description=GNS3 server".to_string(),
            "After=network-online.target".to_string(),
            "Wants=network-online.target".to_string(),
            String::new(),
            "[Service]".to_string(),
            "Type=simple".to_string(),
            format!("User={}", s.user),
            format!("Group={}", s.user),
            format!(
                "ExecStart={}/.local/bin/gns3server --config {}",
                s.home(),
                s.server_config_path()
            ),
            "Restart=on-failure".to_string(),
            "RestartSec=5".to_string(),
            String::new(),
            "[Install]".to_string(),
            "WantedBy=multi-user.target".to_string(),
            String::new(),
        ]
        .join("\n")
    }

    /// Every-boot commands: rewrite the static network file, drop the
    /// generated one, apply, and reset the machine id once per clone.
    ///
    /// The reset uses the `instance` frequency: its semaphore is keyed by the
    /// clone's instance-id, so a marker baked into the golden image by an
    /// earlier boot cannot suppress it.
    fn boot_commands(&self, netplan: &str) -> Vec<Vec<String>> {
        let encoded = BASE64.encode(netplan);
        vec![
            argv(["mkdir", "-p", "/etc/netplan"]),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "echo {encoded} | base64 -d > {}",
                    guest_net::STATIC_NETPLAN_PATH
                ),
            ],
            argv(["chmod", "600", guest_net::STATIC_NETPLAN_PATH]),
            argv(["rm", "-f", guest_net::CLOUD_INIT_NETPLAN_PATH]),
            argv(["sh", "-c", "netplan apply || true"]),
            argv([
                "cloud-init-per",
                "instance",
                "reset-machine-id",
                "sh",
                "-c",
                "rm -f /etc/machine-id /var/lib/dbus/machine-id && systemd-machine-id-setup",
            ]),
        ]
    }

    /// First-boot commands: install the guest service from source for the
    /// account, supervise it with systemd, open the firewall.
    fn post_boot_commands(&self) -> Vec<Vec<String>> {
        let s = &self.settings;
        let owner = format!("{0}:{0}", s.user);
        let port = format!("{}/tcp", s.service_port);
        let consoles = format!(
            "{}:{}/tcp",
            service::CONSOLE_PORTS.0,
            service::CONSOLE_PORTS.1
        );

        vec![
            argv(["sh", "-c", "systemctl enable --now qemu-guest-agent || true"]),
            argv([
                "sh",
                "-c",
                "systemctl enable --now ssh || systemctl enable --now sshd || true",
            ]),
            vec![
                "git".to_string(),
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                "--".to_string(),
                s.repository.clone(),
                service::SOURCE_DIR.to_string(),
            ],
            vec![
                "chown".to_string(),
                "-R".to_string(),
                owner.clone(),
                service::SOURCE_DIR.to_string(),
            ],
            vec![
                "mkdir".to_string(),
                "-p".to_string(),
                s.projects_path(),
            ],
            vec![
                "chown".to_string(),
                "-R".to_string(),
                owner,
                format!("{}/GNS3", s.home()),
            ],
            vec![
                "sudo".to_string(),
                "-u".to_string(),
                s.user.clone(),
                "-H".to_string(),
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--user".to_string(),
                "--break-system-packages".to_string(),
                service::SOURCE_DIR.to_string(),
            ],
            argv(["systemctl", "daemon-reload"]),
            vec![
                "systemctl".to_string(),
                "enable".to_string(),
                "--now".to_string(),
                format!("{}.service", service::NAME),
            ],
            argv(["ufw", "allow", "OpenSSH"]),
            vec!["ufw".to_string(), "allow".to_string(), port],
            vec!["ufw".to_string(), "allow".to_string(), consoles],
            argv(["ufw", "--force", "enable"]),
        ]
    }
}

fn disable_network_fragment() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&DisableNetworkFragment {
        network: network_disabled(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{allocate, instance_mac};
    use crate::request::FleetRequest;
    use uuid::Uuid;

    fn identity(index: u32) -> InstanceIdentity {
        InstanceIdentity {
            index,
            name: format!("overlay-{index}"),
            ip: Ipv4Addr::new(10, 193, 80, 100 + index as u8),
            mac: instance_mac(index),
            uuid: Uuid::new_v4(),
        }
    }

    fn network() -> NetworkSettings {
        NetworkSettings {
            gateway: Ipv4Addr::new(10, 193, 80, 64),
            prefix_len: 24,
            name_servers: vec![Ipv4Addr::new(10, 193, 80, 64), Ipv4Addr::new(8, 8, 8, 8)],
        }
    }

    #[test]
    fn test_user_data_is_cloud_config() {
        let docs = DocumentBuilder::default()
            .render(&identity(1), &network())
            .unwrap();
        assert!(docs.user_data.starts_with("#cloud-config\n"));

        let parsed: CloudConfig = serde_yaml::from_str(&docs.user_data).unwrap();
        assert_eq!(parsed.hostname, "overlay-1");
        assert_eq!(parsed.users[0].name, "gns3");
        assert_eq!(parsed.users[0].sudo, "ALL=(ALL) NOPASSWD:ALL");
        assert!(parsed.packages.iter().any(|p| p == "qemu-guest-agent"));
    }

    #[test]
    fn test_network_config_is_static() {
        let docs = DocumentBuilder::default()
            .render(&identity(2), &network())
            .unwrap();
        let parsed: NetworkConfig = serde_yaml::from_str(&docs.network_config).unwrap();
        let eth = &parsed.ethernets["enp0s1"];

        assert_eq!(parsed.version, 2);
        assert!(!eth.dhcp4);
        assert_eq!(eth.addresses, ["10.193.80.102/24"]);
        assert_eq!(eth.routes[0].via, Ipv4Addr::new(10, 193, 80, 64));
        assert_eq!(eth.nameservers.addresses.len(), 2);
        assert_eq!(eth.match_mac.macaddress, "52:54:00:f1:33:12");
    }

    #[test]
    fn test_boot_commands_embed_netplan_file() {
        let builder = DocumentBuilder::default();
        let config = builder.cloud_config(&identity(3), &network()).unwrap();

        let write = config
            .bootcmd
            .iter()
            .find(|cmd| cmd.len() == 3 && cmd[2].contains("base64 -d"))
            .expect("netplan write command");
        let encoded = write[2]
            .strip_prefix("echo ")
            .and_then(|rest| rest.split(' ').next())
            .unwrap();
        let decoded = String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap();
        let netplan: NetplanFile = serde_yaml::from_str(&decoded).unwrap();
        assert_eq!(
            netplan.network.ethernets["enp0s1"].addresses,
            ["10.193.80.103/24"]
        );

        let flat: Vec<String> = config.bootcmd.iter().map(|c| c.join(" ")).collect();
        assert!(flat.iter().any(|c| c.contains("rm -f /etc/netplan/50-cloud-init.yaml")));
        assert!(flat.iter().any(|c| c.contains("netplan apply")));
        assert!(flat.iter().any(|c| c.contains("machine-id")));
    }

    #[test]
    fn test_machine_id_reset_is_per_instance() {
        let config = DocumentBuilder::default()
            .cloud_config(&identity(1), &network())
            .unwrap();
        let reset = config
            .bootcmd
            .iter()
            .find(|c| c.iter().any(|arg| arg == "reset-machine-id"))
            .expect("machine-id reset command");

        assert_eq!(reset[..3], ["cloud-init-per", "instance", "reset-machine-id"]);
        assert!(reset.iter().all(|arg| arg != "once"));
    }

    #[test]
    fn test_post_boot_installs_and_opens_service() {
        let config = DocumentBuilder::default()
            .cloud_config(&identity(1), &network())
            .unwrap();
        let flat: Vec<String> = config.runcmd.iter().map(|c| c.join(" ")).collect();

        assert!(flat.iter().any(|c| c.starts_with("git clone")));
        assert!(flat.iter().any(|c| c.contains("pip install --user")));
        assert!(flat.iter().any(|c| c == "systemctl enable --now gns3-server.service"));
        assert!(flat.iter().any(|c| c == "ufw allow 3080/tcp"));

        let unit = config
            .write_files
            .iter()
            .find(|f| f.path.ends_with("gns3-server.service"))
            .unwrap();
        assert!(unit.content.contains("User=gns3"));

        let server = config
            .write_files
            .iter()
            .find(|f| f.path.ends_with("gns3_server.conf"))
            .unwrap();
        assert!(server.defer);
        assert!(server.content.contains("port = 3080"));
        assert!(server.content.contains("auth = True"));
        assert!(server.content.contains("projects_path = /home/gns3/GNS3/projects"));
    }

    #[test]
    fn test_hostile_values_stay_data() {
        let settings = GuestSettings {
            password: "p@ss'; rm -rf / #\"".to_string(),
            ..Default::default()
        };
        settings.validate().unwrap();
        let config = DocumentBuilder::new(settings)
            .cloud_config(&identity(1), &network())
            .unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: CloudConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.chpasswd.users[0].password, "p@ss'; rm -rf / #\"");
    }

    #[test]
    fn test_settings_validation() {
        let bad_user = GuestSettings {
            user: "Root User".to_string(),
            ..Default::default()
        };
        assert!(bad_user.validate().is_err());

        let bad_password = GuestSettings {
            password: "two\nlines".to_string(),
            ..Default::default()
        };
        assert!(bad_password.validate().is_err());

        let bad_repo = GuestSettings {
            repository: "--upload-pack=evil".to_string(),
            ..Default::default()
        };
        assert!(bad_repo.validate().is_err());
    }

    #[test]
    fn test_meta_data_and_fragments() {
        let alloc = allocate(&FleetRequest::default()).unwrap();
        let docs = DocumentBuilder::default()
            .render(&alloc.identities[0], &alloc.network)
            .unwrap();

        let meta: MetaData = serde_yaml::from_str(&docs.meta_data).unwrap();
        assert_eq!(meta.instance_id, "overlay-1");
        assert!(docs.meta_data.contains("local-hostname: overlay-1"));

        let disable: DisableNetworkFragment =
            serde_yaml::from_str(&docs.disable_network_cfg).unwrap();
        assert_eq!(disable.network.config, "disabled");

        let names: Vec<_> = docs.files().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            [
                "user-data",
                "meta-data",
                "network-config",
                "99-disable-network-config.cfg",
                "99-cloud-config.cfg"
            ]
        );
    }
}
