//! Deterministic identity allocation for a fleet.
//!
//! Every value except the UUID is a pure function of the request and the
//! 1-based instance index, so re-running with the same request yields the
//! same names, addresses and MACs.

use super::constants::{MAC_BASE_OFFSET, MAC_FLEET_BYTES, MAC_OUI, MAX_FLEET_SIZE};
use crate::request::FleetRequest;
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use serde::Serialize;
use std::net::Ipv4Addr;
use uuid::Uuid;
use vmfleet_shared::errors::AllocationError;

/// Identity of one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// 1-based position in the fleet
    pub index: u32,
    /// Hostname, `<prefix>-<index>`
    pub name: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr6,
    /// Fresh per launch, passed to the engine as the SMBIOS UUID
    pub uuid: Uuid,
}

/// Network settings shared by every instance of a fleet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetworkSettings {
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    /// Gateway first, then extra servers, without duplicates
    pub name_servers: Vec<Ipv4Addr>,
}

/// Result of allocating a whole fleet.
#[derive(Clone, Debug)]
pub struct FleetAllocation {
    pub network: NetworkSettings,
    pub identities: Vec<InstanceIdentity>,
}

/// Address of instance `index` (1-based): `start + index - 1`.
pub fn instance_ip(start: Ipv4Addr, index: u32) -> Result<Ipv4Addr, AllocationError> {
    if index == 0 {
        return Err(AllocationError::IndexOutOfRange { index, count: 0 });
    }
    u32::from(start)
        .checked_add(index - 1)
        .map(Ipv4Addr::from)
        .ok_or(AllocationError::InvalidRange {
            start,
            count: index,
        })
}

/// MAC of instance `index`: fixed prefix, last byte `(MAC_BASE_OFFSET + index) mod 256`.
///
/// Unique only within one fleet of at most [`MAX_FLEET_SIZE`] instances.
pub fn instance_mac(index: u32) -> MacAddr6 {
    let last = (u32::from(MAC_BASE_OFFSET) + index) % 256;
    MacAddr6::new(
        MAC_OUI[0],
        MAC_OUI[1],
        MAC_OUI[2],
        MAC_FLEET_BYTES[0],
        MAC_FLEET_BYTES[1],
        last as u8,
    )
}

/// Lowercase colon-separated form used on engine command lines and in netplan.
pub fn mac_string(mac: &MacAddr6) -> String {
    mac.to_string().to_lowercase()
}

pub fn instance_name(prefix: &str, index: u32) -> String {
    format!("{prefix}-{index}")
}

/// First usable host of `start/prefix_len`.
///
/// For /31 and /32 there is no separate network address, so the network
/// address itself is returned.
pub fn guess_gateway(start: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Addr, AllocationError> {
    let net = Ipv4Network::new(start, prefix_len)
        .map_err(|_| AllocationError::InvalidPrefix { prefix: prefix_len })?;
    let network = u32::from(net.network());
    if prefix_len >= 31 {
        Ok(Ipv4Addr::from(network))
    } else {
        Ok(Ipv4Addr::from(network + 1))
    }
}

/// Validate the request's address parameters and allocate every identity.
///
/// Fails before producing anything when the batch as a whole is invalid.
pub fn allocate(request: &FleetRequest) -> Result<FleetAllocation, AllocationError> {
    if request.count < 1 {
        return Err(AllocationError::EmptyFleet {
            count: request.count,
        });
    }
    if request.prefix_len > 32 {
        return Err(AllocationError::InvalidPrefix {
            prefix: request.prefix_len,
        });
    }

    let count = u32::try_from(request.count).map_err(|_| AllocationError::InvalidRange {
        start: request.start_address,
        count: u32::MAX,
    })?;
    if count > MAX_FLEET_SIZE {
        return Err(AllocationError::MacSpaceExhausted {
            count,
            max: MAX_FLEET_SIZE,
        });
    }

    // Last address must exist before anything else is derived
    instance_ip(request.start_address, count).map_err(|_| AllocationError::InvalidRange {
        start: request.start_address,
        count,
    })?;

    let gateway = match request.gateway {
        Some(gw) => gw,
        None => {
            let gw = guess_gateway(request.start_address, request.prefix_len)?;
            tracing::info!(gateway = %gw, "Derived gateway from start address");
            gw
        }
    };

    let mut name_servers = vec![gateway];
    for server in &request.extra_name_servers {
        if !name_servers.contains(server) {
            name_servers.push(*server);
        }
    }

    let subnet = Ipv4Network::new(request.start_address, request.prefix_len)
        .map_err(|_| AllocationError::InvalidPrefix {
            prefix: request.prefix_len,
        })?;

    let mut identities = Vec::with_capacity(count as usize);
    for index in 1..=count {
        let ip = instance_ip(request.start_address, index)?;

        if ip == gateway {
            return Err(AllocationError::GatewayCollision { index, address: ip });
        }
        if !subnet.contains(ip) {
            tracing::warn!(
                index,
                ip = %ip,
                subnet = %subnet,
                "Instance address leaves the start address's subnet"
            );
        } else if request.prefix_len < 31 && (ip == subnet.network() || ip == subnet.broadcast())
        {
            tracing::warn!(index, ip = %ip, "Instance address is a network or broadcast address");
        }

        identities.push(InstanceIdentity {
            index,
            name: instance_name(&request.name_prefix, index),
            ip,
            mac: instance_mac(index),
            uuid: Uuid::new_v4(),
        });
    }

    Ok(FleetAllocation {
        network: NetworkSettings {
            gateway,
            prefix_len: request.prefix_len,
            name_servers,
        },
        identities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn request(count: i64, start: [u8; 4]) -> FleetRequest {
        FleetRequest::new(count, Ipv4Addr::from(start))
    }

    #[test]
    fn test_three_instance_scenario() {
        let alloc = allocate(&request(3, [10, 193, 80, 101])).unwrap();
        let ips: Vec<_> = alloc.identities.iter().map(|i| i.ip.to_string()).collect();
        let names: Vec<_> = alloc.identities.iter().map(|i| i.name.as_str()).collect();

        assert_eq!(ips, ["10.193.80.101", "10.193.80.102", "10.193.80.103"]);
        assert_eq!(names, ["overlay-1", "overlay-2", "overlay-3"]);
        assert_eq!(alloc.network.gateway, Ipv4Addr::new(10, 193, 80, 1));
    }

    #[test]
    fn test_rejects_empty_and_negative_counts() {
        assert_eq!(
            allocate(&request(0, [10, 0, 0, 2])).unwrap_err(),
            AllocationError::EmptyFleet { count: 0 }
        );
        assert_eq!(
            allocate(&request(-4, [10, 0, 0, 2])).unwrap_err(),
            AllocationError::EmptyFleet { count: -4 }
        );
    }

    #[test]
    fn test_rejects_overflowing_range() {
        let err = allocate(&request(3, [255, 255, 255, 254])).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidRange { count: 3, .. }));

        // Exactly reaching the last address is fine
        let ok = allocate(
            &request(2, [255, 255, 255, 254]).with_gateway(Ipv4Addr::new(255, 255, 255, 1)),
        )
        .unwrap();
        assert_eq!(ok.identities[1].ip, Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_rejects_invalid_prefix() {
        let err = allocate(&request(1, [10, 0, 0, 2]).with_prefix_len(33)).unwrap_err();
        assert_eq!(err, AllocationError::InvalidPrefix { prefix: 33 });
    }

    #[test]
    fn test_rejects_fleet_larger_than_mac_space() {
        let err = allocate(&request(257, [10, 0, 0, 2])).unwrap_err();
        assert_eq!(
            err,
            AllocationError::MacSpaceExhausted {
                count: 257,
                max: 256
            }
        );
    }

    #[test]
    fn test_rejects_gateway_inside_range() {
        let req = request(5, [10, 0, 0, 10]).with_gateway(Ipv4Addr::new(10, 0, 0, 12));
        assert_eq!(
            allocate(&req).unwrap_err(),
            AllocationError::GatewayCollision {
                index: 3,
                address: Ipv4Addr::new(10, 0, 0, 12)
            }
        );
    }

    #[test]
    fn test_name_servers_deduplicated_behind_gateway() {
        let req = request(1, [10, 193, 80, 101])
            .with_gateway(Ipv4Addr::new(10, 193, 80, 64))
            .with_name_servers([
                Ipv4Addr::new(10, 193, 80, 64),
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(8, 8, 8, 8),
            ]);
        let alloc = allocate(&req).unwrap();
        assert_eq!(
            alloc.network.name_servers,
            [Ipv4Addr::new(10, 193, 80, 64), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }

    #[test]
    fn test_guess_gateway_edge_prefixes() {
        let start = Ipv4Addr::new(192, 168, 7, 77);
        assert_eq!(guess_gateway(start, 24).unwrap(), Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(guess_gateway(start, 16).unwrap(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(guess_gateway(start, 32).unwrap(), start);
        assert_eq!(guess_gateway(start, 31).unwrap(), Ipv4Addr::new(192, 168, 7, 76));
        assert!(guess_gateway(start, 40).is_err());
    }

    #[test]
    fn test_mac_layout() {
        assert_eq!(mac_string(&instance_mac(1)), "52:54:00:f1:33:11");
        assert_eq!(mac_string(&instance_mac(240)), "52:54:00:f1:33:00");
    }

    #[test]
    fn test_uuids_differ_between_allocations() {
        let a = allocate(&request(2, [10, 0, 0, 2])).unwrap();
        let b = allocate(&request(2, [10, 0, 0, 2])).unwrap();
        assert_ne!(a.identities[0].uuid, b.identities[0].uuid);
        assert_ne!(a.identities[0].uuid, a.identities[1].uuid);
        // Everything else is deterministic
        assert_eq!(a.identities[0].mac, b.identities[0].mac);
        assert_eq!(a.identities[1].ip, b.identities[1].ip);
    }

    proptest! {
        #[test]
        fn prop_ips_strictly_increase_by_one(start in any::<u32>(), count in 1u32..=256) {
            let start_ip = Ipv4Addr::from(start);
            let req = FleetRequest::new(count as i64, start_ip)
                .with_prefix_len(0)
                .with_gateway(Ipv4Addr::from(start.wrapping_sub(1)));

            match allocate(&req) {
                Ok(alloc) => {
                    prop_assert_eq!(alloc.identities.len(), count as usize);
                    for pair in alloc.identities.windows(2) {
                        prop_assert_eq!(u32::from(pair[1].ip), u32::from(pair[0].ip) + 1);
                    }
                }
                Err(AllocationError::InvalidRange { .. }) => {
                    prop_assert!(start.checked_add(count - 1).is_none());
                }
                Err(AllocationError::GatewayCollision { .. }) => {
                    // start == 0 wraps the gateway to 255.255.255.255
                    prop_assert!(start.checked_sub(1).is_none());
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }

        #[test]
        fn prop_macs_unique_within_fleet(count in 1u32..=256) {
            let macs: HashSet<_> = (1..=count).map(instance_mac).collect();
            prop_assert_eq!(macs.len(), count as usize);
        }
    }
}
