//! User defined bridge networks and static address checks.

use fleetwarden_shared::{BridgeNetwork, NetworkConfig, Subnet};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use super::engine::{ContainerEngine, EngineNetwork};
use crate::error::{ServiceError, ServiceResult};

const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NETWORKS.contains(&name)
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    Some((addr.parse().ok()?, len))
}

fn subnet(cidr: &str) -> Option<Subnet> {
    parse_cidr(cidr).map(|(addr, len)| Subnet {
        addr: addr.to_string(),
        prefix_len: i64::from(len),
    })
}

fn mask(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len) }
}

/// Bridge networks the user created; the engine's defaults are hidden.
pub fn bridge_networks(networks: &[EngineNetwork]) -> Vec<BridgeNetwork> {
    networks
        .iter()
        .filter(|n| n.driver == "bridge" && !is_builtin(&n.name))
        .map(|n| BridgeNetwork {
            name: n.name.clone(),
            subnet: subnet(&n.subnet).unwrap_or_default(),
            ip_range: subnet(&n.ip_range),
            gateway: n.gateway.clone(),
        })
        .collect()
}

/// Validates a requested address against the network's subnet and the
/// addresses already taken, or picks the first free host address when none
/// was requested.
pub fn assign_address(
    network: &EngineNetwork,
    requested: &str,
    prefix_len: i64,
    used: &HashSet<Ipv4Addr>,
) -> ServiceResult<String> {
    let (net_addr, net_len) = parse_cidr(&network.subnet)
        .ok_or_else(|| ServiceError::invalid(format!("network {} has no IPv4 subnet", network.name)))?;
    let net_mask = mask(net_len);
    let base = u32::from(net_addr) & net_mask;

    if !requested.is_empty() {
        let ip: Ipv4Addr = requested
            .parse()
            .map_err(|_| ServiceError::invalid(format!("ip address {}", requested)))?;
        let len = if prefix_len > 0 { prefix_len.min(32) as u8 } else { net_len };
        if len < net_len || u32::from(ip) & net_mask != base {
            return Err(ServiceError::invalid(format!(
                "{}/{} is outside {}",
                requested, len, network.subnet
            )));
        }
        if used.contains(&ip) {
            return Err(ServiceError::invalid(format!("ip address {} is in use", requested)));
        }
        return Ok(requested.to_owned());
    }

    // .0 is the network, .1 the gateway.
    let gateway: Option<Ipv4Addr> = network.gateway.parse().ok();
    let mut candidate = base.saturating_add(2);
    while candidate & net_mask == base && candidate != (base | !net_mask) {
        let ip = Ipv4Addr::from(candidate);
        if !used.contains(&ip) && Some(ip) != gateway {
            return Ok(ip.to_string());
        }
        candidate += 1;
    }
    Err(ServiceError::invalid(format!("no free address left in {}", network.name)))
}

/// Checks every requested network and fills in missing addresses.
/// `container_id` is skipped when collecting taken addresses so an update
/// can keep its own.
pub async fn resolve_networks(
    engine: &dyn ContainerEngine,
    container_id: &str,
    requested: &mut [NetworkConfig],
) -> ServiceResult<()> {
    if requested.is_empty() {
        return Ok(());
    }
    let networks = engine.list_networks().await?;
    let containers = engine.list_containers(true).await?;

    for config in requested.iter_mut() {
        let network = networks
            .iter()
            .find(|n| n.name == config.interface && !is_builtin(&n.name))
            .ok_or_else(|| ServiceError::invalid(format!("network {} does not exist", config.interface)))?;

        let used: HashSet<Ipv4Addr> = containers
            .iter()
            .filter(|c| c.id != container_id)
            .filter_map(|c| c.networks.get(&network.name))
            .filter_map(|ip| ip.parse().ok())
            .collect();

        config.ip_address = assign_address(network, &config.ip_address, config.ip_prefix_len, &used)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> EngineNetwork {
        EngineNetwork {
            name: "net1".to_string(),
            driver: "bridge".to_string(),
            subnet: "172.20.0.0/16".to_string(),
            ip_range: String::new(),
            gateway: "172.20.0.1".to_string(),
        }
    }

    #[test]
    fn only_user_bridges_are_listed() {
        let mut default = net();
        default.name = "bridge".to_string();
        let mut overlay = net();
        overlay.name = "ov".to_string();
        overlay.driver = "overlay".to_string();

        let list = bridge_networks(&[default, overlay, net()]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "net1");
        assert_eq!(
            list[0].subnet,
            Subnet {
                addr: "172.20.0.0".to_string(),
                prefix_len: 16
            }
        );
        assert!(list[0].ip_range.is_none());
    }

    #[test]
    fn requested_addresses_must_fit_and_be_free() {
        let used: HashSet<Ipv4Addr> = ["172.20.0.2".parse().unwrap()].into();
        assert_eq!(assign_address(&net(), "172.20.3.4", 0, &used).unwrap(), "172.20.3.4");
        assert!(assign_address(&net(), "172.20.0.2", 0, &used).is_err());
        assert!(assign_address(&net(), "10.0.0.2", 0, &used).is_err());
        assert!(assign_address(&net(), "172.20.0.9", 8, &used).is_err());
        assert!(assign_address(&net(), "not-an-ip", 0, &used).is_err());
    }

    #[test]
    fn free_address_is_allocated() {
        let used: HashSet<Ipv4Addr> = ["172.20.0.2".parse().unwrap(), "172.20.0.3".parse().unwrap()].into();
        assert_eq!(assign_address(&net(), "", 0, &used).unwrap(), "172.20.0.4");

        let mut tiny = net();
        tiny.subnet = "192.168.5.0/30".to_string();
        tiny.gateway = "192.168.5.1".to_string();
        let used: HashSet<Ipv4Addr> = ["192.168.5.2".parse().unwrap()].into();
        assert!(assign_address(&tiny, "", 0, &used).is_err());
    }
}
