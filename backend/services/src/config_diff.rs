//! Comparisons between a container's current configuration and a requested
//! change, used to decide which permission an update needs and whether a
//! security push to the agent is required at all.

use fleetwarden_shared::rpc::UpdateContainerRequest;
use fleetwarden_shared::{
    ContainerConfigs, FileProtection, NetworkConfig, NetworkRuleList, ProcProtection,
    ResourceLimit, RestartPolicy, SecurityConfig,
};

const EPSILON: f64 = 1e-9;

pub struct ConfigComparator;

impl ConfigComparator {
    /// True when the request touches resource limits, restart policy or
    /// networks in a way that differs from `current`.
    pub fn basic_changed(current: &ContainerConfigs, req: &UpdateContainerRequest) -> bool {
        if let Some(limit) = &req.resource_limit {
            let cur = current.resource_limit.clone().unwrap_or_default();
            if Self::resource_changed(&cur, limit) {
                return true;
            }
        }
        if let Some(policy) = &req.restart_policy {
            let cur = current.restart_policy.clone().unwrap_or_default();
            if Self::restart_changed(&cur, policy) {
                return true;
            }
        }
        if let Some(networks) = &req.networks {
            if Self::networks_changed(&current.networks, networks) {
                return true;
            }
        }
        false
    }

    /// True when `requested` differs from the stored config. `None` means
    /// "leave as is".
    pub fn security_changed(current: &SecurityConfig, requested: Option<&SecurityConfig>) -> bool {
        match requested {
            None => false,
            Some(req) => Normalized::from(current) != Normalized::from(req),
        }
    }

    /// An unrestricted config needs no security permission to set.
    pub fn is_unrestricted(cfg: &SecurityConfig) -> bool {
        Normalized::from(cfg) == Normalized::from(&SecurityConfig::default())
    }

    fn resource_changed(cur: &ResourceLimit, req: &ResourceLimit) -> bool {
        !approx_eq(cur.cpu_limit, req.cpu_limit)
            || cur.cpu_prio != req.cpu_prio
            || !approx_eq(cur.memory_limit, req.memory_limit)
            || !approx_eq(cur.memory_soft_limit, req.memory_soft_limit)
            || !approx_eq(cur.disk_limit, req.disk_limit)
    }

    fn restart_changed(cur: &RestartPolicy, req: &RestartPolicy) -> bool {
        restart_name(&cur.name) != restart_name(&req.name) || cur.max_retry != req.max_retry
    }

    fn networks_changed(cur: &[NetworkConfig], req: &[NetworkConfig]) -> bool {
        network_keys(cur) != network_keys(req)
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

fn restart_name(name: &str) -> &str {
    if name.is_empty() { "no" } else { name }
}

fn network_keys(list: &[NetworkConfig]) -> Vec<(&str, &str, &str)> {
    let mut keys: Vec<_> = list
        .iter()
        .map(|n| {
            (
                n.interface.as_str(),
                n.ip_address.as_str(),
                n.mac_address.as_str(),
            )
        })
        .collect();
    keys.sort();
    keys
}

/// Order-insensitive view where a missing protection equals "off, empty".
#[derive(PartialEq)]
struct Normalized {
    disable_external_network: bool,
    disable_cmd_operation: bool,
    proc: (bool, Vec<String>),
    nproc: (bool, Vec<String>),
    file: (bool, Vec<String>),
    network: (bool, Vec<(Vec<String>, String, u32)>),
}

impl From<&SecurityConfig> for Normalized {
    fn from(cfg: &SecurityConfig) -> Self {
        Self {
            disable_external_network: cfg.disable_external_network,
            disable_cmd_operation: cfg.disable_cmd_operation,
            proc: proc_key(cfg.proc_protection.as_ref()),
            nproc: proc_key(cfg.nproc_protection.as_ref()),
            file: file_key(cfg.file_protection.as_ref()),
            network: rule_key(cfg.network_rule.as_ref()),
        }
    }
}

fn sorted(list: &[String]) -> Vec<String> {
    let mut v = list.to_vec();
    v.sort();
    v.dedup();
    v
}

fn proc_key(p: Option<&ProcProtection>) -> (bool, Vec<String>) {
    p.map(|p| (p.is_on, sorted(&p.exe_list)))
        .unwrap_or_default()
}

fn file_key(p: Option<&FileProtection>) -> (bool, Vec<String>) {
    p.map(|p| (p.is_on, sorted(&p.file_list)))
        .unwrap_or_default()
}

fn rule_key(r: Option<&NetworkRuleList>) -> (bool, Vec<(Vec<String>, String, u32)>) {
    r.map(|r| {
        let mut rules: Vec<_> = r
            .rules
            .iter()
            .map(|rule| (sorted(&rule.protocols), rule.addr.clone(), rule.port))
            .collect();
        rules.sort();
        (r.is_on, rules)
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> ContainerConfigs {
        ContainerConfigs {
            resource_limit: Some(ResourceLimit {
                cpu_limit: 1.5,
                memory_limit: 512.0,
                ..Default::default()
            }),
            restart_policy: Some(RestartPolicy {
                name: "always".into(),
                max_retry: 0,
            }),
            networks: vec![NetworkConfig {
                interface: "br0".into(),
                ip_address: "172.18.0.2".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn untouched_fields_are_not_a_change() {
        let req = UpdateContainerRequest {
            resource_limit: Some(ResourceLimit {
                cpu_limit: 1.5 + 1e-12,
                memory_limit: 512.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!ConfigComparator::basic_changed(&current(), &req));
    }

    #[test]
    fn restart_policy_change_is_basic() {
        let req = UpdateContainerRequest {
            restart_policy: Some(RestartPolicy {
                name: "on-failure".into(),
                max_retry: 3,
            }),
            ..Default::default()
        };
        assert!(ConfigComparator::basic_changed(&current(), &req));
        assert!(!ConfigComparator::security_changed(
            &SecurityConfig::default(),
            req.security_config.as_ref()
        ));
    }

    #[test]
    fn network_ip_change_is_basic() {
        let mut nets = current().networks;
        nets[0].ip_address = "172.18.0.3".into();
        let req = UpdateContainerRequest {
            networks: Some(nets),
            ..Default::default()
        };
        assert!(ConfigComparator::basic_changed(&current(), &req));
    }

    #[test]
    fn missing_protection_equals_disabled_empty() {
        let explicit = SecurityConfig {
            file_protection: Some(FileProtection::default()),
            proc_protection: Some(ProcProtection::default()),
            ..Default::default()
        };
        assert!(ConfigComparator::is_unrestricted(&explicit));
        assert!(!ConfigComparator::security_changed(
            &SecurityConfig::default(),
            Some(&explicit)
        ));
    }

    #[test]
    fn list_order_does_not_matter() {
        let a = SecurityConfig {
            proc_protection: Some(ProcProtection {
                is_on: true,
                exe_list: vec!["/bin/a".into(), "/bin/b".into()],
            }),
            ..Default::default()
        };
        let b = SecurityConfig {
            proc_protection: Some(ProcProtection {
                is_on: true,
                exe_list: vec!["/bin/b".into(), "/bin/a".into()],
            }),
            ..Default::default()
        };
        assert!(!ConfigComparator::security_changed(&a, Some(&b)));

        let c = SecurityConfig {
            disable_cmd_operation: true,
            ..b
        };
        assert!(ConfigComparator::security_changed(&a, Some(&c)));
        assert!(!ConfigComparator::is_unrestricted(&c));
    }
}
