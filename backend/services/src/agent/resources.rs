//! Translation between the external resource limit (fractional cores,
//! megabytes) and engine units.

use fleetwarden_shared::ResourceLimit;
use std::collections::HashMap;

use super::engine::EngineResources;

pub const MEGABYTE: f64 = (1u64 << 20) as f64;
pub const DEFAULT_CPU_SHARES: i64 = 1024;

pub fn to_cpu_shares(cpu_prio: i64) -> i64 {
    if cpu_prio <= 0 {
        DEFAULT_CPU_SHARES
    } else {
        cpu_prio + DEFAULT_CPU_SHARES
    }
}

pub fn from_cpu_shares(cpu_shares: i64) -> i64 {
    if cpu_shares <= DEFAULT_CPU_SHARES {
        0
    } else {
        cpu_shares - DEFAULT_CPU_SHARES
    }
}

/// A zero CPU limit pins the container to every host core.
pub fn engine_resources(limit: &ResourceLimit, host_cpus: usize) -> EngineResources {
    let mut nano_cpus = (limit.cpu_limit * 1e9) as i64;
    if nano_cpus == 0 {
        nano_cpus = host_cpus as i64 * 1_000_000_000;
    }
    let memory = (limit.memory_limit * MEGABYTE) as i64;
    EngineResources {
        nano_cpus,
        cpu_shares: to_cpu_shares(limit.cpu_prio),
        memory,
        memory_reservation: (limit.memory_soft_limit * MEGABYTE) as i64,
        // Swap must not drop below the memory limit or the engine rejects the update.
        memory_swap: memory,
    }
}

pub fn resource_limit(resources: &EngineResources, storage_opt: &HashMap<String, String>) -> ResourceLimit {
    ResourceLimit {
        cpu_limit: resources.nano_cpus as f64 / 1e9,
        cpu_prio: from_cpu_shares(resources.cpu_shares),
        memory_limit: resources.memory as f64 / MEGABYTE,
        memory_soft_limit: resources.memory_reservation as f64 / MEGABYTE,
        disk_limit: storage_opt
            .get("size")
            .and_then(|s| parse_megabytes(s))
            .unwrap_or(0.0),
    }
}

/// Storage option value for a disk limit in megabytes.
pub fn storage_size(disk_limit: f64) -> String {
    format!("{:.6}M", disk_limit)
}

/// Reads `"512.000000M"` or a bare number of megabytes.
pub fn parse_megabytes(value: &str) -> Option<f64> {
    value.trim().trim_end_matches(['M', 'm']).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_priority_sits_on_top_of_default_shares() {
        assert_eq!(to_cpu_shares(0), 1024);
        assert_eq!(to_cpu_shares(-5), 1024);
        assert_eq!(to_cpu_shares(100), 1124);
        assert_eq!(from_cpu_shares(1124), 100);
        assert_eq!(from_cpu_shares(1024), 0);
        assert_eq!(from_cpu_shares(2), 0);
    }

    #[test]
    fn zero_cpu_limit_means_all_cores() {
        let r = engine_resources(&ResourceLimit::default(), 4);
        assert_eq!(r.nano_cpus, 4_000_000_000);

        let r = engine_resources(
            &ResourceLimit {
                cpu_limit: 1.5,
                memory_limit: 256.0,
                memory_soft_limit: 128.0,
                ..Default::default()
            },
            4,
        );
        assert_eq!(r.nano_cpus, 1_500_000_000);
        assert_eq!(r.memory, 256 << 20);
        assert_eq!(r.memory_swap, r.memory);
        assert_eq!(r.memory_reservation, 128 << 20);
    }

    #[test]
    fn engine_values_read_back_as_limits() {
        let limit = ResourceLimit {
            cpu_limit: 2.0,
            cpu_prio: 10,
            memory_limit: 512.0,
            memory_soft_limit: 0.0,
            disk_limit: 1024.0,
        };
        let storage = HashMap::from([("size".to_string(), storage_size(limit.disk_limit))]);
        assert_eq!(resource_limit(&engine_resources(&limit, 8), &storage), limit);
    }
}
