//! Host usage as reported to the controller's node status calls.

use fleetwarden_shared::{ContainerStat, CpuStat, DiskStat, MemoryStat, NodeState, NodeStatus};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};

use super::engine::ContainerEngine;
use super::resources::MEGABYTE;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Cores in use, refreshed every second by [`CpuUsage::run`] so a status
/// call never waits for a fresh sample.
pub struct CpuUsage {
    system: Mutex<System>,
    last: Mutex<Option<(f64, Instant)>>,
}

impl Default for CpuUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuUsage {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            last: Mutex::new(None),
        }
    }

    fn sample(&self) -> f64 {
        let Ok(mut system) = self.system.lock() else {
            return 0.0;
        };
        system.refresh_cpu_usage();
        let cores = system.cpus().len() as f64;
        f64::from(system.global_cpu_usage()) / 100.0 * cores
    }

    fn store(&self, cores: f64) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some((cores, Instant::now()));
        }
    }

    pub async fn get(&self) -> f64 {
        let cached = self.last.lock().ok().and_then(|l| *l);
        match cached {
            Some((cores, at)) if at.elapsed() <= SAMPLE_INTERVAL => return cores,
            _ => {}
        }
        log::debug!("cpu usage data out of date, refresh");
        self.sample();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        let cores = self.sample();
        self.store(cores);
        cores
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let cores = self.sample();
            self.store(cores);
        }
    }
}

pub fn host_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn memory_stat() -> MemoryStat {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory() as f64;
    let used = system.used_memory() as f64;
    MemoryStat {
        total: total / MEGABYTE,
        used: used / MEGABYTE,
        free: system.free_memory() as f64 / MEGABYTE,
        used_percentage: if total > 0.0 { used / total * 100.0 } else { 0.0 },
    }
}

/// Usage of the filesystem mounted at `/`.
pub fn root_disk_stat() -> Option<DiskStat> {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))?;
    let total = root.total_space() as f64;
    let free = root.available_space() as f64;
    let used = total - free;
    Some(DiskStat {
        total: total / MEGABYTE,
        used: used / MEGABYTE,
        free: free / MEGABYTE,
        limit: 0.0,
        used_percentage: if total > 0.0 { used / total * 100.0 } else { 0.0 },
    })
}

pub async fn node_status(engine: &dyn ContainerEngine, cpu: &CpuUsage) -> NodeStatus {
    let used = cpu.get().await;
    let total = host_cpus() as f64;
    let mut status = NodeStatus {
        state: NodeState::Online,
        cpu_stat: Some(CpuStat {
            total,
            used,
            used_percentage: used / total * 100.0,
        }),
        mem_stat: Some(memory_stat()),
        disk_stat: root_disk_stat(),
        ..Default::default()
    };

    match engine.info().await {
        Ok(info) => {
            status.container_stat = Some(ContainerStat {
                running: info.containers_running,
                total: info.containers,
            });
        }
        Err(e) => {
            log::info!("engine info: {}", e);
            status.state = NodeState::Unknown;
        }
    }
    status
}
