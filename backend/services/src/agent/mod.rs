//! Per-host agent: drives the local container engine and enforces the
//! security posture the controller pushes.

pub mod backup_jobs;
pub mod docker_engine;
pub mod engine;
pub mod graphic;
pub mod metrics;
pub mod network;
pub mod node_status;
pub mod resources;
pub mod runtime;
pub mod security;

pub use backup_jobs::BackupJobStore;
pub use docker_engine::DockerEngine;
pub use engine::ContainerEngine;
pub use metrics::{InfluxMetrics, MetricsSource};
pub use node_status::CpuUsage;
pub use runtime::AgentRuntime;
pub use security::{Enforcer, KernelChannel, LoggingKernelChannel, SecurityPaths};
