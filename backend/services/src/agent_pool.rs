use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::agent_client::{AgentApi, HttpAgentClient};
use crate::error::{ServiceError, ServiceResult};

/// Opens a client channel to the agent at `address`.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, address: &str) -> ServiceResult<Arc<dyn AgentApi>>;
}

pub struct HttpConnector {
    port: u16,
}

impl HttpConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl AgentConnector for HttpConnector {
    async fn connect(&self, address: &str) -> ServiceResult<Arc<dyn AgentApi>> {
        // one client per node keeps its own keep-alive connection pool
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ServiceError::internal(format!("build agent client for {}: {}", address, e)))?;
        Ok(Arc::new(HttpAgentClient::new(client, address, self.port)))
    }
}

/// Caches one agent channel per node address.
///
/// Entries never expire. Two concurrent misses on the same address may both
/// dial; the later insert wins and the other channel is dropped.
pub struct AgentPool {
    connector: Arc<dyn AgentConnector>,
    conns: RwLock<HashMap<String, Arc<dyn AgentApi>>>,
}

impl AgentPool {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            connector,
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, address: &str) -> ServiceResult<Arc<dyn AgentApi>> {
        if let Some(conn) = self.conns.read().await.get(address) {
            return Ok(Arc::clone(conn));
        }

        let conn = self.connector.connect(address).await.map_err(|e| {
            log::warn!("connect agent {} failed: {}", address, e);
            e
        })?;

        self.conns
            .write()
            .await
            .insert(address.to_owned(), Arc::clone(&conn));
        log::debug!("cached agent channel for {}", address);
        Ok(conn)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }
}
