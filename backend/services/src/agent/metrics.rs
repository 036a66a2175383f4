//! Usage history read from the cAdvisor series stored in InfluxDB v1.

use async_trait::async_trait;
use fleetwarden_shared::MonitorSample;
use fleetwarden_shared::rpc::MonitorHistoryReply;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

const DATABASE: &str = "cadvisor";
const MAX_HISTORY_SECS: i64 = 10 * 24 * 3600;
const MEGABYTE: u64 = 1 << 20;

/// Series name used for the host itself.
pub const HOST_SERIES: &str = "/";

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// CPU (cores), memory, disk (MB) and network (MB per interval) samples.
    async fn history(
        &self,
        start: i64,
        end: i64,
        interval_min: i64,
        container_name: &str,
    ) -> ServiceResult<MonitorHistoryReply>;
}

/// `start < end`, at least one minute per sample and no older than ten days.
pub fn validate_window(start: i64, end: i64, interval_min: i64, now: i64) -> ServiceResult<()> {
    if start >= end || interval_min < 1 || start < now - MAX_HISTORY_SECS {
        log::info!("monitor history: invalid window start={} end={} interval={}", start, end, interval_min);
        return Err(ServiceError::invalid("monitor history time window"));
    }
    Ok(())
}

fn statements(start: i64, end: i64, interval_min: i64) -> String {
    let window = format!(
        r#"WHERE ("container_name" = $container) AND time >= {}s AND time <= {}s GROUP BY time({}m)"#,
        start, end, interval_min
    );
    let interval_ns = interval_min * 60 * 1_000_000_000;
    [
        format!(
            r#"SELECT non_negative_difference(mean("value")) / {} FROM "cpu_usage_system" {} fill(previous)"#,
            interval_ns, window
        ),
        format!(r#"SELECT mean("value") / {} FROM "memory_working_set" {} fill(0)"#, MEGABYTE, window),
        format!(r#"SELECT mean("value") / {} FROM "fs_usage" {} fill(0)"#, MEGABYTE, window),
        format!(
            r#"SELECT non_negative_difference(mean("value")) / {} FROM "rx_bytes" {} fill(previous)"#,
            MEGABYTE, window
        ),
        format!(
            r#"SELECT non_negative_difference(mean("value")) / {} FROM "tx_bytes" {} fill(previous)"#,
            MEGABYTE, window
        ),
    ]
    .join(";")
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn samples(result: &StatementResult) -> Vec<MonitorSample> {
    result
        .series
        .iter()
        .flat_map(|s| s.values.iter())
        .filter_map(|row| {
            let timestamp = row.first()?.as_i64()?;
            let value = row.get(1)?.as_f64()?;
            Some(MonitorSample { timestamp, value })
        })
        .collect()
}

fn into_reply(response: QueryResponse) -> ServiceResult<MonitorHistoryReply> {
    if let Some(err) = response.error {
        return Err(ServiceError::internal(format!("influxdb: {}", err)));
    }
    if let Some(err) = response.results.iter().find_map(|r| r.error.clone()) {
        return Err(ServiceError::internal(format!("influxdb: {}", err)));
    }

    let mut series = response.results.iter().map(samples);
    Ok(MonitorHistoryReply {
        cpu_usage: series.next().unwrap_or_default(),
        memory_usage: series.next().unwrap_or_default(),
        disk_usage: series.next().unwrap_or_default(),
        net_rx: series.next().unwrap_or_default(),
        net_tx: series.next().unwrap_or_default(),
        ..Default::default()
    })
}

pub struct InfluxMetrics {
    client: reqwest::Client,
    base_url: String,
}

impl InfluxMetrics {
    pub fn new(addr: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{}", addr),
        })
    }
}

#[async_trait]
impl MetricsSource for InfluxMetrics {
    async fn history(
        &self,
        start: i64,
        end: i64,
        interval_min: i64,
        container_name: &str,
    ) -> ServiceResult<MonitorHistoryReply> {
        let params = serde_json::json!({ "container": container_name }).to_string();
        let query = statements(start, end, interval_min);
        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("db", DATABASE),
                ("epoch", "s"),
                ("q", query.as_str()),
                ("params", params.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                log::warn!("influxdb query: {}", e);
                ServiceError::internal(format!("influxdb: {}", e))
            })?;
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::internal(format!("influxdb reply: {}", e)))?;
        into_reply(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rules() {
        let now = 1_700_000_000;
        assert!(validate_window(now - 3600, now, 1, now).is_ok());
        assert!(validate_window(now, now, 1, now).is_err());
        assert!(validate_window(now - 3600, now, 0, now).is_err());
        assert!(validate_window(now - 11 * 24 * 3600, now, 5, now).is_err());
    }

    #[test]
    fn queries_bind_the_window() {
        let q = statements(100, 200, 5);
        assert_eq!(q.split(';').count(), 5);
        assert!(q.contains("time >= 100s AND time <= 200s GROUP BY time(5m)"));
        assert!(q.contains("/ 300000000000 FROM \"cpu_usage_system\""));
    }

    #[test]
    fn every_statement_fills_its_series() {
        let body = serde_json::json!({
            "results": [
                {"series": [{"values": [[60, 0.5], [120, null]]}]},
                {"series": [{"values": [[60, 128.0]]}]},
                {},
                {"series": [{"values": [[60, 1]]}]},
                {"series": [{"values": [[60, 2]]}]}
            ]
        });
        let reply = into_reply(serde_json::from_value(body).unwrap()).unwrap();
        assert_eq!(reply.cpu_usage, vec![MonitorSample { timestamp: 60, value: 0.5 }]);
        assert_eq!(reply.memory_usage[0].value, 128.0);
        assert!(reply.disk_usage.is_empty());
        assert_eq!(reply.net_rx[0].value, 1.0);
        assert_eq!(reply.net_tx[0].value, 2.0);
    }

    #[test]
    fn statement_errors_surface() {
        let body = serde_json::json!({"results": [{"error": "database not found"}]});
        assert!(into_reply(serde_json::from_value(body).unwrap()).is_err());
    }
}
