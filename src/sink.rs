// Sink module - hands collected samples to the telemetry backend
//
// This module is responsible for:
// 1. Encoding sample batches as OTLP/HTTP JSON gauges and posting them
// 2. Falling back to log output when no collector endpoint is configured
// 3. Handling export errors gracefully (one retry, then drop)

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::metrics::Sample;

/// OTLP/HTTP metrics path appended to the collector endpoint
const METRICS_PATH: &str = "/v1/metrics";

/// Instrumentation scope reported with every export
const SCOPE_NAME: &str = "cluster-monitor";

/// Errors that can occur while exporting a batch
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Export request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector rejected export with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for sample batches
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Exports one batch
    async fn export(&self, batch: &[Sample]) -> Result<(), SinkError>;

    /// Forces anything the sink buffers to be sent now
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Resource attributes identifying this agent to the backend
#[derive(Debug, Clone)]
pub struct Resource {
    pub service_name: String,
    pub service_namespace: String,
    pub service_version: String,
}

/// OTLP/HTTP exporter using the JSON encoding
pub struct OtlpHttpSink {
    client: Client,
    url: String,
    resource: Resource,
}

impl OtlpHttpSink {
    /// Creates a new exporter
    ///
    /// # Arguments
    /// * `endpoint` - Collector address; `/v1/metrics` is appended unless present
    /// * `resource` - Service identity attached to every export
    /// * `timeout` - Upper bound for each export request
    pub fn new(endpoint: &str, resource: Resource, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, resource))
    }

    pub fn with_client(client: Client, endpoint: &str, resource: Resource) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let url = if endpoint.ends_with(METRICS_PATH) {
            endpoint.to_string()
        } else {
            format!("{}{}", endpoint, METRICS_PATH)
        };

        OtlpHttpSink {
            client,
            url,
            resource,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds an `ExportMetricsServiceRequest` body
    ///
    /// Samples sharing a metric name become data points of one gauge.
    pub fn encode(&self, batch: &[Sample], time_unix_nano: i64) -> Value {
        let mut gauges: BTreeMap<&str, (&Sample, Vec<Value>)> = BTreeMap::new();

        for sample in batch {
            let attributes: Vec<Value> = sample
                .attributes
                .iter()
                .map(|(key, value)| key_value(key, value))
                .collect();

            let point = json!({
                "timeUnixNano": time_unix_nano.to_string(),
                "asDouble": sample.value,
                "attributes": attributes,
            });

            gauges
                .entry(sample.name.as_str())
                .or_insert_with(|| (sample, Vec::new()))
                .1
                .push(point);
        }

        let metrics: Vec<Value> = gauges
            .into_values()
            .map(|(first, points)| {
                json!({
                    "name": first.name,
                    "description": first.description,
                    "unit": first.unit,
                    "gauge": { "dataPoints": points },
                })
            })
            .collect();

        json!({
            "resourceMetrics": [{
                "resource": {
                    "attributes": [
                        key_value("service.name", &self.resource.service_name),
                        key_value("service.namespace", &self.resource.service_namespace),
                        key_value("service.version", &self.resource.service_version),
                    ]
                },
                "scopeMetrics": [{
                    "scope": {
                        "name": SCOPE_NAME,
                        "version": self.resource.service_version,
                    },
                    "metrics": metrics,
                }]
            }]
        })
    }
}

fn key_value(key: &str, value: &str) -> Value {
    json!({ "key": key, "value": { "stringValue": value } })
}

#[async_trait]
impl MetricSink for OtlpHttpSink {
    async fn export(&self, batch: &[Sample]) -> Result<(), SinkError> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let body = self.encode(batch, now);

        debug!("Exporting {} sample(s) to {}", batch.len(), self.url);

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Export accepted with status {}", status);
        Ok(())
    }
}

/// Writes samples to the log instead of a backend
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    async fn export(&self, batch: &[Sample]) -> Result<(), SinkError> {
        for sample in batch {
            info!(
                metric = %sample.name,
                value = sample.value,
                unit = %sample.unit,
                attributes = ?sample.attributes,
                "sample"
            );
        }
        Ok(())
    }
}

/// Exports a batch with one retry on failure
///
/// # Note
/// This function never returns an error - it logs failures and continues.
/// A backend outage costs the samples of the affected tick and nothing else.
pub async fn export_safe(sink: &dyn MetricSink, batch: &[Sample]) {
    const MAX_RETRIES: u32 = 1;

    for attempt in 0..=MAX_RETRIES {
        match sink.export(batch).await {
            Ok(()) => {
                if attempt > 0 {
                    info!(
                        "Exported {} sample(s) after {} retry(ies)",
                        batch.len(),
                        attempt
                    );
                }
                return;
            }
            Err(e) => {
                if attempt < MAX_RETRIES {
                    error!(
                        "Failed to export {} sample(s) (attempt {}): {}. Retrying...",
                        batch.len(),
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                } else {
                    error!(
                        "Failed to export {} sample(s) after {} attempts: {}. Giving up.",
                        batch.len(),
                        attempt + 1,
                        e
                    );
                }
            }
        }
    }
}
