// Metrics module - defines the extensible architecture for metric collection
//
// This module provides the core trait that all metric collectors must implement,
// enabling easy addition of new metric kinds without modifying the publisher loop.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{AgentConfig, AgentMode};
use crate::target::{Target, TargetKind};

// Re-export all collector implementations
pub mod carbon;
pub mod latency;
pub mod synthetic;

/// Label name to label value, ordered for stable export
pub type Attributes = BTreeMap<String, String>;

/// One measurement handed to the telemetry sink
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub value: f64,
    pub attributes: Attributes,
}

/// Static description of a gauge a collector emits
#[derive(Debug, Clone, Copy)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
}

impl MetricDescriptor {
    /// Builds a sample of this gauge
    pub fn sample(&self, value: f64, attributes: Attributes) -> Sample {
        Sample {
            name: self.name.to_string(),
            description: self.description.to_string(),
            unit: self.unit.to_string(),
            value,
            attributes,
        }
    }
}

/// Transient failures while collecting one target
///
/// These never leave the publisher loop: they are logged and the target
/// simply contributes no samples to the tick.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {0}")]
    Status(u16),

    #[error("Probe exited with {status}: {stderr}")]
    ProbeFailed { status: String, stderr: String },

    #[error("Failed to run probe: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse probe output: {0}")]
    Parse(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Collector '{collector}' cannot handle target {target}")]
    UnsupportedTarget { collector: String, target: String },
}

impl CollectionError {
    pub(crate) fn unsupported(collector: &str, target: &Target) -> Self {
        CollectionError::UnsupportedTarget {
            collector: collector.to_string(),
            target: target.key().to_string(),
        }
    }
}

/// Core trait that all metric collectors must implement.
///
/// A collector turns one target into zero or more samples. Collectors are
/// shared between ticks and called concurrently for different targets, so
/// any per-call state lives on the stack.
///
/// # Design Philosophy
/// - **Async-first**: network and subprocess calls are awaited, never blocking the runtime
/// - **Bounded**: every implementation carries its own timeout
/// - **Isolated**: an `Err` only drops this target's samples for the tick
#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Returns the human-readable name of this collector.
    /// Used for logging and identification.
    fn name(&self) -> &str;

    /// Whether this collector applies to targets of the given kind
    fn accepts(&self, kind: TargetKind) -> bool;

    /// Collects the current samples for one target.
    ///
    /// # Returns
    /// * `Ok(Vec<Sample>)` - Samples for this target, possibly empty
    /// * `Err(CollectionError)` - Upstream failure, timeout or unparseable output
    async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError>;
}

/// Creates the collectors for the configured agent mode.
///
/// # Returns
/// Vector of shared MetricCollector trait objects
///
/// # Adding New Collectors
/// 1. Create a new module (e.g., `snmp.rs`)
/// 2. Implement the `MetricCollector` trait
/// 3. Add the module to the re-exports at the top of this file
/// 4. Add instantiation under the matching mode below
pub fn create_collectors(
    config: &AgentConfig,
) -> Result<Vec<Arc<dyn MetricCollector>>, CollectionError> {
    let collectors: Vec<Arc<dyn MetricCollector>> = match config.mode {
        AgentMode::Carbon => {
            // Live and forecast gauges share one provider client
            let provider: Arc<dyn carbon::CarbonProvider> =
                Arc::new(carbon::ElectricityMapsClient::new(
                    &config.carbon_api_url,
                    config.api_key.as_deref().unwrap_or_default(),
                    config.request_timeout,
                )?);

            vec![
                Arc::new(carbon::LiveCarbonCollector::new(Arc::clone(&provider))),
                Arc::new(carbon::ForecastCarbonCollector::new(provider)),
            ]
        }
        AgentMode::Latency => vec![Arc::new(latency::PingCollector::new(
            &config.source_ip,
            &config.cluster,
            config.ping_count,
            config.request_timeout,
        ))],
        AgentMode::Battery => vec![Arc::new(synthetic::SyntheticCollector::battery())],
        AgentMode::Rack => vec![Arc::new(synthetic::SyntheticCollector::rack())],
    };

    Ok(collectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builds_sample() {
        const GAUGE: MetricDescriptor = MetricDescriptor {
            name: "node.fluidos.latency",
            description: "Network latency between cluster nodes in milliseconds",
            unit: "ms",
        };

        let mut attributes = Attributes::new();
        attributes.insert("to_node".to_string(), "10.0.0.1".to_string());

        let sample = GAUGE.sample(1.25, attributes.clone());
        assert_eq!(sample.name, "node.fluidos.latency");
        assert_eq!(sample.unit, "ms");
        assert_eq!(sample.value, 1.25);
        assert_eq!(sample.attributes, attributes);
    }

    #[test]
    fn test_collectors_per_mode() {
        let mut config = AgentConfig::for_mode(AgentMode::Carbon);
        config.api_key = Some("secret".to_string());
        let carbon = create_collectors(&config).unwrap();
        assert_eq!(carbon.len(), 2);
        assert!(carbon.iter().all(|c| c.accepts(TargetKind::Geo)));
        assert!(carbon.iter().all(|c| !c.accepts(TargetKind::Peer)));

        let latency = create_collectors(&AgentConfig::for_mode(AgentMode::Latency)).unwrap();
        assert_eq!(latency.len(), 1);
        assert!(latency[0].accepts(TargetKind::Peer));

        let battery = create_collectors(&AgentConfig::for_mode(AgentMode::Battery)).unwrap();
        assert_eq!(battery[0].name(), "battery");
    }
}
