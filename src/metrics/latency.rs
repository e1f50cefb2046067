// Latency metric collector
//
// Measures the mean ICMP round-trip time from this node to each registered
// peer by running the system `ping` binary with a fixed echo count and
// parsing its summary line.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Attributes, CollectionError, MetricCollector, MetricDescriptor, Sample};
use crate::target::{Target, TargetKind};

const LATENCY_GAUGE: MetricDescriptor = MetricDescriptor {
    name: "node.fluidos.latency",
    description: "Network latency between cluster nodes in milliseconds",
    unit: "ms",
};

/// Label used when a peer was registered without a cluster
const UNKNOWN_CLUSTER: &str = "Unknown";

/// Ping-based latency collector
///
/// # Platform Support
/// - Linux (iputils, BusyBox) and macOS summary formats are understood
/// - Requires a `ping` binary on PATH with permission to send ICMP
pub struct PingCollector {
    program: String,
    count: u32,
    timeout: Duration,
    source_ip: String,
    source_cluster: String,
}

impl PingCollector {
    /// Creates a collector that sends `count` echoes per target
    ///
    /// # Arguments
    /// * `source_ip` - Reported as `from_node`
    /// * `source_cluster` - Reported as `from_cluster`
    /// * `count` - Echo requests per probe
    /// * `grace` - Extra time allowed on top of one second per echo
    pub fn new(source_ip: &str, source_cluster: &str, count: u32, grace: Duration) -> Self {
        PingCollector {
            program: "ping".to_string(),
            count,
            timeout: Duration::from_secs(u64::from(count)) + grace,
            source_ip: source_ip.to_string(),
            source_cluster: source_cluster.to_string(),
        }
    }

    /// Replaces the probe binary
    #[cfg(test)]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn probe(&self, node_ip: &str) -> Result<f64, CollectionError> {
        debug!("Ping to {}", node_ip);

        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(self.count.to_string())
            .arg(node_ip)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| CollectionError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(CollectionError::ProbeFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_average_rtt(&stdout).ok_or_else(|| {
            CollectionError::Parse(stdout.lines().last().unwrap_or_default().to_string())
        })
    }
}

/// Extracts the average round-trip time in milliseconds from ping output
///
/// Looks for the summary line, e.g.
/// `rtt min/avg/max/mdev = 0.045/0.056/0.070/0.010 ms` (iputils) or
/// `round-trip min/avg/max = 0.045/0.056/0.070 ms` (BusyBox, macOS).
pub fn parse_average_rtt(output: &str) -> Option<f64> {
    let summary = output.lines().rev().find(|line| line.contains("min/avg"))?;
    let (_, values) = summary.split_once('=')?;
    values.trim().split('/').nth(1)?.trim().parse().ok()
}

#[async_trait]
impl MetricCollector for PingCollector {
    fn name(&self) -> &str {
        "latency"
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        kind == TargetKind::Peer
    }

    async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError> {
        let Target::Peer(peer) = target else {
            return Err(CollectionError::unsupported(self.name(), target));
        };

        let latency = self.probe(&peer.node_ip).await?;

        let mut attributes = Attributes::new();
        attributes.insert("from_node".to_string(), self.source_ip.clone());
        attributes.insert("from_cluster".to_string(), self.source_cluster.clone());
        attributes.insert(
            "to_cluster".to_string(),
            peer.cluster.clone().unwrap_or_else(|| UNKNOWN_CLUSTER.to_string()),
        );
        attributes.insert("to_node".to_string(), peer.node_ip.clone());

        Ok(vec![LATENCY_GAUGE.sample(latency, attributes)])
    }
}
