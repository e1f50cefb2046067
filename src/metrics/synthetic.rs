// Synthetic sensor collector
//
// Generates simulated readings from fixed per-metric distributions. Used to
// exercise the export path without real hardware: a battery profile and a
// rack (temperature/energy) profile are provided.

use async_trait::async_trait;
use rand::Rng;

use super::{Attributes, CollectionError, MetricCollector, MetricDescriptor, Sample};
use crate::target::{Target, TargetKind};

/// Value distribution of a simulated gauge
#[derive(Debug, Clone, Copy)]
pub enum Distribution {
    /// Uniform over the half-open range [low, high)
    Uniform(f64, f64),
    /// Uniform over the integers in [low, high]
    UniformInt(i64, i64),
}

impl Distribution {
    fn draw<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Uniform(low, high) => rng.random_range(low..high),
            Distribution::UniformInt(low, high) => rng.random_range(low..=high) as f64,
        }
    }
}

/// A simulated gauge
#[derive(Debug, Clone, Copy)]
pub struct SyntheticMetric {
    pub descriptor: MetricDescriptor,
    pub distribution: Distribution,
}

const fn gauge(
    name: &'static str,
    description: &'static str,
    unit: &'static str,
    distribution: Distribution,
) -> SyntheticMetric {
    SyntheticMetric {
        descriptor: MetricDescriptor {
            name,
            description,
            unit,
        },
        distribution,
    }
}

const BATTERY_METRICS: [SyntheticMetric; 9] = [
    gauge(
        "battery_percentage",
        "Current battery level as a percentage.",
        "%",
        Distribution::Uniform(0.0, 100.0),
    ),
    gauge(
        "battery_power_draw_watts",
        "Current power draw of the battery in watts.",
        "W",
        Distribution::Uniform(10.0, 30.0),
    ),
    gauge(
        "battery_charge_rate_watts",
        "Rate at which the battery is charging in watts.",
        "W",
        Distribution::Uniform(15.0, 25.0),
    ),
    gauge(
        "battery_discharge_rate_watts",
        "Rate at which the battery is discharging in watts.",
        "W",
        Distribution::Uniform(5.0, 15.0),
    ),
    gauge(
        "battery_health_percent",
        "Current health of the battery as a percentage.",
        "%",
        Distribution::Uniform(80.0, 100.0),
    ),
    gauge(
        "battery_voltage_volts",
        "Current voltage of the battery in volts.",
        "V",
        Distribution::Uniform(3.0, 4.2),
    ),
    gauge(
        "battery_temperature_celsius",
        "Current temperature of the battery in Celsius.",
        "C",
        Distribution::Uniform(20.0, 40.0),
    ),
    gauge(
        "battery_remaining_time_seconds",
        "Estimated remaining time of battery usage in seconds.",
        "s",
        Distribution::Uniform(3600.0, 14400.0),
    ),
    gauge(
        "battery_cycle_count",
        "Total number of charge cycles the battery has undergone.",
        "count",
        Distribution::UniformInt(100, 500),
    ),
];

const RACK_METRICS: [SyntheticMetric; 2] = [
    gauge(
        "cluster.temperature",
        "Temperature of the cluster in Celsius",
        "C",
        Distribution::Uniform(22.0, 28.0),
    ),
    gauge(
        "cluster.energy_consumption",
        "Energy consumption of the cluster in kWh",
        "kWh",
        Distribution::Uniform(800.0, 2600.0),
    ),
];

/// Collector producing one sample per simulated gauge for every target
///
/// Peer targets are labelled with `identity_label = node_ip` plus the
/// profile's static labels; geo targets keep their coordinate attributes.
pub struct SyntheticCollector {
    profile: &'static str,
    identity_label: &'static str,
    static_labels: Attributes,
    metrics: Vec<SyntheticMetric>,
}

impl SyntheticCollector {
    pub fn new(
        profile: &'static str,
        identity_label: &'static str,
        static_labels: Attributes,
        metrics: Vec<SyntheticMetric>,
    ) -> Self {
        SyntheticCollector {
            profile,
            identity_label,
            static_labels,
            metrics,
        }
    }

    /// Nine battery gauges labelled `device=battery0, instance=<node>`
    pub fn battery() -> Self {
        let mut labels = Attributes::new();
        labels.insert("device".to_string(), "battery0".to_string());
        Self::new("battery", "instance", labels, BATTERY_METRICS.to_vec())
    }

    /// Rack temperature and energy gauges labelled `rack_id=<node>`
    pub fn rack() -> Self {
        Self::new("rack", "rack_id", Attributes::new(), RACK_METRICS.to_vec())
    }

    fn attributes_for(&self, target: &Target) -> Attributes {
        match target {
            Target::Peer(peer) => {
                let mut attributes = self.static_labels.clone();
                attributes.insert(self.identity_label.to_string(), peer.node_ip.clone());
                attributes
            }
            Target::Geo(_) => {
                let mut attributes = target.attributes();
                attributes.extend(self.static_labels.clone());
                attributes
            }
        }
    }

    fn generate(&self, attributes: &Attributes) -> Vec<Sample> {
        let mut rng = rand::rng();
        self.metrics
            .iter()
            .map(|metric| {
                let value = metric.distribution.draw(&mut rng);
                metric.descriptor.sample(value, attributes.clone())
            })
            .collect()
    }
}

#[async_trait]
impl MetricCollector for SyntheticCollector {
    fn name(&self) -> &str {
        self.profile
    }

    fn accepts(&self, _kind: TargetKind) -> bool {
        true
    }

    async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError> {
        let attributes = self.attributes_for(target);
        Ok(self.generate(&attributes))
    }
}
