// Scheduler module - the periodic collect-and-publish loop
//
// This module implements the agent's steady-state activity using Tokio.
//
// # Architecture
// - One long-lived task ticks on a fixed interval
// - Each tick copies the registry out under its lock, then releases it
// - Collectors run against the snapshot with bounded concurrency
// - Failures are isolated per target: logged, never propagated
// - Control API mutations request an out-of-band tick through a
//   capacity-1 channel, so bursts of requests coalesce into one flush

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::{MetricCollector, Sample};
use crate::registry::TargetRegistry;
use crate::sink::{export_safe, MetricSink};
use crate::target::Target;

/// Requests an immediate out-of-band publish
///
/// Cloned into every Control API handler. Requests never block: when a
/// flush is already pending the new request is folded into it.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<()>,
}

impl FlushHandle {
    /// Returns `true` when a new flush was queued
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                debug!("Flush requested");
                true
            }
            Err(TrySendError::Full(())) => {
                debug!("Flush already pending");
                false
            }
            Err(TrySendError::Closed(())) => {
                warn!("Publisher loop is not running, flush dropped");
                false
            }
        }
    }
}

/// Creates the flush side channel shared by the Control API and the loop
pub fn flush_channel() -> (FlushHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (FlushHandle { tx }, rx)
}

/// Outcome of one collection pass
#[derive(Debug, Default)]
pub struct TickReport {
    /// Targets in the snapshot
    pub targets: usize,

    /// (target, collector) pairs that produced a result
    pub groups: usize,

    /// (target, collector) pairs that failed
    pub failures: usize,

    pub samples: Vec<Sample>,
}

/// Periodic publisher
///
/// Owns the collectors and the sink; shares the registry with the Control
/// API.
pub struct PublisherLoop {
    registry: TargetRegistry,
    collectors: Vec<Arc<dyn MetricCollector>>,
    sink: Arc<dyn MetricSink>,
    interval: Duration,
    concurrency: usize,
}

impl PublisherLoop {
    /// Creates a new PublisherLoop instance
    ///
    /// # Arguments
    /// * `registry` - Shared target registry
    /// * `collectors` - Collectors to run against every matching target
    /// * `sink` - Destination of each tick's samples
    /// * `interval` - Time between ticks
    pub fn new(
        registry: TargetRegistry,
        collectors: Vec<Arc<dyn MetricCollector>>,
        sink: Arc<dyn MetricSink>,
        interval: Duration,
    ) -> Self {
        PublisherLoop {
            registry,
            collectors,
            sink,
            interval,
            concurrency: num_cpus::get().max(1),
        }
    }

    /// Limits how many collector calls run at once within a tick
    #[cfg(test)]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs forever, publishing on every tick and on every flush request
    ///
    /// # Behavior
    /// - The first tick fires immediately
    /// - A slow tick delays the next one instead of bursting to catch up
    /// - A flush request triggers an extra publish followed by `sink.flush()`
    pub async fn run(self, mut flush_rx: mpsc::Receiver<()>) {
        info!(
            "Starting publisher loop with {} collector(s), interval {}ms",
            self.collectors.len(),
            self.interval.as_millis()
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.publish().await;
                }
                Some(()) = flush_rx.recv() => {
                    debug!("Running out-of-band flush");
                    self.publish().await;
                    if let Err(e) = self.sink.flush().await {
                        error!("Sink flush failed: {}", e);
                    }
                }
            }
        }
    }

    /// Collects one tick and hands the samples to the sink
    pub async fn publish(&self) -> TickReport {
        let report = self.collect_tick().await;

        if report.samples.is_empty() {
            debug!("Tick produced no samples, nothing to export");
        } else {
            export_safe(self.sink.as_ref(), &report.samples).await;
        }

        report
    }

    /// Performs one collection pass over a registry snapshot
    ///
    /// The registry lock is held only while copying the snapshot. Results are
    /// accumulated in snapshot order.
    pub async fn collect_tick(&self) -> TickReport {
        let started = Instant::now();
        let snapshot = self.registry.list();

        let jobs: Vec<(Arc<dyn MetricCollector>, Target)> = snapshot
            .iter()
            .flat_map(|target| {
                self.collectors
                    .iter()
                    .filter(move |collector| collector.accepts(target.kind()))
                    .map(move |collector| (Arc::clone(collector), target.clone()))
            })
            .collect();

        let mut report = TickReport {
            targets: snapshot.len(),
            ..TickReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, (collector, target)) in jobs.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                // Never closed, so acquiring only waits
                let _permit = permits.acquire_owned().await;
                let result = collector.collect(&target).await;
                (index, collector, target, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    report.failures += 1;
                    error!("Collector task aborted: {}", e);
                }
            }
        }
        results.sort_by_key(|(index, ..)| *index);

        for (_, collector, target, result) in results {
            match result {
                Ok(samples) => {
                    report.groups += 1;
                    report.samples.extend(samples);
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        "Collector '{}' failed for {}: {}",
                        collector.name(),
                        target.key(),
                        e
                    );
                }
            }
        }

        info!(
            "Tick complete: {} target(s), {} sample group(s), {} sample(s), {} failure(s) in {:?}",
            report.targets,
            report.groups,
            report.samples.len(),
            report.failures,
            started.elapsed()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::synthetic::SyntheticCollector;
    use crate::metrics::{Attributes, CollectionError};
    use crate::sink::SinkError;
    use crate::target::TargetKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails for any peer whose address ends in ".13"
    struct FlakyCollector;

    #[async_trait]
    impl MetricCollector for FlakyCollector {
        fn name(&self) -> &str {
            "flaky"
        }

        fn accepts(&self, kind: TargetKind) -> bool {
            kind == TargetKind::Peer
        }

        async fn collect(&self, target: &Target) -> Result<Vec<Sample>, CollectionError> {
            let Target::Peer(peer) = target else {
                return Err(CollectionError::unsupported(self.name(), target));
            };
            if peer.node_ip.ends_with(".13") {
                return Err(CollectionError::Status(500));
            }

            let mut attributes = Attributes::new();
            attributes.insert("to_node".to_string(), peer.node_ip.clone());
            Ok(vec![Sample {
                name: "test.latency".to_string(),
                description: String::new(),
                unit: "ms".to_string(),
                value: 1.0,
                attributes,
            }])
        }
    }

    #[derive(Default)]
    struct MemorySink {
        batches: Mutex<Vec<Vec<Sample>>>,
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl MetricSink for MemorySink {
        async fn export(&self, batch: &[Sample]) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }

        async fn flush(&self) -> Result<(), SinkError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn publisher(registry: &TargetRegistry, sink: Arc<MemorySink>) -> PublisherLoop {
        PublisherLoop::new(
            registry.clone(),
            vec![Arc::new(FlakyCollector)],
            sink,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_target() {
        let registry = TargetRegistry::new();
        for ip in ["10.0.0.1", "10.0.0.13", "10.0.0.2", "10.0.1.13", "10.0.0.3"] {
            registry.add(Target::peer(ip)).unwrap();
        }

        let sink = Arc::new(MemorySink::default());
        let report = publisher(&registry, Arc::clone(&sink))
            .with_concurrency(2)
            .publish()
            .await;

        assert_eq!(report.targets, 5);
        assert_eq!(report.groups, 3);
        assert_eq!(report.failures, 2);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let nodes: Vec<&str> = batches[0]
            .iter()
            .map(|s| s.attributes["to_node"].as_str())
            .collect();
        assert_eq!(nodes, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_collectors_skip_other_target_kinds() {
        let registry = TargetRegistry::new();
        registry.add(Target::geo("48.864716", "2.349014")).unwrap();

        let sink = Arc::new(MemorySink::default());
        let report = publisher(&registry, Arc::clone(&sink)).publish().await;

        assert_eq!(report.targets, 1);
        assert_eq!(report.groups, 0);
        assert_eq!(report.failures, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    /// Holds every collection open for a fixed delay
    struct SlowCollector(Duration);

    #[async_trait]
    impl MetricCollector for SlowCollector {
        fn name(&self) -> &str {
            "slow"
        }

        fn accepts(&self, _kind: TargetKind) -> bool {
            true
        }

        async fn collect(&self, _target: &Target) -> Result<Vec<Sample>, CollectionError> {
            tokio::time::sleep(self.0).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_registry_mutable_during_tick() {
        let registry = TargetRegistry::new();
        registry.add(Target::peer("10.0.0.1")).unwrap();

        let publisher = PublisherLoop::new(
            registry.clone(),
            vec![Arc::new(SlowCollector(Duration::from_millis(500)))],
            Arc::new(MemorySink::default()),
            Duration::from_secs(3600),
        );
        let tick = tokio::spawn(async move { publisher.collect_tick().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tick.is_finished());

        let started = Instant::now();
        registry.add(Target::peer("10.0.0.2")).unwrap();
        registry.remove(&Target::peer("10.0.0.1").key()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!tick.is_finished());

        let report = tick.await.unwrap();
        assert_eq!(report.targets, 1);
        assert_eq!(report.groups, 1);
        assert_eq!(registry.list(), vec![Target::peer("10.0.0.2")]);
    }

    #[tokio::test]
    async fn test_spawned_loop_exports_synthetic_samples() {
        let registry = TargetRegistry::new();
        registry.add(Target::peer("rackA")).unwrap();
        registry.add(Target::peer("rackB")).unwrap();

        let sink = Arc::new(MemorySink::default());
        let publisher = PublisherLoop::new(
            registry,
            vec![Arc::new(SyntheticCollector::rack())],
            Arc::clone(&sink) as Arc<dyn MetricSink>,
            Duration::from_secs(3600),
        );
        let (_flush, rx) = flush_channel();
        let task = tokio::spawn(publisher.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let racks: Vec<&str> = batches[0]
            .iter()
            .map(|s| s.attributes["rack_id"].as_str())
            .collect();
        assert_eq!(racks, vec!["rackA", "rackA", "rackB", "rackB"]);
    }

    #[tokio::test]
    async fn test_flush_requests_coalesce() {
        let (flush, mut rx) = flush_channel();

        assert!(flush.request());
        assert!(!flush.request());
        assert!(!flush.clone().request());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!flush.request());
    }

    #[tokio::test]
    async fn test_run_publishes_on_flush() {
        let registry = TargetRegistry::new();
        registry.add(Target::peer("10.0.0.1")).unwrap();

        let sink = Arc::new(MemorySink::default());
        let (flush, rx) = flush_channel();
        let task = tokio::spawn(publisher(&registry, Arc::clone(&sink)).run(rx));

        // Immediate first tick
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);

        registry.add(Target::peer("10.0.0.2")).unwrap();
        assert!(flush.request());
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let batches = sink.batches.lock().unwrap();
            assert_eq!(batches.len(), 2);
            assert_eq!(batches[1].len(), 2);
        }
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);

        task.abort();
    }
}
