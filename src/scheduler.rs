//! The measurement scheduler: wait, measure, probe, repeat.
//!
//! One logical thread of control owns the loop. During the wait it ticks
//! the prober once per second to keep latency and loss fresh; the
//! measure and ping phases never overlap with each other or with the
//! ticks. Faults inside an iteration are absorbed at the loop boundary
//! so the monitor stays alive indefinitely; availability wins over
//! strict error visibility here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::duration::format_duration;
use crate::interval::{IntervalController, Regime};
use crate::journal::{Journal, ReplaySummary, Replayer};
use crate::metrics::{keys, MetricRegistry};
use crate::probe::{packet_loss_percent, Prober};
use crate::source::SpeedSource;
use crate::stats::{MetricStream, Observation, Window};

/// Wait-phase tick granularity.
const TICK: Duration = Duration::from_secs(1);

/// Cooperative control signals, polled by the loop between steps.
#[derive(Clone, Default)]
pub struct Signals {
    inner: Arc<SignalState>,
}

#[derive(Default)]
struct SignalState {
    stop: AtomicBool,
    force: AtomicBool,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to finish its current state, flush, and exit.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Ask the loop to skip the rest of its wait and measure now.
    pub fn force_measure(&self) {
        self.inner.force.store(true, Ordering::SeqCst);
    }

    pub fn force_requested(&self) -> bool {
        self.inner.force.load(Ordering::SeqCst)
    }

    fn clear_force(&self) {
        self.inner.force.store(false, Ordering::SeqCst);
    }
}

/// Tunables for the scheduler loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wait between cycles when the network looks healthy.
    pub normal_interval: Duration,
    /// Wait between cycles when the network looks degraded.
    pub degraded_interval: Duration,
    /// Probe repetitions per destination in the ping phase.
    pub probe_repetitions: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_secs(60),
            degraded_interval: Duration::from_secs(10),
            probe_repetitions: 5,
        }
    }
}

/// The top-level monitoring engine.
pub struct Monitor {
    config: MonitorConfig,
    sources: Vec<Box<dyn SpeedSource>>,
    prober: Prober,
    controller: IntervalController,
    journal: Arc<Journal>,
    metrics: Arc<MetricRegistry>,
    signals: Signals,
    downloads: MetricStream,
    uploads: MetricStream,
    pings: MetricStream,
    next_wake: Option<DateTime<Utc>>,
    last_cycle: Option<DateTime<Utc>>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        sources: Vec<Box<dyn SpeedSource>>,
        prober: Prober,
        journal: Arc<Journal>,
        metrics: Arc<MetricRegistry>,
        downloads: MetricStream,
        uploads: MetricStream,
        pings: MetricStream,
    ) -> Self {
        let controller =
            IntervalController::new(config.normal_interval, config.degraded_interval);
        Self {
            config,
            sources,
            prober,
            controller,
            journal,
            metrics,
            signals: Signals::new(),
            downloads,
            uploads,
            pings,
            next_wake: None,
            last_cycle: None,
        }
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn downloads(&self) -> &MetricStream {
        &self.downloads
    }

    /// When the previous iteration finished, if any has.
    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        self.last_cycle
    }

    /// Rebuild statistics from the journal file.
    ///
    /// Must run before [`run`](Self::run), while no concurrent writer
    /// exists. Seeds the imported/min/max/threshold metrics from
    /// whatever history came back.
    pub fn replay(&self) -> std::io::Result<ReplaySummary> {
        let replayer = Replayer::new(
            &self.sources,
            self.prober.targets(),
            self.pings.clone(),
            self.downloads.clone(),
        );
        let summary = replayer.replay_file(self.journal.path())?;

        self.metrics
            .set(keys::IMPORTED, self.downloads.len().to_string());
        if let (Some(min), Some(max)) = (self.downloads.min(), self.downloads.max()) {
            self.metrics.set(keys::MIN_DOWNLOAD, format!("{min}mbit/s"));
            self.metrics.set(keys::MAX_DOWNLOAD, format!("{max}mbit/s"));
        }
        if let Some(threshold) = self.controller.threshold(&self.downloads) {
            self.metrics
                .set(keys::SLOW_THRESHOLD, format!("{threshold}mbit/s"));
        }

        info!(
            lines = summary.lines,
            downloads = summary.download_observations,
            pings = summary.ping_observations,
            "journal replayed"
        );
        Ok(summary)
    }

    /// Drive the wait/measure/ping loop until a stop is requested.
    pub fn run(&mut self) {
        info!("scheduler started");
        while !self.signals.stop_requested() {
            if let Err(e) = self.cycle() {
                warn!(error = %e, "measurement cycle abandoned");
            }
            self.last_cycle = Some(Utc::now());
        }
        if let Err(e) = self.journal.flush() {
            warn!(error = %e, "final journal flush failed");
        }
        self.metrics.set(keys::STATE, "Stopped");
        info!("scheduler stopped");
    }

    /// One full wait/measure/ping iteration.
    fn cycle(&mut self) -> Result<()> {
        self.signals.clear_force();

        self.wait_phase();
        if self.signals.stop_requested() {
            return Ok(());
        }

        self.measure_phase()?;
        self.flush_journal();
        if self.signals.stop_requested() {
            return Ok(());
        }

        self.metrics.set(keys::STATE, "Ping");
        self.prober.probe(self.config.probe_repetitions);
        self.flush_journal();
        Ok(())
    }

    /// Sleep toward the next deadline in one-second ticks, keeping the
    /// latency metrics fresh with a single-repetition probe per tick.
    fn wait_phase(&mut self) {
        self.metrics.set(keys::STATE, "Wait");
        let wait = self.controller.wait_time();
        let deadline = Instant::now() + wait;
        self.next_wake =
            Some(Utc::now() + TimeDelta::from_std(wait).unwrap_or_else(|_| TimeDelta::zero()));

        loop {
            if self.signals.stop_requested() || self.signals.force_requested() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(TICK));
            self.refresh_derived_metrics();
            self.prober.probe(1);
        }
    }

    /// Run every measurement source, journal its progress, record its
    /// samples, and re-evaluate the polling regime.
    fn measure_phase(&mut self) -> Result<()> {
        self.metrics.set(keys::STATE, "Measure");

        for source in &mut self.sources {
            debug!(source = source.description(), "measuring throughput");
            let journal = Arc::clone(&self.journal);
            let samples = source.measure(&mut |line| {
                journal.append(line);
            })?;
            if let Err(e) = journal.flush() {
                warn!(error = %e, "journal flush failed");
            }

            for sample in samples {
                let now = Utc::now();
                self.downloads
                    .record(Observation::new(now, sample.receive_mbit));
                self.uploads
                    .record(Observation::new(now, sample.send_mbit));
            }
        }

        self.update_throughput_metrics();

        if let Some(change) = self.controller.evaluate(&self.downloads) {
            let line = match change.to {
                Regime::Degraded => format!(
                    "slow network detected, shortening poll interval to {}",
                    format_duration(change.wait)
                ),
                Regime::Normal => format!(
                    "fast network detected, restoring poll interval to {}",
                    format_duration(change.wait)
                ),
            };
            info!(regime = change.to.label(), threshold = change.threshold, "{line}");
            self.journal.append(&line);
        }

        self.metrics
            .set(keys::MEASUREMENTS, self.downloads.len().to_string());
        Ok(())
    }

    fn update_throughput_metrics(&self) {
        if let Some(latest) = self.downloads.latest() {
            self.metrics
                .set(keys::LAST_DOWNLOAD, format!("{}mbit/s", latest.value));
        }
        if let Some(latest) = self.uploads.latest() {
            self.metrics
                .set(keys::LAST_UPLOAD, format!("{}mbit/s", latest.value));
        }
        if let Some(min) = self.downloads.min() {
            self.metrics.set(keys::MIN_DOWNLOAD, format!("{min}mbit/s"));
        }
        if let Some(max) = self.downloads.max() {
            self.metrics.set(keys::MAX_DOWNLOAD, format!("{max}mbit/s"));
        }
        if let Some(avg) = self.downloads.average() {
            self.metrics
                .set(keys::AVERAGE_DOWNLOAD, format!("{}mbit/s", avg.round()));
        }
    }

    /// Metrics derived from accumulated state, refreshed once per wait
    /// tick.
    fn refresh_derived_metrics(&self) {
        if let Some(next) = self.next_wake {
            let remaining = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.metrics
                .set(keys::TIME_TO_NEXT, format_duration(remaining));
        }

        if let Some(threshold) = self.controller.threshold(&self.downloads) {
            self.metrics
                .set(keys::SLOW_THRESHOLD, format!("{threshold}mbit/s"));
        }

        let cutoff = Utc::now() - TimeDelta::minutes(10);
        self.metrics.set(
            keys::PACKET_LOSS_10M,
            format!("{}%", packet_loss_percent(&self.pings, Window::Since(cutoff))),
        );
        self.metrics.set(
            keys::PACKET_LOSS_LAST_100,
            format!("{}%", packet_loss_percent(&self.pings, Window::Recent(100))),
        );

        if let Some(avg) = self.pings.nonzero_average() {
            self.metrics
                .set(keys::PING_AVERAGE, format!("{}ms", avg.round()));
        }
    }

    fn flush_journal(&self) {
        if let Err(e) = self.journal.flush() {
            warn!(error = %e, "journal flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullDashboard;
    use crate::probe::{ProbeError, ProbeReply, ProbeTarget, ProbeTransport};
    use crate::source::{SourceError, TransferSample};

    struct AlwaysUp;

    impl ProbeTransport for AlwaysUp {
        fn send_probe(&self, _destination: &str) -> Result<ProbeReply, ProbeError> {
            Ok(ProbeReply {
                round_trip_ms: 12,
                ttl: Some(64),
            })
        }
    }

    /// Source that reports a fixed pair and emits one line per run.
    struct FixedSource {
        rate: f64,
        fail: bool,
    }

    impl FixedSource {
        fn new(rate: f64) -> Self {
            Self { rate, fail: false }
        }

        fn failing() -> Self {
            Self {
                rate: 0.0,
                fail: true,
            }
        }
    }

    impl SpeedSource for FixedSource {
        fn description(&self) -> &str {
            "fixed"
        }

        fn measure(
            &mut self,
            emit: &mut dyn FnMut(&str),
        ) -> Result<Vec<TransferSample>, SourceError> {
            if self.fail {
                return Err(SourceError::NoSummary {
                    source_name: "fixed".to_string(),
                });
            }
            emit(&format!("fixed source measured '{}'", self.rate));
            Ok(vec![TransferSample {
                receive_mbit: self.rate,
                send_mbit: self.rate / 10.0,
            }])
        }

        fn parse_log_line(&self, _line: &str) -> Vec<Observation> {
            Vec::new()
        }
    }

    fn monitor(source: FixedSource, repetitions: u32) -> (Monitor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(dir.path().join("log.txt")).unwrap());
        let destinations = vec!["a.example".to_string()];
        let metrics = Arc::new(MetricRegistry::new(&destinations, Arc::new(NullDashboard)));
        let pings = MetricStream::new();
        let targets = destinations
            .iter()
            .map(|d| Arc::new(ProbeTarget::new(d.clone(), MetricStream::new())))
            .collect();
        let prober = Prober::new(
            targets,
            Arc::new(AlwaysUp),
            pings.clone(),
            Arc::clone(&journal),
            Arc::clone(&metrics),
        );
        let config = MonitorConfig {
            normal_interval: Duration::from_secs(60),
            degraded_interval: Duration::ZERO,
            probe_repetitions: repetitions,
        };
        let sources: Vec<Box<dyn SpeedSource>> = vec![Box::new(source)];
        let monitor = Monitor::new(
            config,
            sources,
            prober,
            journal,
            metrics,
            MetricStream::new(),
            MetricStream::new(),
            pings,
        );
        (monitor, dir)
    }

    #[test]
    fn test_cycle_measures_and_probes() {
        let (mut monitor, dir) = monitor(FixedSource::new(50.0), 2);

        monitor.cycle().unwrap();

        assert_eq!(monitor.downloads.len(), 1);
        assert_eq!(monitor.uploads.len(), 1);
        assert_eq!(monitor.downloads.latest().unwrap().value, 50.0);
        assert_eq!(monitor.pings.len(), 2, "two ping-phase repetitions");

        let content = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert!(content.contains("fixed source measured '50'"));
        assert!(content.contains("Ping to a.example"));
        assert_eq!(monitor.metrics.get(keys::MEASUREMENTS).as_deref(), Some("1"));
    }

    #[test]
    fn test_source_error_abandons_iteration() {
        let (mut monitor, _dir) = monitor(FixedSource::failing(), 5);

        assert!(monitor.cycle().is_err());
        assert!(monitor.downloads.is_empty());
        assert!(monitor.pings.is_empty(), "ping phase must be skipped");
    }

    #[test]
    fn test_force_signal_shortcuts_wait() {
        let (mut monitor, _dir) = monitor(FixedSource::new(50.0), 1);
        monitor.controller = IntervalController::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        monitor.signals.force_measure();

        let started = Instant::now();
        monitor.cycle().unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(monitor.downloads.len(), 1);
    }

    #[test]
    fn test_run_exits_on_stop() {
        let (mut monitor, _dir) = monitor(FixedSource::new(50.0), 1);
        monitor.signals.request_stop();
        monitor.run();
        assert_eq!(monitor.metrics.get(keys::STATE).as_deref(), Some("Stopped"));
    }

    #[test]
    fn test_regime_change_is_journaled() {
        let (mut monitor, dir) = monitor(FixedSource::new(25.0), 1);
        for v in [10.0, 10.0, 10.0, 100.0] {
            monitor.downloads.record(Observation::now(v));
        }

        // Initial regime is degraded; 25 > 20 flips it to normal.
        monitor.measure_phase().unwrap();
        monitor.flush_journal();

        assert_eq!(monitor.controller.regime(), Regime::Normal);
        let content = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert!(content.contains("fast network detected"));
    }

    #[test]
    fn test_replay_seeds_statistics_and_metrics() {
        let (monitor, dir) = monitor(FixedSource::new(50.0), 1);
        std::fs::write(
            dir.path().join("log.txt"),
            "Mon, 01 Jan 2024 00:00:00 GMT|Ping to a.example with 32 bytes of zeros: Ping result Success time=20ms TTL=64\n",
        )
        .unwrap();

        let summary = monitor.replay().unwrap();
        assert_eq!(summary.ping_observations, 1);
        assert_eq!(monitor.pings.len(), 1);
        assert_eq!(monitor.prober.targets()[0].sent(), 1);
        assert_eq!(monitor.metrics.get(keys::IMPORTED).as_deref(), Some("0"));
    }
}
