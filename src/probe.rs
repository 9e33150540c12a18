//! Reachability probing of fixed destinations.
//!
//! Each probe cycle forks one worker per destination, runs the requested
//! repetitions sequentially inside that worker, and joins everything
//! before returning. Workers share the aggregate ping stream and the
//! journal; both tolerate concurrent appends. The underlying probe
//! facility is fallible by contract and never brings a cycle down.

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::journal::Journal;
use crate::metrics::{keys, MetricRegistry};
use crate::stats::{MetricStream, Observation, Window};

/// Probe payload size in bytes, fixed for every attempt.
pub const PAYLOAD_BYTES: u32 = 32;

/// Per-attempt timeout for the shipped transport.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A successful reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub round_trip_ms: u64,
    pub ttl: Option<u32>,
}

/// Why a probe attempt produced no reply.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,

    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("probe facility failed: {0}")]
    Facility(String),
}

/// The underlying reachability-probe facility.
///
/// One blocking call per attempt, with a fixed payload size and a bounded
/// per-attempt timeout. Implementations must return errors rather than
/// panic; the prober records failures and moves on.
pub trait ProbeTransport: Send + Sync {
    fn send_probe(&self, destination: &str) -> Result<ProbeReply, ProbeError>;
}

/// Transport that shells out to the system `ping` utility.
#[derive(Debug)]
pub struct SystemPing {
    rtt_re: Regex,
    ttl_re: Regex,
}

impl Default for SystemPing {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPing {
    pub fn new() -> Self {
        Self {
            rtt_re: Regex::new(r"time=([0-9.]+) ?ms").expect("static regex"),
            ttl_re: Regex::new(r"ttl=([0-9]+)").expect("static regex"),
        }
    }
}

impl ProbeTransport for SystemPing {
    fn send_probe(&self, destination: &str) -> Result<ProbeReply, ProbeError> {
        let output = Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(PROBE_TIMEOUT.as_secs().to_string())
            .arg("-s")
            .arg(PAYLOAD_BYTES.to_string())
            .arg(destination)
            .output()
            .map_err(|e| ProbeError::Facility(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // Exit code 1 is "no reply", anything else is a hard error
            // (unknown host, permission trouble).
            return match output.status.code() {
                Some(1) => Err(ProbeError::Timeout),
                _ => Err(ProbeError::Unreachable(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                )),
            };
        }

        let round_trip_ms = self
            .rtt_re
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|ms| ms.round() as u64)
            .ok_or_else(|| ProbeError::Facility("reply without a time field".to_string()))?;

        let ttl = self
            .ttl_re
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        Ok(ProbeReply { round_trip_ms, ttl })
    }
}

/// Per-destination probe state: monotonically increasing attempt
/// counters plus the latency sample stream (successes only).
#[derive(Debug)]
pub struct ProbeTarget {
    destination: String,
    sent: AtomicU64,
    failed: AtomicU64,
    samples: MetricStream,
}

impl ProbeTarget {
    pub fn new(destination: impl Into<String>, samples: MetricStream) -> Self {
        Self {
            destination: destination.into(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            samples,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> &MetricStream {
        &self.samples
    }

    /// Count one attempt; returns the new total.
    pub fn record_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one failed attempt; returns the new total.
    pub fn record_failure(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Running latency average over this destination's successes, ms.
    pub fn average_ms(&self) -> Option<f64> {
        self.samples.average()
    }
}

/// Packet-loss percentage over a window of the aggregate ping stream.
///
/// Zero-valued observations mark failed attempts. An empty window is 0%
/// loss by definition, never a division by zero.
pub fn packet_loss_percent(pings: &MetricStream, window: Window) -> u32 {
    pings.aggregate(window, |obs| {
        if obs.is_empty() {
            return 0;
        }
        let failed = obs.iter().filter(|o| o.value == 0.0).count();
        (100.0 * failed as f64 / obs.len() as f64).round() as u32
    })
}

/// Issues probes to every destination in parallel and records the
/// results.
pub struct Prober {
    targets: Vec<Arc<ProbeTarget>>,
    transport: Arc<dyn ProbeTransport>,
    pings: MetricStream,
    journal: Arc<Journal>,
    metrics: Arc<MetricRegistry>,
}

impl Prober {
    pub fn new(
        targets: Vec<Arc<ProbeTarget>>,
        transport: Arc<dyn ProbeTransport>,
        pings: MetricStream,
        journal: Arc<Journal>,
        metrics: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            targets,
            transport,
            pings,
            journal,
            metrics,
        }
    }

    pub fn targets(&self) -> &[Arc<ProbeTarget>] {
        &self.targets
    }

    /// Run `repetitions` probe attempts against every destination.
    ///
    /// Destinations run in parallel, repetitions within one destination
    /// sequentially. All workers are joined before this returns.
    pub fn probe(&self, repetitions: u32) {
        let total = repetitions as u64 * self.targets.len() as u64;
        let attempts = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for target in &self.targets {
                let attempts = &attempts;
                scope.spawn(move || {
                    for _ in 0..repetitions {
                        let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                        self.metrics
                            .set(keys::STATE, format!("Ping {n} of {total}"));
                        self.probe_once(target);
                    }
                });
            }
        });

        self.metrics.set(keys::PINGS, self.pings.len().to_string());
    }

    fn probe_once(&self, target: &ProbeTarget) {
        let destination = target.destination();
        let sent = target.record_sent();
        self.metrics.set(&keys::sent(destination), sent.to_string());

        let prefix = format!("Ping to {destination} with {PAYLOAD_BYTES} bytes of zeros: ");

        match self.transport.send_probe(destination) {
            Ok(reply) => {
                let rtt = reply.round_trip_ms as f64;
                self.pings.record(Observation::now(rtt));
                target.samples().record(Observation::now(rtt));

                if let Some(avg) = target.average_ms() {
                    let rounded = (avg * 1000.0).round() / 1000.0;
                    self.metrics
                        .set(&keys::average(destination), format!("{rounded}ms"));
                }

                let ttl = reply
                    .ttl
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".to_string());
                self.journal.append(&format!(
                    "{prefix}Ping result Success time={}ms TTL={ttl}",
                    reply.round_trip_ms
                ));
            }
            Err(err) => {
                let failed = target.record_failure();
                self.metrics
                    .set(&keys::failed(destination), failed.to_string());
                // Failures still count toward loss, so the aggregate
                // stream gets a zero-valued observation; the destination
                // latency stream stays untouched.
                self.pings.record(Observation::now(0.0));
                self.journal.append(&format!("{prefix}Error: {err}"));
            }
        }
    }
}
