//! Rolling statistics over timestamped observations.
//!
//! Every quantity the monitor measures (download rate, upload rate, ping
//! round-trip times) is appended to a [`MetricStream`] and never removed:
//! the journal, not memory pruning, is the durability mechanism. Streams
//! are cheap cloneable handles so probe workers, the scheduler, and replay
//! can all append to the same history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// One timestamped numeric sample.
///
/// Immutable once created; produced by measurement sources, the prober,
/// or journal replay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub at: DateTime<Utc>,
    pub value: f64,
}

impl Observation {
    pub fn new(at: DateTime<Utc>, value: f64) -> Self {
        Self { at, value }
    }

    /// An observation stamped with the current time.
    pub fn now(value: f64) -> Self {
        Self::new(Utc::now(), value)
    }
}

/// Which slice of a stream an aggregate should consider.
#[derive(Debug, Clone, Copy)]
pub enum Window {
    /// Every observation ever recorded.
    All,
    /// Observations at or after the given instant.
    Since(DateTime<Utc>),
    /// The most recent `n` observations, ordered by timestamp.
    Recent(usize),
}

/// An append-only, thread-safe history of observations for one signal.
///
/// Entries are retained for the life of the process and duplicate
/// timestamps are allowed. `record` never fails; readers see either the
/// state before or after any concurrent append, never a torn observation.
#[derive(Debug, Clone, Default)]
pub struct MetricStream {
    inner: Arc<RwLock<Vec<Observation>>>,
}

impl MetricStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation. Never fails and never blocks readers for
    /// longer than the push itself.
    pub fn record(&self, obs: Observation) {
        self.inner.write().push(obs);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Fold an aggregate over a snapshot of the requested window.
    ///
    /// The snapshot is taken under the read lock, so concurrent appends
    /// are either fully included or fully excluded.
    pub fn aggregate<T>(&self, window: Window, f: impl FnOnce(&[Observation]) -> T) -> T {
        let slice = self.window(window);
        f(&slice)
    }

    /// Materialize the requested window, oldest first.
    pub fn window(&self, window: Window) -> Vec<Observation> {
        let guard = self.inner.read();
        match window {
            Window::All => guard.to_vec(),
            Window::Since(cutoff) => guard.iter().copied().filter(|o| o.at >= cutoff).collect(),
            Window::Recent(n) => {
                let mut all = guard.to_vec();
                drop(guard);
                all.sort_by_key(|o| o.at);
                if all.len() > n {
                    all.split_off(all.len() - n)
                } else {
                    all
                }
            }
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.aggregate(Window::All, |obs| {
            obs.iter().map(|o| o.value).min_by(|a, b| a.total_cmp(b))
        })
    }

    pub fn max(&self) -> Option<f64> {
        self.aggregate(Window::All, |obs| {
            obs.iter().map(|o| o.value).max_by(|a, b| a.total_cmp(b))
        })
    }

    pub fn average(&self) -> Option<f64> {
        self.aggregate(Window::All, |obs| {
            if obs.is_empty() {
                None
            } else {
                Some(obs.iter().map(|o| o.value).sum::<f64>() / obs.len() as f64)
            }
        })
    }

    /// The observation with the latest timestamp.
    pub fn latest(&self) -> Option<Observation> {
        self.aggregate(Window::All, |obs| {
            obs.iter().copied().max_by_key(|o| o.at)
        })
    }

    /// Average over the non-zero observations only.
    ///
    /// Zero-valued entries in the ping stream mark failed probes; they
    /// must not drag the latency average down.
    pub fn nonzero_average(&self) -> Option<f64> {
        self.aggregate(Window::All, |obs| {
            let values: Vec<f64> = obs.iter().map(|o| o.value).filter(|v| *v != 0.0).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        })
    }
}

/// Named stream registry shared by the scheduler, the prober, and replay.
///
/// Streams are created on first use and live for the process lifetime.
#[derive(Debug, Default)]
pub struct StatsStore {
    streams: RwLock<BTreeMap<String, MetricStream>>,
}

/// Stream name for download throughput observations.
pub const DOWNLOAD: &str = "download";
/// Stream name for upload throughput observations.
pub const UPLOAD: &str = "upload";
/// Stream name for the aggregate ping stream (all destinations, failures
/// recorded as zero-valued observations).
pub const PING: &str = "ping";

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the stream for a signal name.
    pub fn stream(&self, name: &str) -> MetricStream {
        // Fast path: the stream already exists
        {
            let streams = self.streams.read();
            if let Some(stream) = streams.get(name) {
                return stream.clone();
            }
        }

        let mut streams = self.streams.write();
        streams.entry(name.to_string()).or_default().clone()
    }

    /// Append to a named stream, creating it if needed.
    pub fn record(&self, name: &str, obs: Observation) {
        self.stream(name).record(obs);
    }

    /// The stream name for one destination's latency samples.
    pub fn ping_stream_name(destination: &str) -> String {
        format!("ping:{destination}")
    }
}
