//! Dashboard-visible named metrics.
//!
//! The registry is the contract the monitoring engine exposes to whatever
//! renders it: an explicitly declared, insertion-ordered list of metrics,
//! each with its current rendered value, a short ring of previous values,
//! and a tendency marker. The engine only ever notifies the renderer
//! through the opaque [`Dashboard::render_now`] callback; how (or whether)
//! anything is drawn is not its concern.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// How many previous rendered values each metric retains.
const HISTORY_DEPTH: usize = 8;

/// Direction of the last value change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tendency {
    Rising,
    Falling,
    Flat,
}

impl Tendency {
    /// Returns a short symbol for display.
    pub fn symbol(&self) -> &'static str {
        match self {
            Tendency::Rising => "+",
            Tendency::Falling => "-",
            Tendency::Flat => "",
        }
    }
}

/// One dashboard-visible quantity.
#[derive(Debug, Clone, Serialize)]
pub struct NamedMetric {
    pub name: String,
    /// Whether a rising value is an improvement (throughput) or a
    /// degradation (latency, loss).
    pub rising_is_good: bool,
    pub value: Option<String>,
    pub tendency: Tendency,
    /// Previous rendered values, most recent first.
    pub history: VecDeque<String>,
}

impl NamedMetric {
    fn new(name: &str, rising_is_good: bool) -> Self {
        Self {
            name: name.to_string(),
            rising_is_good,
            value: None,
            tendency: Tendency::Flat,
            history: VecDeque::with_capacity(HISTORY_DEPTH),
        }
    }

    /// Extract the leading numeric part of a rendered value, if any.
    ///
    /// Rendered values carry units ("87mbit/s", "23ms", "4%"); tendency
    /// comparison only cares about the number in front.
    pub fn parse_value(rendered: &str) -> Option<f64> {
        let numeric: String = rendered
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        numeric.parse().ok()
    }

    fn apply(&mut self, rendered: String) {
        let tendency = match (
            self.value.as_deref().and_then(Self::parse_value),
            Self::parse_value(&rendered),
        ) {
            (Some(old), Some(new)) if new > old => Tendency::Rising,
            (Some(old), Some(new)) if new < old => Tendency::Falling,
            _ => Tendency::Flat,
        };

        if let Some(old) = self.value.replace(rendered) {
            self.history.push_front(old);
            self.history.truncate(HISTORY_DEPTH);
        }
        self.tendency = tendency;
    }
}

/// Opaque "render now" notification to whatever displays the metrics.
///
/// Fired on every effective value change; implementations decide how to
/// coalesce and draw. Must be cheap and must never block the caller for
/// long, since probe workers notify from their own threads.
pub trait Dashboard: Send + Sync {
    fn render_now(&self);
}

/// A dashboard that ignores every notification.
#[derive(Debug, Default)]
pub struct NullDashboard;

impl Dashboard for NullDashboard {
    fn render_now(&self) {}
}

/// Well-known metric names declared by the engine.
pub mod keys {
    pub const STATE: &str = "State";
    pub const TIME_TO_NEXT: &str = "Next measurement";
    pub const LAST_DOWNLOAD: &str = "Last download";
    pub const LAST_UPLOAD: &str = "Last upload";
    pub const AVERAGE_DOWNLOAD: &str = "Average download";
    pub const SLOW_THRESHOLD: &str = "Slow threshold";
    pub const MAX_DOWNLOAD: &str = "Max download";
    pub const MIN_DOWNLOAD: &str = "Min download";
    pub const MEASUREMENTS: &str = "Measurements";
    pub const PING_AVERAGE: &str = "Ping average";
    pub const PINGS: &str = "Pings";
    pub const PACKET_LOSS_10M: &str = "Packet loss 10m";
    pub const PACKET_LOSS_LAST_100: &str = "Packet loss last 100";
    pub const IMPORTED: &str = "Imported";

    /// Per-destination probe counters and latency average.
    pub fn sent(destination: &str) -> String {
        format!("{destination} sent")
    }

    pub fn failed(destination: &str) -> String {
        format!("{destination} failed")
    }

    pub fn average(destination: &str) -> String {
        format!("{destination} average")
    }
}

/// The ordered metric list, safe to update from probe worker threads.
pub struct MetricRegistry {
    inner: Mutex<Inner>,
    dashboard: Arc<dyn Dashboard>,
}

struct Inner {
    metrics: Vec<NamedMetric>,
    index: HashMap<String, usize>,
}

impl MetricRegistry {
    /// Build the registry with the engine's fixed metric list plus the
    /// per-destination entries, in display order.
    pub fn new(destinations: &[String], dashboard: Arc<dyn Dashboard>) -> Self {
        let mut metrics = Vec::new();

        let fixed: &[(&str, bool)] = &[
            (keys::STATE, true),
            (keys::TIME_TO_NEXT, true),
            (keys::LAST_DOWNLOAD, true),
            (keys::LAST_UPLOAD, true),
            (keys::AVERAGE_DOWNLOAD, true),
            (keys::SLOW_THRESHOLD, true),
            (keys::MAX_DOWNLOAD, true),
            (keys::MIN_DOWNLOAD, true),
            (keys::MEASUREMENTS, true),
            (keys::PING_AVERAGE, false),
            (keys::PINGS, true),
            (keys::PACKET_LOSS_10M, false),
            (keys::PACKET_LOSS_LAST_100, false),
            (keys::IMPORTED, true),
        ];
        for (name, rising_is_good) in fixed {
            metrics.push(NamedMetric::new(name, *rising_is_good));
        }

        for destination in destinations {
            metrics.push(NamedMetric::new(&keys::average(destination), false));
            metrics.push(NamedMetric::new(&keys::failed(destination), false));
            metrics.push(NamedMetric::new(&keys::sent(destination), true));
        }

        let index = metrics
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();

        Self {
            inner: Mutex::new(Inner { metrics, index }),
            dashboard,
        }
    }

    /// Update a metric's rendered value.
    ///
    /// Unchanged values are a no-op and do not notify the dashboard.
    pub fn set(&self, name: &str, value: impl Into<String>) {
        let value = value.into();
        {
            let mut inner = self.inner.lock();
            let Some(&i) = inner.index.get(name) else {
                warn!(metric = name, "update for undeclared metric ignored");
                return;
            };
            if inner.metrics[i].value.as_deref() == Some(value.as_str()) {
                return;
            }
            inner.metrics[i].apply(value);
        }
        self.dashboard.render_now();
    }

    /// Current value of a metric, if it has ever been set.
    pub fn get(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        let i = *inner.index.get(name)?;
        inner.metrics[i].value.clone()
    }

    /// A point-in-time copy of every metric, in display order.
    pub fn snapshot(&self) -> Vec<NamedMetric> {
        self.inner.lock().metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDashboard {
        renders: AtomicUsize,
    }

    impl Dashboard for CountingDashboard {
        fn render_now(&self) {
            self.renders.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> (Arc<CountingDashboard>, MetricRegistry) {
        let dashboard = Arc::new(CountingDashboard::default());
        let registry = MetricRegistry::new(&["google.de".to_string()], dashboard.clone());
        (dashboard, registry)
    }

    #[test]
    fn test_set_notifies_dashboard_once_per_change() {
        let (dashboard, registry) = registry();

        registry.set(keys::STATE, "Wait");
        registry.set(keys::STATE, "Wait");
        registry.set(keys::STATE, "Measure");

        assert_eq!(dashboard.renders.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get(keys::STATE).as_deref(), Some("Measure"));
    }

    #[test]
    fn test_tendency_from_numeric_prefix() {
        let (_, registry) = registry();

        registry.set(keys::LAST_DOWNLOAD, "50mbit/s");
        registry.set(keys::LAST_DOWNLOAD, "75mbit/s");
        let snap = registry.snapshot();
        let metric = snap.iter().find(|m| m.name == keys::LAST_DOWNLOAD).unwrap();
        assert_eq!(metric.tendency, Tendency::Rising);

        registry.set(keys::LAST_DOWNLOAD, "20mbit/s");
        let snap = registry.snapshot();
        let metric = snap.iter().find(|m| m.name == keys::LAST_DOWNLOAD).unwrap();
        assert_eq!(metric.tendency, Tendency::Falling);
        assert_eq!(metric.history.front().map(String::as_str), Some("75mbit/s"));
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let (_, registry) = registry();

        for i in 0..20 {
            registry.set(keys::PINGS, i.to_string());
        }
        let snap = registry.snapshot();
        let metric = snap.iter().find(|m| m.name == keys::PINGS).unwrap();
        assert_eq!(metric.history.len(), 8);
        assert_eq!(metric.history.front().map(String::as_str), Some("18"));
    }

    #[test]
    fn test_undeclared_metric_is_ignored() {
        let (dashboard, registry) = registry();
        registry.set("no such metric", "1");
        assert_eq!(dashboard.renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_per_destination_metrics_declared() {
        let (_, registry) = registry();
        registry.set(&keys::sent("google.de"), "3");
        assert_eq!(registry.get(&keys::sent("google.de")).as_deref(), Some("3"));
    }

    #[test]
    fn test_parse_value_strips_units() {
        assert_eq!(NamedMetric::parse_value("87mbit/s"), Some(87.0));
        assert_eq!(NamedMetric::parse_value("23.5ms"), Some(23.5));
        assert_eq!(NamedMetric::parse_value("Wait"), None);
    }
}
