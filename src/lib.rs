//! # linkwatch
//!
//! A long-running network-health monitor. It periodically measures link
//! throughput and latency to a fixed set of destinations, appends every
//! observation to a durable, human-readable journal, and adapts its
//! polling cadence to current network conditions: a degraded link is
//! re-measured every few seconds, a healthy one once a minute.
//!
//! After a restart the monitor replays its own journal and rebuilds all
//! in-memory statistics from it, so history survives the process.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Monitor loop                          │
//! │   Wait ──▶ Measure ──▶ Ping ──▶ Wait ──▶ ...                 │
//! │    │          │          │                                   │
//! │    │          ▼          ▼                                   │
//! │    │    ┌──────────┐ ┌────────┐     ┌──────────────────┐     │
//! │    └───▶│ sources  │ │ prober │────▶│  stats streams   │     │
//! │  ticks  │(iperf,   │ │(ping)  │     │(download/upload/ │     │
//! │         │ http)    │ │        │     │ ping histories)  │     │
//! │         └────┬─────┘ └───┬────┘     └────────┬─────────┘     │
//! │              │           │                   │               │
//! │              ▼           ▼                   ▼               │
//! │         ┌─────────────────────┐     ┌─────────────────┐      │
//! │         │   journal (file)    │     │ interval control│      │
//! │         │ append + replay     │     │ Normal/Degraded │      │
//! │         └─────────────────────┘     └─────────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`stats`]**: append-only observation streams with windowed
//!   aggregates, shared between the scheduler, probe workers, and replay
//! - **[`source`]**: the measurement backend seam ([`SpeedSource`]) with
//!   an iperf3 subprocess source and an HTTP peer-list source
//! - **[`probe`]**: parallel reachability probing with per-destination
//!   counters and packet-loss accounting
//! - **[`interval`]**: the two-regime adaptive wait controller
//! - **[`journal`]**: the timestamp-prefixed append-only log and its
//!   startup replay
//! - **[`scheduler`]**: the wait/measure/ping loop tying it together
//! - **[`metrics`]**: the ordered named-metric registry the dashboard
//!   renders from
//!
//! ## Usage
//!
//! ```bash
//! # Monitor with the HTTP peer source, journaling to net.log
//! linkwatch net.log --peer mirror.example.org=https://mirror.example.org/100MB.bin
//!
//! # Add an iperf3 server as a second source
//! linkwatch net.log --iperf-server speedtest.example.net
//! ```

pub mod duration;
pub mod export;
pub mod interval;
pub mod journal;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod source;
pub mod stats;

// Re-export the main types for convenience
pub use interval::{IntervalController, Regime};
pub use journal::{Journal, JournalError, ReplaySummary, Replayer};
pub use metrics::{Dashboard, MetricRegistry, NamedMetric, NullDashboard, Tendency};
pub use probe::{ProbeReply, ProbeTarget, ProbeTransport, Prober, SystemPing};
pub use scheduler::{Monitor, MonitorConfig, Signals};
pub use source::{
    HttpSpeedSource, HttpTransferProvider, IperfSource, Peer, SourceError, SpeedSource,
    TransferProvider, TransferSample,
};
pub use stats::{MetricStream, Observation, StatsStore, Window};
