//! Measurement source abstraction.
//!
//! A source is a pluggable throughput backend. The engine only relies on
//! two capabilities: run a measurement while streaming progress lines
//! through a callback, and parse a previously emitted progress line back
//! into observations. The second is the inverse of the first, which is
//! what makes the journal replayable: any line a source ever wrote can be
//! fed back to that same source after a restart.

mod iperf;
mod speedtest;

pub use iperf::IperfSource;
pub use speedtest::{HttpSpeedSource, HttpTransferProvider, Peer, TransferProvider};

use thiserror::Error;

use crate::stats::Observation;

/// One measured receive/send throughput pair, in decimal megabits per
/// second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSample {
    pub receive_mbit: f64,
    pub send_mbit: f64,
}

/// Errors that abort a source's measurement run.
///
/// Per-peer trouble (an unresponsive peer, a not-a-number rate) is
/// absorbed inside the source; these errors mean the whole run produced
/// nothing usable and the current cycle should be abandoned.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The external measurement command could not be started.
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external command ran but produced no parseable summary.
    #[error("no usable summary in {source_name} output")]
    NoSummary { source_name: String },

    /// The transfer provider could not supply any peers.
    #[error("transfer provider error: {0}")]
    Provider(String),
}

/// Trait for throughput measurement backends.
///
/// `measure` is long-running (seconds to tens of seconds) and blocks the
/// calling thread; every progress line it pushes through `emit` is
/// journaled as it appears. `parse_log_line` must recognize exactly the
/// lines its own `measure` emits and return the download observations
/// they encode, so that replaying a journal rebuilds the same download
/// history the live run recorded.
pub trait SpeedSource: Send {
    /// Returns a human-readable description of the source.
    fn description(&self) -> &str;

    /// Run one measurement, streaming progress lines through `emit`.
    ///
    /// Returns zero or more receive/send pairs: a process-based source
    /// reports exactly one pair per invocation, a peer-list source one
    /// pair per responsive peer. Never returns NaN rates.
    fn measure(
        &mut self,
        emit: &mut dyn FnMut(&str),
    ) -> Result<Vec<TransferSample>, SourceError>;

    /// Parse one journal line previously emitted by this source.
    ///
    /// Lines emitted by other sources, or free-text diagnostics, yield an
    /// empty vector. The line may or may not carry the journal's
    /// `timestamp|` prefix.
    fn parse_log_line(&self, line: &str) -> Vec<Observation>;
}
