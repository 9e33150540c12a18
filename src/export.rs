//! Exports of accumulated statistics.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeDelta, Utc};

use crate::journal::format_timestamp;
use crate::metrics::MetricRegistry;
use crate::probe::{packet_loss_percent, ProbeTarget};
use crate::stats::{MetricStream, Window};

/// Write the download history as a semicolon-separated file.
///
/// One row per observation, newest data wherever it happens to sit in
/// the stream; consumers sort by the date column.
pub fn export_csv(downloads: &MetricStream, path: &Path) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "Download;Date")?;
    for obs in downloads.window(Window::All) {
        writeln!(out, "{:.3};{}", obs.value, format_timestamp(obs.at))?;
    }
    out.flush()
}

/// Write a JSON summary of the current monitor state.
pub fn export_state_json(
    metrics: &MetricRegistry,
    downloads: &MetricStream,
    pings: &MetricStream,
    targets: &[Arc<ProbeTarget>],
    path: &Path,
) -> Result<()> {
    let cutoff = Utc::now() - TimeDelta::minutes(10);

    let destinations: Vec<serde_json::Value> = targets
        .iter()
        .map(|t| {
            serde_json::json!({
                "destination": t.destination(),
                "sent": t.sent(),
                "failed": t.failed(),
                "average_ms": t.average_ms(),
            })
        })
        .collect();

    let export = serde_json::json!({
        "summary": {
            "measurements": downloads.len(),
            "min_download_mbit": downloads.min(),
            "max_download_mbit": downloads.max(),
            "average_download_mbit": downloads.average(),
            "ping_average_ms": pings.nonzero_average(),
            "packet_loss_10m_percent": packet_loss_percent(pings, Window::Since(cutoff)),
            "packet_loss_last_100_percent": packet_loss_percent(pings, Window::Recent(100)),
        },
        "destinations": destinations,
        "metrics": metrics.snapshot(),
    });

    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, &export)?;
    out.flush()?;
    Ok(())
}
