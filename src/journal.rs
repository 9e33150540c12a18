//! The durable observation journal.
//!
//! Every event the monitor produces becomes one timestamp-prefixed line
//! in an append-only UTF-8 text file:
//!
//! ```text
//! <RFC-1123 timestamp>|<payload>
//! ```
//!
//! The file is both the write target during operation and, at startup,
//! the sole source of truth for rebuilding the in-memory statistics. The
//! writer is a bounded buffer behind a mutex, so lines from parallel
//! probe workers never interleave; the scheduler flushes it after every
//! measure and ping phase and on stop.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::probe::ProbeTarget;
use crate::source::SpeedSource;
use crate::stats::{MetricStream, Observation};

/// Write buffer size; at most this many bytes of journal can be lost on
/// an abrupt kill between flushes.
const WRITE_BUFFER_BYTES: usize = 6144;

/// Render a timestamp the way the journal line grammar expects.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC-1123 journal timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Errors opening the journal; runtime write errors are absorbed.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("cannot create journal directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open journal {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only, line-oriented event log.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (creating directories and file as needed) for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| JournalError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one payload as a timestamp-prefixed line.
    ///
    /// Returns the full line as written. Write errors are logged and
    /// swallowed: the monitor stays alive even if the disk misbehaves.
    pub fn append(&self, payload: &str) -> String {
        let line = format!("{}|{payload}", format_timestamp(Utc::now()));
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}") {
            warn!(error = %e, path = %self.path.display(), "journal write failed");
        }
        line
    }

    /// Flush the write buffer to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

/// Counters describing one replay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    pub ping_observations: usize,
    pub download_observations: usize,
}

/// Rebuilds in-memory statistics from an existing journal file.
///
/// Runs once at startup, before any concurrent writer exists. Each line
/// is classified: probe lines are parsed structurally and update the
/// matching destination's counters and streams; every other line is
/// offered to each measurement source, and whatever observations come
/// back land in the download stream. Malformed lines are skipped
/// silently; replay never aborts on a bad line.
pub struct Replayer<'a> {
    sources: &'a [Box<dyn SpeedSource>],
    targets: &'a [Arc<ProbeTarget>],
    pings: MetricStream,
    downloads: MetricStream,
    ping_result_re: Regex,
    error_re: Regex,
}

impl<'a> Replayer<'a> {
    pub fn new(
        sources: &'a [Box<dyn SpeedSource>],
        targets: &'a [Arc<ProbeTarget>],
        pings: MetricStream,
        downloads: MetricStream,
    ) -> Self {
        Self {
            sources,
            targets,
            pings,
            downloads,
            ping_result_re: Regex::new(r"Ping result (\w+) time=(\d+)").expect("static regex"),
            error_re: Regex::new(r"Error").expect("static regex"),
        }
    }

    /// Replay every line of the file, in order.
    ///
    /// A missing file is not an error: a fresh install simply has no
    /// history yet.
    pub fn replay_file(&self, path: &Path) -> std::io::Result<ReplaySummary> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no journal to replay");
                return Ok(ReplaySummary::default());
            }
            Err(e) => return Err(e),
        };

        let mut summary = ReplaySummary::default();
        for line in BufReader::new(file).lines() {
            let line = line?;
            self.replay_line(&line, &mut summary);
            summary.lines += 1;
        }
        Ok(summary)
    }

    fn replay_line(&self, line: &str, summary: &mut ReplaySummary) {
        if let Some((timestamp_part, payload)) = line.split_once('|') {
            if payload.starts_with("Ping to ") {
                self.replay_ping_line(timestamp_part, line, payload, summary);
                return;
            }
        }

        for source in self.sources {
            for obs in source.parse_log_line(line) {
                self.downloads.record(obs);
                summary.download_observations += 1;
            }
        }
    }

    fn replay_ping_line(
        &self,
        timestamp_part: &str,
        line: &str,
        payload: &str,
        summary: &mut ReplaySummary,
    ) {
        let Some(at) = parse_timestamp(timestamp_part) else {
            return;
        };

        let target = self
            .targets
            .iter()
            .find(|t| line.contains(t.destination()));

        for captures in self.ping_result_re.captures_iter(payload) {
            let status = &captures[1];
            let Ok(value) = captures[2].parse::<f64>() else {
                continue;
            };
            let obs = Observation::new(at, value);

            if let Some(target) = target {
                target.record_sent();
                if status == "Success" {
                    target.samples().record(obs);
                } else {
                    target.record_failure();
                }
            }

            self.pings.record(obs);
            summary.ping_observations += 1;
        }

        // Transport-error markers become zero-valued loss entries in the
        // aggregate stream; destination counters are left alone.
        for _ in self.error_re.find_iter(payload) {
            self.pings.record(Observation::new(at, 0.0));
            summary.ping_observations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceError, TransferSample};
    use chrono::TimeZone;
    use std::io::Write as _;

    #[test]
    fn test_timestamp_roundtrip() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rendered = format_timestamp(at);
        assert_eq!(rendered, "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(parse_timestamp(&rendered), Some(at));
    }

    #[test]
    fn test_append_prefixes_timestamp_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.txt");
        let journal = Journal::open(&path).unwrap();

        let line = journal.append("hello");
        journal.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{line}\n"));
        let (timestamp, payload) = content.trim_end().split_once('|').unwrap();
        assert!(parse_timestamp(timestamp).is_some());
        assert_eq!(payload, "hello");
    }

    #[test]
    fn test_concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let journal = Journal::open(&path).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let journal = &journal;
                scope.spawn(move || {
                    for j in 0..50 {
                        journal.append(&format!("worker {i} line {j}"));
                    }
                });
            }
        });
        journal.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 400);
        assert!(lines
            .iter()
            .all(|l| l.split_once('|').is_some_and(|(_, p)| p.starts_with("worker"))));
    }

    /// Minimal source whose lines are `rate '<value>'`.
    struct StubSource;

    impl SpeedSource for StubSource {
        fn description(&self) -> &str {
            "stub"
        }

        fn measure(
            &mut self,
            _emit: &mut dyn FnMut(&str),
        ) -> Result<Vec<TransferSample>, SourceError> {
            Ok(Vec::new())
        }

        fn parse_log_line(&self, line: &str) -> Vec<Observation> {
            let payload = line.split_once('|').map(|(_, p)| p).unwrap_or(line);
            payload
                .strip_prefix("rate '")
                .and_then(|rest| rest.strip_suffix('\''))
                .and_then(|v| v.parse().ok())
                .map(|value| vec![Observation::now(value)])
                .unwrap_or_default()
        }
    }

    fn replay_lines(lines: &[&str]) -> (ReplaySummary, MetricStream, MetricStream, Vec<Arc<ProbeTarget>>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        drop(file);

        let sources: Vec<Box<dyn SpeedSource>> = vec![Box::new(StubSource)];
        let targets = vec![Arc::new(ProbeTarget::new("google.de", MetricStream::new()))];
        let pings = MetricStream::new();
        let downloads = MetricStream::new();
        let replayer = Replayer::new(&sources, &targets, pings.clone(), downloads.clone());
        let summary = replayer.replay_file(&path).unwrap();
        (summary, pings, downloads, targets)
    }

    #[test]
    fn test_replay_ping_success_line() {
        let (summary, pings, _downloads, targets) = replay_lines(&[
            "Mon, 01 Jan 2024 00:00:00 GMT|Ping to google.de with 32 bytes of zeros: Ping result Success time=20ms TTL=64",
        ]);

        assert_eq!(summary.ping_observations, 1);
        assert_eq!(pings.len(), 1);
        assert_eq!(pings.latest().unwrap().value, 20.0);
        assert_eq!(targets[0].sent(), 1);
        assert_eq!(targets[0].failed(), 0);
        assert_eq!(targets[0].samples().len(), 1);
    }

    #[test]
    fn test_replay_failed_status_counts_failure() {
        let (_, pings, _, targets) = replay_lines(&[
            "Mon, 01 Jan 2024 00:00:00 GMT|Ping to google.de with 32 bytes of zeros: Ping result TimedOut time=0ms TTL=?",
        ]);

        assert_eq!(targets[0].sent(), 1);
        assert_eq!(targets[0].failed(), 1);
        assert_eq!(targets[0].samples().len(), 0);
        assert_eq!(pings.latest().unwrap().value, 0.0);
    }

    #[test]
    fn test_replay_error_without_destination() {
        let (summary, pings, _, targets) = replay_lines(&[
            "Mon, 01 Jan 2024 00:00:00 GMT|Ping to nowhere.invalid with 32 bytes of zeros: Error: timeout",
        ]);

        assert_eq!(summary.ping_observations, 1);
        assert_eq!(pings.len(), 1);
        assert_eq!(pings.latest().unwrap().value, 0.0);
        assert_eq!(targets[0].sent(), 0, "no destination counter may move");
        assert_eq!(targets[0].failed(), 0);
    }

    #[test]
    fn test_replay_source_lines_land_in_downloads() {
        let (summary, _, downloads, _) = replay_lines(&[
            "Mon, 01 Jan 2024 00:00:00 GMT|rate '87.5'",
            "some free-text diagnostic that parses nowhere",
        ]);

        assert_eq!(summary.download_observations, 1);
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads.latest().unwrap().value, 87.5);
        assert_eq!(summary.lines, 2);
    }

    #[test]
    fn test_replay_does_not_deduplicate_repeated_lines() {
        let (summary, _, downloads, _) = replay_lines(&[
            "Mon, 01 Jan 2024 00:00:00 GMT|rate '87.5'",
            "Mon, 01 Jan 2024 00:00:00 GMT|rate '87.5'",
        ]);

        assert_eq!(summary.download_observations, 2);
        assert_eq!(downloads.len(), 2);
    }

    #[test]
    fn test_replay_skips_malformed_timestamps() {
        let (summary, pings, _, _) = replay_lines(&[
            "not a timestamp|Ping to google.de with 32 bytes of zeros: Ping result Success time=20ms TTL=64",
        ]);

        assert_eq!(summary.ping_observations, 0);
        assert!(pings.is_empty());
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let sources: Vec<Box<dyn SpeedSource>> = Vec::new();
        let targets: Vec<Arc<ProbeTarget>> = Vec::new();
        let replayer = Replayer::new(
            &sources,
            &targets,
            MetricStream::new(),
            MetricStream::new(),
        );
        let summary = replayer
            .replay_file(Path::new("/nonexistent/journal.txt"))
            .unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let lines = &[
            "Mon, 01 Jan 2024 00:00:00 GMT|Ping to google.de with 32 bytes of zeros: Ping result Success time=20ms TTL=64",
            "Mon, 01 Jan 2024 00:00:10 GMT|rate '42.0'",
        ];
        let (a, pings_a, downloads_a, _) = replay_lines(lines);
        let (b, pings_b, downloads_b, _) = replay_lines(lines);

        assert_eq!(a, b);
        assert_eq!(pings_a.len(), pings_b.len());
        assert_eq!(downloads_a.len(), downloads_b.len());
    }
}
