//! Process-based throughput source driving an external `iperf3` client.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use regex::Regex;
use tracing::debug;

use super::{SourceError, SpeedSource, TransferSample};
use crate::journal::parse_timestamp;
use crate::stats::Observation;

/// Runs `iperf3` against a fixed server and reports one receive/send
/// pair per invocation, taken from the end-of-run summary lines.
///
/// Every stdout line is streamed through the progress callback while the
/// subprocess runs, so the whole raw transcript ends up in the journal.
/// The summary lines are the ones that matter for replay:
///
/// ```text
/// [  5]   0.00-10.00  sec  1.11 GBytes   952 Mbits/sec    0   sender
/// [  5]   0.00-10.00  sec  1.10 GBytes   948 Mbits/sec        receiver
/// ```
pub struct IperfSource {
    binary: PathBuf,
    server: String,
    description: String,
    summary_re: Regex,
}

impl IperfSource {
    pub fn new(binary: impl Into<PathBuf>, server: impl Into<String>) -> Self {
        let binary = binary.into();
        let server = server.into();
        let description = format!("iperf3: {server}");
        Self {
            binary,
            server,
            description,
            summary_re: Regex::new(r"([0-9]+(?:\.[0-9]+)?) Mbits/sec.*\b(sender|receiver)\b")
                .expect("static regex"),
        }
    }

    /// Extract `(mbit, role)` pairs from one line of iperf output.
    ///
    /// Interval lines carry no sender/receiver token and match nothing.
    fn summary_matches<'l>(&self, payload: &'l str) -> Vec<(f64, &'l str)> {
        self.summary_re
            .captures_iter(payload)
            .filter_map(|c| {
                let value: f64 = c.get(1)?.as_str().parse().ok()?;
                Some((value, c.get(2).map(|m| m.as_str())?))
            })
            .collect()
    }

    /// Split a replayed journal line into its timestamp and payload.
    fn split_line<'l>(line: &'l str) -> (Option<chrono::DateTime<chrono::Utc>>, &'l str) {
        match line.split_once('|') {
            Some((prefix, payload)) => match parse_timestamp(prefix) {
                Some(at) => (Some(at), payload),
                None => (None, line),
            },
            None => (None, line),
        }
    }
}

impl SpeedSource for IperfSource {
    fn description(&self) -> &str {
        &self.description
    }

    fn measure(
        &mut self,
        emit: &mut dyn FnMut(&str),
    ) -> Result<Vec<TransferSample>, SourceError> {
        let command = format!("{} -4 -c {} -f m -b 1000M -N -R", self.binary.display(), self.server);
        debug!(command = %command, "starting throughput measurement");

        let mut child = Command::new(&self.binary)
            .args(["-4", "-c", &self.server, "-f", "m", "-b", "1000M", "-N", "-R"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Spawn { command, source })?;

        let mut transcript = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                emit(&line);
                transcript.push(line);
            }
        }
        let _ = child.wait();

        let mut receive = None;
        let mut send = None;
        for line in &transcript {
            for (value, role) in self.summary_matches(line) {
                match role {
                    "receiver" => receive = Some(value),
                    "sender" => send = Some(value),
                    _ => {}
                }
            }
        }

        match (receive, send) {
            (Some(receive_mbit), Some(send_mbit)) => Ok(vec![TransferSample {
                receive_mbit,
                send_mbit,
            }]),
            _ => Err(SourceError::NoSummary {
                source_name: self.description.clone(),
            }),
        }
    }

    fn parse_log_line(&self, line: &str) -> Vec<Observation> {
        let (at, payload) = Self::split_line(line);
        let at = at.unwrap_or_else(chrono::Utc::now);

        // Only the receiver summary reproduces the download observation
        // the live run recorded; sender values describe upload.
        self.summary_matches(payload)
            .into_iter()
            .filter(|(_, role)| *role == "receiver")
            .map(|(value, _)| Observation::new(at, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str =
        "[  5]   0.00-10.00  sec  1.11 GBytes   952 Mbits/sec    0             sender";
    const RECEIVER: &str =
        "[  5]   0.00-10.00  sec  1.10 GBytes   948 Mbits/sec                  receiver";
    const INTERVAL: &str = "[  5]   1.00-2.00   sec   112 MBytes   941 Mbits/sec    0";

    fn source() -> IperfSource {
        IperfSource::new("iperf3", "speedtest.example.net")
    }

    #[test]
    fn test_summary_lines_parse_with_roles() {
        let s = source();
        assert_eq!(s.summary_matches(SENDER), vec![(952.0, "sender")]);
        assert_eq!(s.summary_matches(RECEIVER), vec![(948.0, "receiver")]);
        assert!(s.summary_matches(INTERVAL).is_empty());
    }

    #[test]
    fn test_fractional_rates_parse() {
        let s = source();
        let line = "[  5]   0.00-10.00  sec  54.1 MBytes  45.4 Mbits/sec                  receiver";
        assert_eq!(s.summary_matches(line), vec![(45.4, "receiver")]);
    }

    #[test]
    fn test_parse_log_line_yields_receiver_only() {
        let s = source();
        assert!(s.parse_log_line(SENDER).is_empty());

        let parsed = s.parse_log_line(RECEIVER);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].value, 948.0);
    }

    #[test]
    fn test_parse_log_line_honors_journal_timestamp() {
        let s = source();
        let line = format!("Mon, 01 Jan 2024 00:00:00 GMT|{RECEIVER}");
        let parsed = s.parse_log_line(&line);
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].at,
            crate::journal::parse_timestamp("Mon, 01 Jan 2024 00:00:00 GMT").unwrap()
        );
    }

    #[test]
    fn test_unrelated_lines_parse_to_nothing() {
        let s = source();
        assert!(s.parse_log_line("Connecting to host speedtest.example.net, port 5201").is_empty());
        assert!(s
            .parse_log_line("SpeedTest at 'x' to 'y' Download '10' mbit/s")
            .is_empty());
    }
}
