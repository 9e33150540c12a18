//! Peer-list throughput source backed by an HTTP transfer provider.

use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, warn};

use super::{SourceError, SpeedSource, TransferSample};
use crate::journal::{format_timestamp, parse_timestamp};
use crate::stats::Observation;

/// How many peers the source keeps in its working set.
const WORKING_SET_SIZE: usize = 4;

/// Per-request timeout for the shipped HTTP provider.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload test body size: 1 MiB of zeros.
const UPLOAD_BYTES: usize = 1024 * 1024;

/// One remote endpoint a transfer can be measured against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Display/identity name, also matched during journal replay.
    pub host: String,
    /// URL fetched for the download test.
    pub download_url: String,
    /// URL posted to for the upload test.
    pub upload_url: String,
}

/// The third-party transfer capability this source is built on.
///
/// Rates are decimal megabits per second; a rate of NaN means the peer
/// did not respond usably. The source never lets NaN escape into the
/// statistics.
pub trait TransferProvider: Send {
    /// The candidate peer list to draw working peers from.
    fn candidates(&self) -> Result<Vec<Peer>, SourceError>;

    /// Measure download throughput from one peer, NaN on failure.
    fn test_download(&self, peer: &Peer) -> f64;

    /// Measure upload throughput to one peer, NaN on failure.
    fn test_upload(&self, peer: &Peer) -> f64;
}

/// Blocking-HTTP implementation of [`TransferProvider`].
pub struct HttpTransferProvider {
    client: reqwest::blocking::Client,
    peers: Vec<Peer>,
}

impl HttpTransferProvider {
    /// Build a provider over a fixed candidate list.
    pub fn new(peers: Vec<Peer>) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Provider(e.to_string()))?;
        Ok(Self { client, peers })
    }

    fn rate_mbit(bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return f64::NAN;
        }
        bytes as f64 * 8.0 / 1_000_000.0 / secs
    }
}

impl TransferProvider for HttpTransferProvider {
    fn candidates(&self) -> Result<Vec<Peer>, SourceError> {
        if self.peers.is_empty() {
            return Err(SourceError::Provider("no peers configured".to_string()));
        }
        Ok(self.peers.clone())
    }

    fn test_download(&self, peer: &Peer) -> f64 {
        let started = Instant::now();
        let bytes = self
            .client
            .get(&peer.download_url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|mut resp| resp.copy_to(&mut std::io::sink()));
        match bytes {
            Ok(bytes) => Self::rate_mbit(bytes, started.elapsed()),
            Err(e) => {
                debug!(peer = %peer.host, error = %e, "download test failed");
                f64::NAN
            }
        }
    }

    fn test_upload(&self, peer: &Peer) -> f64 {
        let body = vec![0u8; UPLOAD_BYTES];
        let started = Instant::now();
        let result = self
            .client
            .post(&peer.upload_url)
            .body(body)
            .send()
            .and_then(|resp| resp.error_for_status());
        match result {
            Ok(_) => Self::rate_mbit(UPLOAD_BYTES as u64, started.elapsed()),
            Err(e) => {
                debug!(peer = %peer.host, error = %e, "upload test failed");
                f64::NAN
            }
        }
    }
}

/// Tests a working set of peers per cycle and reports one pair per
/// responsive peer.
///
/// Unresponsive peers are excluded from the cycle, announced through the
/// progress callback, and swapped out of the working set before the next
/// cycle. The emitted progress lines double as the replay format:
///
/// ```text
/// SpeedTest at 'Mon, 01 Jan 2024 00:00:00 GMT' to 'peer-a.example' Download '87.5' mbit/s
/// SpeedTest at 'Mon, 01 Jan 2024 00:00:01 GMT' to 'peer-a.example' Upload '12.25' mbit/s
/// ```
pub struct HttpSpeedSource {
    provider: Box<dyn TransferProvider>,
    working: Vec<Peer>,
    stale: Vec<String>,
    rotation: usize,
    description: String,
    download_re: Regex,
}

impl HttpSpeedSource {
    pub fn new(provider: Box<dyn TransferProvider>) -> Self {
        Self {
            provider,
            working: Vec::new(),
            stale: Vec::new(),
            rotation: 0,
            description: "speedtest: http transfer peers".to_string(),
            download_re: Regex::new(r"SpeedTest at '([^']*)' to '[^']*' Download '([^']*)'")
                .expect("static regex"),
        }
    }

    /// Fill the working set and swap out peers marked unresponsive.
    fn refresh_working_set(&mut self) -> Result<(), SourceError> {
        let candidates = self.provider.candidates()?;
        let excluded = std::mem::take(&mut self.stale);
        self.working.retain(|p| !excluded.contains(&p.host));

        if candidates.is_empty() {
            return Ok(());
        }

        let target = WORKING_SET_SIZE.min(candidates.len());
        let mut attempts = 0;
        while self.working.len() < target && attempts < 2 * candidates.len() {
            let candidate = &candidates[self.rotation % candidates.len()];
            self.rotation += 1;
            attempts += 1;
            if self.working.iter().any(|p| p.host == candidate.host) {
                continue;
            }
            // The first pass over the candidates avoids peers that just
            // failed; they become eligible again only when nothing else
            // is left to fill the set with.
            if attempts <= candidates.len() && excluded.contains(&candidate.host) {
                continue;
            }
            self.working.push(candidate.clone());
        }
        Ok(())
    }
}

impl SpeedSource for HttpSpeedSource {
    fn description(&self) -> &str {
        &self.description
    }

    fn measure(
        &mut self,
        emit: &mut dyn FnMut(&str),
    ) -> Result<Vec<TransferSample>, SourceError> {
        self.refresh_working_set()?;

        let mut samples = Vec::new();
        let peers = self.working.clone();
        for peer in &peers {
            let receive_mbit = self.provider.test_download(peer);
            if !receive_mbit.is_finite() {
                warn!(peer = %peer.host, "peer unresponsive, scheduling replacement");
                emit(&format!(
                    "peer '{}' seems unresponsive and will be replaced next cycle",
                    peer.host
                ));
                self.stale.push(peer.host.clone());
                continue;
            }

            let send_mbit = self.provider.test_upload(peer);
            if !send_mbit.is_finite() {
                warn!(peer = %peer.host, "peer upload unresponsive, scheduling replacement");
                emit(&format!(
                    "peer '{}' seems unresponsive and will be replaced next cycle",
                    peer.host
                ));
                self.stale.push(peer.host.clone());
                continue;
            }

            // Plain `{}` prints the shortest representation that parses
            // back to the identical f64, which keeps replay lossless.
            emit(&format!(
                "SpeedTest at '{}' to '{}' Download '{}' mbit/s",
                format_timestamp(Utc::now()),
                peer.host,
                receive_mbit
            ));
            emit(&format!(
                "SpeedTest at '{}' to '{}' Upload '{}' mbit/s",
                format_timestamp(Utc::now()),
                peer.host,
                send_mbit
            ));

            samples.push(TransferSample {
                receive_mbit,
                send_mbit,
            });
        }

        Ok(samples)
    }

    fn parse_log_line(&self, line: &str) -> Vec<Observation> {
        // The measurement timestamp is embedded in the payload itself;
        // the journal's own line prefix is ignored here.
        let Some(captures) = self.download_re.captures(line) else {
            return Vec::new();
        };
        let Some(at) = parse_timestamp(&captures[1]) else {
            return Vec::new();
        };
        let Ok(value) = captures[2].parse::<f64>() else {
            return Vec::new();
        };
        vec![Observation::new(at, value)]
    }
}
