use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkwatch::duration::parse_duration;
use linkwatch::{
    export, Dashboard, HttpSpeedSource, HttpTransferProvider, IperfSource, Journal,
    MetricRegistry, MetricStream, Monitor, MonitorConfig, NullDashboard, Peer, ProbeTarget,
    Prober, Signals, SpeedSource, StatsStore, SystemPing,
};

#[derive(Parser, Debug)]
#[command(name = "linkwatch")]
#[command(about = "Long-running network health monitor with adaptive polling")]
struct Args {
    /// Path of the observation journal (created if missing)
    log: PathBuf,

    /// iperf3 server to measure against (enables the iperf source)
    #[arg(long)]
    iperf_server: Option<String>,

    /// Path of the iperf3 binary
    #[arg(long, default_value = "iperf3")]
    iperf_bin: PathBuf,

    /// Transfer peer as HOST=DOWNLOAD_URL[;UPLOAD_URL] (repeatable)
    #[arg(long = "peer", value_name = "HOST=URL")]
    peers: Vec<String>,

    /// Probe destination (repeatable)
    #[arg(
        long = "destination",
        default_values_t = vec![
            "google.de".to_string(),
            "dns.google".to_string(),
            "cloudflare.com".to_string(),
        ]
    )]
    destinations: Vec<String>,

    /// Wait between measurements on a healthy network (e.g. "1m")
    #[arg(long, default_value = "1m")]
    normal_interval: String,

    /// Wait between measurements on a degraded network (e.g. "10s")
    #[arg(long, default_value = "10s")]
    degraded_interval: String,

    /// Probe repetitions per destination in the ping phase
    #[arg(long, default_value = "5")]
    repetitions: u32,

    /// Replay the journal, write a JSON state summary, and exit
    #[arg(long)]
    export: Option<PathBuf>,
}

/// Dashboard that coalesces render notifications into a dirty flag the
/// main thread drains.
#[derive(Debug, Default)]
struct ConsoleDashboard {
    dirty: AtomicBool,
}

impl Dashboard for ConsoleDashboard {
    fn render_now(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

fn parse_peer(spec: &str) -> Result<Peer> {
    let (host, urls) = spec
        .split_once('=')
        .with_context(|| format!("peer '{spec}' is not HOST=URL"))?;
    let (download_url, upload_url) = match urls.split_once(';') {
        Some((down, up)) => (down.to_string(), up.to_string()),
        None => (urls.to_string(), urls.to_string()),
    };
    Ok(Peer {
        host: host.to_string(),
        download_url,
        upload_url,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Parse interval arguments, falling back to the defaults
    let normal_interval =
        parse_duration(&args.normal_interval).unwrap_or(Duration::from_secs(60));
    let degraded_interval =
        parse_duration(&args.degraded_interval).unwrap_or(Duration::from_secs(10));

    let journal = Arc::new(
        Journal::open(&args.log)
            .with_context(|| format!("cannot open journal at {}", args.log.display()))?,
    );

    // Measurement sources: iperf first when configured, then the HTTP
    // peer source
    let mut sources: Vec<Box<dyn SpeedSource>> = Vec::new();
    if let Some(server) = &args.iperf_server {
        sources.push(Box::new(IperfSource::new(&args.iperf_bin, server.as_str())));
    }
    let peers = args
        .peers
        .iter()
        .map(|s| parse_peer(s))
        .collect::<Result<Vec<Peer>>>()?;
    if !peers.is_empty() {
        let provider = HttpTransferProvider::new(peers)?;
        sources.push(Box::new(HttpSpeedSource::new(Box::new(provider))));
    }
    if sources.is_empty() {
        anyhow::bail!("no measurement source configured; pass --iperf-server or --peer");
    }

    let dashboard = Arc::new(ConsoleDashboard::default());
    let export_only = args.export.is_some();
    let metrics = if export_only {
        Arc::new(MetricRegistry::new(&args.destinations, Arc::new(NullDashboard)))
    } else {
        Arc::new(MetricRegistry::new(&args.destinations, dashboard.clone()))
    };

    let store = StatsStore::new();
    let downloads = store.stream(linkwatch::stats::DOWNLOAD);
    let uploads = store.stream(linkwatch::stats::UPLOAD);
    let pings = store.stream(linkwatch::stats::PING);

    let targets: Vec<Arc<ProbeTarget>> = args
        .destinations
        .iter()
        .map(|d| {
            Arc::new(ProbeTarget::new(
                d.clone(),
                store.stream(&StatsStore::ping_stream_name(d)),
            ))
        })
        .collect();

    let prober = Prober::new(
        targets.clone(),
        Arc::new(SystemPing::new()),
        pings.clone(),
        Arc::clone(&journal),
        Arc::clone(&metrics),
    );

    let config = MonitorConfig {
        normal_interval,
        degraded_interval,
        probe_repetitions: args.repetitions,
    };

    let mut monitor = Monitor::new(
        config,
        sources,
        prober,
        Arc::clone(&journal),
        Arc::clone(&metrics),
        downloads.clone(),
        uploads.clone(),
        pings.clone(),
    );

    // Rebuild statistics from the journal before the loop starts
    let summary = monitor.replay()?;
    info!(
        lines = summary.lines,
        downloads = summary.download_observations,
        "startup replay finished"
    );

    if let Some(path) = &args.export {
        export::export_state_json(&metrics, &downloads, &pings, &targets, path)?;
        println!("Exported monitor state to: {}", path.display());
        return Ok(());
    }

    let signals = monitor.signals().clone();
    let scheduler = std::thread::spawn(move || monitor.run());

    let result = run_console(&signals, &metrics, &downloads, &dashboard);

    signals.request_stop();
    let _ = scheduler.join();
    result
}

/// Single-key command loop over the engine's primitives.
fn run_console(
    signals: &Signals,
    metrics: &MetricRegistry,
    downloads: &MetricStream,
    dashboard: &ConsoleDashboard,
) -> Result<()> {
    enable_raw_mode()?;

    // Restore the terminal even if the command loop panics
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let _ = disable_raw_mode();
        original_hook(panic);
    }));

    print_raw("linkwatch running. Keys: [h]elp [d] measure now [r]efresh [e]xport csv [x] stop\r\n");

    let mut last_render = Instant::now() - Duration::from_secs(1);
    let result = loop {
        if let Err(e) = poll_command(signals, metrics, downloads, &mut last_render, dashboard) {
            break Err(e);
        }
        if signals.stop_requested() {
            break Ok(());
        }
    };

    disable_raw_mode()?;
    result
}

fn poll_command(
    signals: &Signals,
    metrics: &MetricRegistry,
    downloads: &MetricStream,
    last_render: &mut Instant,
    dashboard: &ConsoleDashboard,
) -> Result<()> {
    if event::poll(Duration::from_millis(100))? {
        if let Event::Key(key) = event::read()? {
            handle_key(signals, downloads, dashboard, key);
        }
    }

    // Redraw at most once a second, only when something changed
    if dashboard.dirty.swap(false, Ordering::Relaxed) {
        if last_render.elapsed() >= Duration::from_secs(1) {
            render_metrics(metrics);
            *last_render = Instant::now();
        } else {
            // Too soon; keep the change pending for the next poll
            dashboard.dirty.store(true, Ordering::Relaxed);
        }
    }
    Ok(())
}

fn handle_key(
    signals: &Signals,
    downloads: &MetricStream,
    dashboard: &ConsoleDashboard,
    key: KeyEvent,
) {
    if key.kind != KeyEventKind::Press {
        return;
    }
    match key.code {
        KeyCode::Char('x') | KeyCode::Char('q') => {
            print_raw("stopping, flushing journal...\r\n");
            signals.request_stop();
        }
        KeyCode::Char('d') => {
            print_raw("measuring now\r\n");
            signals.force_measure();
        }
        KeyCode::Char('r') => {
            dashboard.render_now();
        }
        KeyCode::Char('e') => {
            let path = PathBuf::from("linkwatch_export.csv");
            match export::export_csv(downloads, &path) {
                Ok(()) => print_raw(&format!("Exported to {}\r\n", path.display())),
                Err(e) => print_raw(&format!("Export failed: {e}\r\n")),
            }
        }
        KeyCode::Char('h') => {
            print_raw("h: this help\r\n");
            print_raw("d: run the measurement phase at the next tick\r\n");
            print_raw("r: refresh the metric overview\r\n");
            print_raw("e: export download statistics to CSV\r\n");
            print_raw("x: flush all cached data and stop\r\n");
        }
        _ => {}
    }
}

fn render_metrics(metrics: &MetricRegistry) {
    let mut out = String::new();
    out.push_str("\r\n");
    for metric in metrics.snapshot() {
        let value = metric.value.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "{:<24} {:>16} {:>2}\r\n",
            metric.name,
            value,
            metric.tendency.symbol()
        ));
    }
    print_raw(&out);
}

fn print_raw(s: &str) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(s.as_bytes());
    let _ = stdout.flush();
}
