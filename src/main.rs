use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use netrecon::events::ScanEvent;
use netrecon::netdetect::{self, NetworkInterface};
use netrecon::ports::{load_ports_from_path, parse_port_spec};
use netrecon::types::HostInfo;
use netrecon::{logging, ScanConfiguration, ScanEngine, ScanResult, ScanType};

/// netrecon: async TCP port scanner with banner based service detection.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "netrecon",
    version,
    about = "Async TCP port scanner with banner based service detection.",
    long_about = None
)]
struct Cli {
    /// Host name or IP address to scan. With --discover, may also be a CIDR
    /// block or an a.b.c.d-e.f.g.h range.
    #[arg(long, short)]
    target: Option<String>,

    /// Ports to scan, e.g. "22,80,8000-8010". Defaults to 1-1000.
    #[arg(long, short, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// Path to ports list file (one port or range per line, '#' comments).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Connect timeout per probe in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Max concurrent TCP connect attempts.
    #[arg(long)]
    workers: Option<usize>,

    /// Grab banners from open ports and identify services.
    #[arg(long = "service-detection", default_value_t = false)]
    service_detection: bool,

    /// Resolve the target name before scanning.
    #[arg(long, default_value_t = false)]
    dns: bool,

    /// Sweep the target range for live hosts instead of port scanning. Without
    /// --target the local IPv4 networks are swept.
    #[arg(long, default_value_t = false)]
    discover: bool,

    /// Load the scan configuration from a JSON file; other flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Default log level (trace, debug, info, warn, error). RUST_LOG wins when set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level)?;
    let config = build_config(&cli)?;

    if config.host_discovery {
        let hosts = run_discovery(&config).await?;
        print_hosts_table(&hosts);
        if let Some(path) = cli.output.as_deref() {
            write_json(path, &hosts)?;
            println!("Wrote JSON results to {}", path.display());
        }
        return Ok(());
    }

    let engine = ScanEngine::new();
    let mut events = engine.subscribe();
    engine.start_scan(config).await.context("scan was not started")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted, cancelling scan");
                engine.cancel_scan().await;
                break;
            }
            event = events.recv() => match event {
                Some(ScanEvent::Progress { percent, message }) => info!(percent, "{message}"),
                Some(ScanEvent::PortDiscovered(port)) => info!(port = port.port, "open port"),
                Some(ScanEvent::ServiceDetected(service)) => info!(
                    port = service.port,
                    service = %service.name,
                    version = %service.version,
                    "service detected"
                ),
                Some(ScanEvent::Started(_)) => {}
                Some(ScanEvent::Failed(reason)) => {
                    warn!("{reason}");
                    break;
                }
                Some(ScanEvent::Completed(_)) | None => break,
            },
        }
    }

    let mut result = engine.wait().await;
    result.sort_by_port();
    print_results_table(&result);
    if let Some(path) = cli.output.as_deref() {
        write_json(path, &result)?;
        println!("Wrote JSON results to {}", path.display());
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ScanConfiguration> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ScanConfiguration::from_json_file(path)?,
        None => ScanConfiguration::default(),
    };
    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    if let Some(spec) = &cli.ports {
        config.ports = parse_port_spec(spec)?;
    }
    if let Some(path) = cli.ports_file.as_deref() {
        config.ports = load_ports_from_path(path)?;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout_ms = ms;
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if cli.service_detection {
        config.service_detection = true;
        config.scan_type = ScanType::ServiceDetection;
    }
    config.dns_resolution |= cli.dns;
    config.host_discovery |= cli.discover;
    Ok(config)
}

async fn run_discovery(config: &ScanConfiguration) -> Result<Vec<HostInfo>> {
    let mut targets: Vec<String> = config
        .targets
        .iter()
        .filter(|t| !t.trim().is_empty())
        .cloned()
        .collect();
    if !config.target.trim().is_empty() {
        targets.insert(0, config.target.clone());
    }
    if targets.is_empty() {
        let cidrs = netdetect::detect_local_cidrs().context("failed to detect local networks")?;
        for cidr in &cidrs {
            println!("Detected local network {cidr}");
        }
        targets = cidrs.iter().map(|c| c.to_string()).collect();
    }

    let net = NetworkInterface::new();
    Ok(net.discover_hosts(&targets, config.timeout()).await)
}

fn print_results_table(result: &ScanResult) {
    let open: Vec<_> = result.open_ports().collect();
    let port_w = 5usize;
    let mut service_w = "service".len();
    for p in &open {
        service_w = service_w.max(p.service.len());
    }

    println!(
        "\n{} [{}] open ports: {} (scanned: {})",
        result.target_host,
        result.status,
        open.len(),
        result.ports.len()
    );
    if open.is_empty() {
        return;
    }
    println!("{:>port_w$}  {:<service_w$}  version", "port", "service");
    println!("{:-<port_w$}  {:-<service_w$}  {:-<7}", "", "", "");
    for p in open {
        let mut version = p.version.clone();
        if version.len() > 60 {
            let cut = (0..=60).rev().find(|&i| version.is_char_boundary(i)).unwrap_or(0);
            version.truncate(cut);
        }
        println!("{:>port_w$}  {:<service_w$}  {}", p.port, p.service, version);
    }
}

fn print_hosts_table(hosts: &[HostInfo]) {
    let alive: Vec<_> = hosts.iter().filter(|h| h.is_alive).collect();
    println!("\nLive hosts: {} (probed: {})", alive.len(), hosts.len());
    for h in alive {
        println!("{:<15}  {:>6} ms", h.ip_address, h.response_time_ms);
    }
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
