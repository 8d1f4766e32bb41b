//! Scan orchestration.
//!
//! A [`ScanEngine`] runs one workflow at a time:
//!
//! ```text
//! Idle -> [ResolvingDns] -> ScanningPorts -> [DetectingServices] -> Idle
//! ```
//!
//! The bracketed phases are optional. `cancel_scan` drops the engine back to
//! `Idle` from any active phase. Progress is reported on a 0-100 scale: DNS at
//! 5, the port scan drives 10-80, service detection 80-100.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanConfiguration;
use crate::dns::DnsResolver;
use crate::error::{Result, ScanError};
use crate::events::{Notifier, ScanEvent, ScannerEvent};
use crate::scanner::PortScanner;
use crate::service::ServiceDetector;
use crate::types::{PortResult, ScanResult, ScanStatus};

const PORT_BAND_START: u8 = 10;
const PORT_BAND_END: u8 = 80;
const CANCELLED_REASON: &str = "Scan cancelled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePhase {
    #[default]
    Idle,
    ResolvingDns,
    ScanningPorts,
    DetectingServices,
}

impl EnginePhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, EnginePhase::Idle)
    }
}

#[derive(Debug, Default)]
struct EngineState {
    /// Bumped on every accepted start; a workflow only owns the state while
    /// this still matches its own number.
    run: u64,
    phase: EnginePhase,
    config: Option<ScanConfiguration>,
    result: ScanResult,
    cancel: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
}

pub struct ScanEngine {
    inner: Arc<RwLock<EngineState>>,
    events: Arc<Notifier<ScanEvent>>,
    resolver: DnsResolver,
    detector: ServiceDetector,
    shutdown: CancellationToken,
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanEngine {
    pub fn new() -> Self {
        Self::with_components(DnsResolver::new(), ServiceDetector::new())
    }

    pub fn with_components(resolver: DnsResolver, detector: ServiceDetector) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EngineState::default())),
            events: Arc::new(Notifier::new()),
            resolver,
            detector,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ScanEvent> {
        self.events.subscribe()
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.read().await.phase.is_active()
    }

    pub async fn phase(&self) -> EnginePhase {
        self.inner.read().await.phase
    }

    /// Snapshot of the in-progress or most recent result.
    pub async fn current_result(&self) -> ScanResult {
        self.inner.read().await.result.clone()
    }

    pub async fn configuration(&self) -> Option<ScanConfiguration> {
        self.inner.read().await.config.clone()
    }

    /// Validate `config` and launch the workflow in the background.
    ///
    /// Rejections (already scanning, invalid configuration) are returned and
    /// also emitted as [`ScanEvent::Failed`]; they leave any running scan
    /// untouched.
    pub async fn start_scan(&self, config: ScanConfiguration) -> Result<()> {
        let mut s = self.inner.write().await;
        if s.phase.is_active() {
            self.events.emit(ScanEvent::Failed(ScanError::AlreadyScanning.to_string()));
            return Err(ScanError::AlreadyScanning);
        }
        if let Err(e) = config.validate() {
            let err = ScanError::from(e);
            warn!("rejected scan: {err}");
            self.events.emit(ScanEvent::Failed(err.to_string()));
            return Err(err);
        }

        let target = config.primary_target().to_string();
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        s.run = s.run.wrapping_add(1);
        s.result = ScanResult::new(target.clone());
        s.config = Some(config.clone());
        s.cancel = Some(cancel.clone());
        s.done = Some(done_rx);
        s.phase = if config.dns_resolution && !config.target.trim().is_empty() {
            EnginePhase::ResolvingDns
        } else {
            EnginePhase::ScanningPorts
        };

        info!(host = %target, ports = config.port_count(), "scan started");
        self.events.emit(ScanEvent::Started(target));
        self.events.emit(ScanEvent::Progress {
            percent: 0,
            message: "Starting scan...".to_string(),
        });

        let workflow = Workflow {
            inner: self.inner.clone(),
            events: self.events.clone(),
            resolver: self.resolver.clone(),
            detector: self.detector.clone(),
            run: s.run,
            cancel,
            config,
            last_percent: 0,
        };
        tokio::spawn(async move {
            workflow.run().await;
            let _ = done_tx.send(true);
        });
        Ok(())
    }

    /// Stop the active scan, wait for its in-flight probes to drain, and mark
    /// the result cancelled. Returns false when nothing was running.
    pub async fn cancel_scan(&self) -> bool {
        let done = {
            let mut s = self.inner.write().await;
            if !s.phase.is_active() {
                return false;
            }
            if let Some(cancel) = s.cancel.take() {
                cancel.cancel();
            }
            s.result.finish(ScanStatus::Cancelled);
            s.phase = EnginePhase::Idle;
            s.done.clone()
        };

        if let Some(done) = done {
            wait_done(done).await;
        }
        info!("scan cancelled");
        self.events.emit(ScanEvent::Failed(CANCELLED_REASON.to_string()));
        true
    }

    /// Wait for the current workflow (if any) to end and return its result.
    pub async fn wait(&self) -> ScanResult {
        let done = self.inner.read().await.done.clone();
        if let Some(done) = done {
            wait_done(done).await;
        }
        self.current_result().await
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // A closed channel means the workflow task is gone either way.
    let _ = done.wait_for(|finished| *finished).await;
}

/// First IPv4 address if there is one, else the first address.
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
}

fn port_band(scanned: usize, total: usize) -> u8 {
    if total == 0 {
        return PORT_BAND_END;
    }
    let span = u64::from(PORT_BAND_END - PORT_BAND_START);
    let done = (scanned.min(total) as u64 * span) / total as u64;
    PORT_BAND_START + done as u8
}

/// One run of the scan pipeline. Every write to the shared state first checks
/// the run's own cancellation token, so a cancelled run can never touch the
/// state of the scan that replaced it.
struct Workflow {
    inner: Arc<RwLock<EngineState>>,
    events: Arc<Notifier<ScanEvent>>,
    resolver: DnsResolver,
    detector: ServiceDetector,
    run: u64,
    cancel: CancellationToken,
    config: ScanConfiguration,
    last_percent: u8,
}

impl Workflow {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut target = self.config.primary_target().to_string();

        if self.config.dns_resolution && !self.config.target.trim().is_empty() {
            self.progress(5, "Resolving DNS...");
            let addresses = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                addresses = self.resolver.resolve_host(&target, self.resolver.timeout()) => {
                    addresses
                }
            };
            match preferred_address(&addresses) {
                Some(address) => {
                    info!(host = %target, %address, "target resolved");
                    target = address.to_string();
                }
                None => warn!(host = %target, "DNS resolution failed, scanning target as given"),
            }
            if !self.enter(EnginePhase::ScanningPorts).await {
                return;
            }
        }

        let Some(ports) = self.scan_ports(&target).await else {
            return;
        };
        let open = ports.iter().filter(|p| p.is_open()).count();
        if !self.merge_ports(ports).await {
            return;
        }
        self.progress(PORT_BAND_END, &format!("Port scan completed. Found {open} open ports"));

        if self.config.service_detection && !self.detect_services(&target).await {
            return;
        }
        self.finalize().await;
    }

    /// Drive a port scanner to completion, relaying its events. `None` when the
    /// run was cancelled or the scanner refused to start. A cancelled run still
    /// leaves whatever the scanner recorded on the cancelled result.
    async fn scan_ports(&mut self, target: &str) -> Option<Vec<PortResult>> {
        let cancel = self.cancel.clone();
        let mut scanner = PortScanner::new();
        scanner.set_target(target);
        scanner.set_ports(self.config.ports_to_scan());
        scanner.set_timeout(self.config.timeout());
        scanner.set_worker_count(self.config.max_workers);
        let mut rx = scanner.subscribe();

        self.progress(PORT_BAND_START, "Starting port scan...");
        if let Err(e) = scanner.start_scan().await {
            self.fail(e.to_string()).await;
            return None;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    scanner.stop_scan().await;
                    self.keep_partial(scanner.results().await).await;
                    return None;
                }
                event = rx.recv() => match event {
                    Some(ScannerEvent::PortFound(port)) => self.record_open_port(port).await,
                    Some(ScannerEvent::Progress { scanned, total }) => {
                        let message = format!("Scanning port {scanned} of {total}...");
                        self.progress(port_band(scanned, total), &message);
                    }
                    Some(ScannerEvent::Error(reason)) => warn!("port scanner: {reason}"),
                    Some(ScannerEvent::Completed { .. }) | None => break,
                },
            }
        }

        scanner.wait().await;
        Some(scanner.results().await)
    }

    async fn record_open_port(&mut self, port: PortResult) {
        {
            let mut s = self.inner.write().await;
            if self.cancel.is_cancelled() {
                return;
            }
            s.result.ports.push(port.clone());
        }
        self.emit(ScanEvent::PortDiscovered(port));
    }

    /// `cancel_scan` has already frozen the result; only fill in its ports,
    /// and only if no newer scan has started since.
    async fn keep_partial(&self, ports: Vec<PortResult>) {
        let mut s = self.inner.write().await;
        if s.run != self.run {
            return;
        }
        debug!(ports = ports.len(), "keeping partial results of cancelled scan");
        s.result.ports = ports;
    }

    async fn merge_ports(&mut self, ports: Vec<PortResult>) -> bool {
        let mut s = self.inner.write().await;
        if self.cancel.is_cancelled() {
            return false;
        }
        s.result.ports = ports;
        if self.config.service_detection {
            s.phase = EnginePhase::DetectingServices;
        }
        true
    }

    /// Fingerprint every open port in turn. Returns false if cancelled.
    async fn detect_services(&mut self, target: &str) -> bool {
        let cancel = self.cancel.clone();
        let open: Vec<u16> = {
            let s = self.inner.read().await;
            s.result.open_ports().map(|p| p.port).collect()
        };
        let total = open.len();
        let span = usize::from(100 - PORT_BAND_END);

        for (idx, port) in open.into_iter().enumerate() {
            let percent = PORT_BAND_END + (idx * span / total) as u8;
            self.progress(percent, &format!("Detecting service on port {port}..."));

            let info = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                info = self.detector.detect_service(target, port, self.config.timeout()) => info,
            };

            {
                let mut s = self.inner.write().await;
                if self.cancel.is_cancelled() {
                    return false;
                }
                if let Some(entry) = s.result.ports.iter_mut().find(|p| p.port == info.port) {
                    entry.service = info.name.clone();
                    entry.version = info.version.clone();
                }
            }
            if !info.name.is_empty() {
                self.emit(ScanEvent::ServiceDetected(info));
            }
        }
        true
    }

    async fn finalize(&mut self) {
        let mut s = self.inner.write().await;
        if self.cancel.is_cancelled() {
            return;
        }
        s.result.finish(ScanStatus::Completed);
        s.phase = EnginePhase::Idle;
        s.cancel = None;
        info!(
            target_host = %s.result.target_host,
            ports = s.result.ports.len(),
            open = s.result.open_ports().count(),
            "scan completed"
        );
        self.events.emit(ScanEvent::Progress {
            percent: 100,
            message: "Scan completed".to_string(),
        });
        self.events.emit(ScanEvent::Completed(s.result.clone()));
    }

    async fn fail(&mut self, reason: String) {
        let mut s = self.inner.write().await;
        if self.cancel.is_cancelled() {
            return;
        }
        warn!("scan failed: {reason}");
        s.result.finish(ScanStatus::Failed);
        s.phase = EnginePhase::Idle;
        s.cancel = None;
        self.events.emit(ScanEvent::Failed(reason));
    }

    async fn enter(&mut self, phase: EnginePhase) -> bool {
        let mut s = self.inner.write().await;
        if self.cancel.is_cancelled() {
            return false;
        }
        s.phase = phase;
        true
    }

    fn emit(&self, event: ScanEvent) {
        if !self.cancel.is_cancelled() {
            self.events.emit(event);
        }
    }

    /// Emit progress unless it would move backwards; worker completions can
    /// report counts slightly out of order.
    fn progress(&mut self, percent: u8, message: &str) {
        if percent < self.last_percent || self.cancel.is_cancelled() {
            return;
        }
        self.last_percent = percent;
        debug!(percent, message, "scan progress");
        self.events.emit(ScanEvent::Progress {
            percent,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_band_maps_into_ten_to_eighty() {
        assert_eq!(port_band(0, 100), 10);
        assert_eq!(port_band(50, 100), 45);
        assert_eq!(port_band(100, 100), 80);
        assert_eq!(port_band(7, 3), 80);
        assert_eq!(port_band(0, 0), 80);
    }

    #[test]
    fn prefers_ipv4_answers() {
        let v6: IpAddr = "::1".parse().unwrap();
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(preferred_address(&[v6, v4]), Some(v4));
        assert_eq!(preferred_address(&[v6]), Some(v6));
        assert_eq!(preferred_address(&[]), None);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_synchronously() {
        let engine = ScanEngine::new();
        let mut rx = engine.subscribe();
        let err = engine
            .start_scan(ScanConfiguration::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfiguration(_)));
        assert!(!engine.is_scanning().await);
        assert!(matches!(rx.try_recv(), Ok(ScanEvent::Failed(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let engine = ScanEngine::new();
        let mut rx = engine.subscribe();
        assert!(!engine.cancel_scan().await);
        assert!(rx.try_recv().is_err());
    }
}
