use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result, ScanError};
use crate::events::{Notifier, ScannerEvent};
use crate::types::PortResult;
use crate::worker::ScanWorker;

/// Upper guard on simultaneous sockets, whatever the configured budget.
pub const MAX_WORKERS: usize = 5_000;

/// Counters and result buffer shared between the scanner and its workers.
#[derive(Debug, Default)]
struct SharedProgress {
    running: AtomicBool,
    scanned: AtomicUsize,
    total: AtomicUsize,
    results: Mutex<Vec<PortResult>>,
}

impl SharedProgress {
    async fn record(&self, result: PortResult, events: &Notifier<ScannerEvent>) {
        let open = result.is_open();
        self.results.lock().await.push(result.clone());
        if open {
            events.emit(ScannerEvent::PortFound(result));
        }

        let scanned = self.scanned.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total.load(Ordering::Acquire);
        events.emit(ScannerEvent::Progress { scanned, total });
    }
}

/// Everything one run needs, snapshotted at `start_scan`.
#[derive(Debug, Clone)]
struct ScanJob {
    target: String,
    ports: Vec<u16>,
    timeout: Duration,
    workers: usize,
}

/// Concurrent TCP connect scanner for one target.
///
/// `start_scan` returns as soon as the dispatcher task is running; progress
/// and completion are reported through [`ScannerEvent`]s. Results arrive in
/// completion order, not port order.
#[derive(Debug)]
pub struct PortScanner {
    target: String,
    ports: Vec<u16>,
    timeout: Duration,
    workers: usize,
    shared: Arc<SharedProgress>,
    events: Arc<Notifier<ScannerEvent>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PortScanner {
    pub fn new() -> Self {
        Self {
            target: String::new(),
            ports: Vec::new(),
            timeout: Duration::from_millis(2000),
            workers: 100,
            shared: Arc::new(SharedProgress::default()),
            events: Arc::new(Notifier::new()),
            cancel: CancellationToken::new(),
            driver: None,
        }
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn set_port_range(&mut self, start: u16, end: u16) {
        self.ports = (start..=end).collect();
    }

    pub fn set_ports(&mut self, ports: Vec<u16>) {
        self.ports = ports;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_worker_count(&mut self, workers: usize) {
        self.workers = workers;
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ScannerEvent> {
        self.events.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn scanned_count(&self) -> usize {
        self.shared.scanned.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    pub async fn results(&self) -> Vec<PortResult> {
        self.shared.results.lock().await.clone()
    }

    pub async fn open_ports(&self) -> Vec<PortResult> {
        let guard = self.shared.results.lock().await;
        guard.iter().filter(|r| r.is_open()).cloned().collect()
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        Ok(())
    }

    /// Validate the configuration and dispatch one worker per port.
    ///
    /// Rejected without any state change if a scan is already running or the
    /// configuration is incomplete; the rejection is also emitted as
    /// [`ScannerEvent::Error`].
    pub async fn start_scan(&mut self) -> Result<()> {
        if self.is_scanning() {
            self.events.emit(ScannerEvent::Error(ScanError::AlreadyScanning.to_string()));
            return Err(ScanError::AlreadyScanning);
        }
        if let Err(e) = self.validate() {
            self.events.emit(ScannerEvent::Error(e.to_string()));
            return Err(e.into());
        }

        // A finished driver may still be parked here; it has nothing left to do.
        self.driver.take();
        self.shared.results.lock().await.clear();
        self.shared.scanned.store(0, Ordering::Release);
        self.shared.total.store(self.ports.len(), Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.cancel = CancellationToken::new();

        let job = ScanJob {
            target: self.target.clone(),
            ports: self.ports.clone(),
            timeout: self.timeout,
            workers: self.workers.min(MAX_WORKERS),
        };
        info!(
            host = %job.target,
            ports = job.ports.len(),
            workers = job.workers,
            timeout_ms = job.timeout.as_millis() as u64,
            "port scan started"
        );

        self.driver = Some(tokio::spawn(drive(
            job,
            self.shared.clone(),
            self.events.clone(),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Request cancellation and wait until every dispatched worker has drained.
    pub async fn stop_scan(&mut self) {
        if !self.is_scanning() {
            return;
        }
        self.cancel.cancel();
        self.join_driver().await;
    }

    /// Wait for the running scan to finish on its own. Returns whether it was
    /// cancelled.
    pub async fn wait(&mut self) -> bool {
        self.join_driver().await;
        self.cancel.is_cancelled()
    }

    async fn join_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!("scan dispatcher ended abnormally: {e}");
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for PortScanner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    job: ScanJob,
    shared: Arc<SharedProgress>,
    events: Arc<Notifier<ScannerEvent>>,
    cancel: CancellationToken,
) {
    let sem = Arc::new(Semaphore::new(job.workers.max(1)));
    let mut set = JoinSet::new();

    for &port in &job.ports {
        if cancel.is_cancelled() {
            break;
        }
        // Ports beyond the worker budget wait here for a free slot.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker = ScanWorker::new(job.target.clone(), port, job.timeout, cancel.clone());
        let shared = shared.clone();
        let events = events.clone();
        set.spawn(async move {
            let _permit = permit;
            let result = worker.run().await;
            shared.record(result, &events).await;
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!("scan worker failed: {e}");
        }
    }

    let cancelled = cancel.is_cancelled();
    shared.running.store(false, Ordering::Release);
    debug!(
        scanned = shared.scanned.load(Ordering::Acquire),
        total = job.ports.len(),
        cancelled,
        "port scan finished"
    );
    events.emit(ScannerEvent::Completed { cancelled });
}
