use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    #[default]
    PortScan,
    ServiceDetection,
    FullScan,
}

/// One scan request.
///
/// An explicit `ports` set takes precedence over `start_port..=end_port`.
/// The engine clones the configuration when a scan starts, so later edits to
/// the caller's copy never affect a running scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfiguration {
    pub target: String,
    pub targets: Vec<String>,
    pub start_port: u16,
    pub end_port: u16,
    pub ports: Vec<u16>,
    pub scan_type: ScanType,
    pub timeout_ms: u64,
    pub max_workers: usize,
    pub service_detection: bool,
    pub dns_resolution: bool,
    pub host_discovery: bool,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            target: String::new(),
            targets: Vec::new(),
            start_port: 1,
            end_port: 1000,
            ports: Vec::new(),
            scan_type: ScanType::PortScan,
            timeout_ms: 2000,
            max_workers: 100,
            service_detection: false,
            dns_resolution: false,
            host_discovery: false,
        }
    }
}

impl ScanConfiguration {
    /// Ports 1-1000 with a short timeout and a wide worker pool.
    pub fn quick_scan(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout_ms: 1000,
            max_workers: 200,
            ..Self::default()
        }
    }

    /// Every TCP port, with DNS resolution and service detection.
    pub fn full_scan(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            end_port: 65535,
            scan_type: ScanType::FullScan,
            service_detection: true,
            dns_resolution: true,
            ..Self::default()
        }
    }

    pub fn custom_scan(target: impl Into<String>, start_port: u16, end_port: u16) -> Self {
        Self {
            target: target.into(),
            start_port,
            end_port,
            scan_type: ScanType::ServiceDetection,
            service_detection: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid scan configuration document")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("in configuration file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() && self.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::MissingTarget);
        }

        if self.ports.is_empty() {
            if self.start_port == 0 || self.start_port > self.end_port {
                return Err(ConfigError::InvalidPortRange {
                    start: self.start_port,
                    end: self.end_port,
                });
            }
        } else if self.ports.contains(&0) {
            return Err(ConfigError::InvalidPort(0));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn port_count(&self) -> usize {
        if !self.ports.is_empty() {
            return self.ports.len();
        }
        if self.start_port > self.end_port {
            return 0;
        }
        usize::from(self.end_port - self.start_port) + 1
    }

    pub fn ports_to_scan(&self) -> Vec<u16> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }
        (self.start_port..=self.end_port).collect()
    }

    /// The host a single-target scan is pointed at: `target`, or the first
    /// non-blank entry of `targets` in multi-host mode.
    pub fn primary_target(&self) -> &str {
        let target = self.target.trim();
        if !target.is_empty() {
            return target;
        }
        self.targets
            .iter()
            .map(|t| t.trim())
            .find(|t| !t.is_empty())
            .unwrap_or("")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
