use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Transport protocol of a probed port. Only TCP is ever probed; UDP exists for
/// the well-known port table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Outcome of a single connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Cancelled,
    UnknownHost,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::Cancelled => "cancelled",
            PortState::UnknownHost => "unknown-host",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probed port. The state is fixed at construction; service and version
/// are filled in later by service detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub protocol: Protocol,
    state: PortState,
    pub service: String,
    pub version: String,
}

impl PortResult {
    pub fn new(port: u16, state: PortState) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            state,
            service: String::new(),
            version: String::new(),
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

/// What service detection learned about one open port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
    pub port: u16,
    pub protocol: Protocol,
    pub name: String,
    pub version: String,
    /// Raw banner text, empty when the service sent nothing.
    pub banner: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Consolidated result of one engine run.
///
/// `id` is left at 0; a persistence layer assigns it when storing the result.
/// Ports are kept in worker-completion order, call [`ScanResult::sort_by_port`]
/// when numeric order matters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub id: i64,
    pub target_host: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub ports: Vec<PortResult>,
    pub status: ScanStatus,
}

impl ScanResult {
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            id: 0,
            target_host: target_host.into(),
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            ports: Vec::new(),
            status: ScanStatus::Running,
        }
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &PortResult> {
        self.ports.iter().filter(|p| p.is_open())
    }

    pub fn sort_by_port(&mut self) {
        self.ports.sort_by_key(|p| p.port);
    }

    /// Freeze the result with a terminal status.
    pub(crate) fn finish(&mut self, status: ScanStatus) {
        self.status = status;
        self.end_time = Some(OffsetDateTime::now_utc());
    }
}

impl Default for ScanResult {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// One address visited by a host discovery sweep.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub ip_address: String,
    pub hostname: Option<String>,
    pub is_alive: bool,
    /// Connect time in milliseconds, -1 when the host did not answer.
    pub response_time_ms: i64,
}

impl HostInfo {
    pub fn unreachable(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            hostname: None,
            is_alive: false,
            response_time_ms: -1,
        }
    }
}
