use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Synchronous rejections at scan entry points. Everything that happens after
/// a scan has started is reported through result fields instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("scan already in progress")]
    AlreadyScanning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target host not set")]
    MissingTarget,
    #[error("no ports specified for scanning")]
    NoPorts,
    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
    #[error("port {0} is not scannable")]
    InvalidPort(u16),
    #[error("invalid timeout value")]
    InvalidTimeout,
    #[error("invalid worker count")]
    InvalidWorkerCount,
}
