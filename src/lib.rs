//! netrecon: asynchronous TCP reconnaissance engine.
//!
//! [`engine::ScanEngine`] sequences optional DNS resolution, a bounded
//! concurrent connect scan ([`scanner::PortScanner`]) and optional banner
//! based service detection ([`service::ServiceDetector`]) into one
//! [`types::ScanResult`]. [`netdetect::NetworkInterface`] expands address
//! ranges and sweeps them for live hosts.
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod netdetect;
pub mod ports;
pub mod scanner;
pub mod service;
pub mod types;
pub mod worker;

pub use config::{ScanConfiguration, ScanType};
pub use engine::{EnginePhase, ScanEngine};
pub use error::{ConfigError, ScanError};
pub use types::{HostInfo, PortResult, PortState, Protocol, ScanResult, ScanStatus, ServiceInfo};
