//! Notifications emitted by the scanning components.
//!
//! Each component owns a [`Notifier`] and hands out unbounded receivers via
//! `subscribe()`. Emitting never blocks, and subscribers that dropped their
//! receiver are pruned on the next emit.

use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::dns::LookupId;
use crate::types::{HostInfo, PortResult, ScanResult, ServiceInfo};

/// Engine level notifications, in the order a caller observes them for one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Started(String),
    Progress { percent: u8, message: String },
    PortDiscovered(PortResult),
    ServiceDetected(ServiceInfo),
    Completed(ScanResult),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerEvent {
    PortFound(PortResult),
    Progress { scanned: usize, total: usize },
    Completed { cancelled: bool },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsEvent {
    HostResolved {
        id: Option<LookupId>,
        hostname: String,
        addresses: Vec<IpAddr>,
    },
    ReverseResolved {
        id: LookupId,
        address: String,
        hostname: String,
    },
    ResolutionFailed {
        id: LookupId,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started { total: usize },
    Progress { current: usize, total: usize },
    HostDiscovered(HostInfo),
    Completed { hosts_found: usize },
}

/// Fan-out of one event stream to any number of channel subscribers.
#[derive(Debug)]
pub struct Notifier<E> {
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> Notifier<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E: Clone> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}
