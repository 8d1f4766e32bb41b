//! Forward and reverse name resolution.
//!
//! The blocking forms (`resolve_host`, `reverse_resolve`) await the lookup
//! under a deadline and return an empty answer on failure. The async forms
//! return a [`LookupHandle`] immediately and report through [`DnsEvent`]s;
//! they run under the resolver's own timeout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::events::{DnsEvent, Notifier};

pub type LookupId = u64;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// What an async lookup request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupHandle {
    /// A lookup is running; its result will carry this id.
    Pending(LookupId),
    /// The query was already an address; the result was emitted before returning.
    Immediate,
    /// The query failed validation; nothing was started.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

#[derive(Debug)]
struct PendingLookup {
    query: String,
    direction: Direction,
    abort: AbortHandle,
}

enum Answer {
    Addresses(Vec<IpAddr>),
    Hostname(String),
}

#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<LookupId, PendingLookup>>>,
    events: Arc<Notifier<DnsEvent>>,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Notifier::new()),
        }
    }

    /// Default deadline for callers that do not pick their own.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DnsEvent> {
        self.events.subscribe()
    }

    /// Resolve a hostname to its addresses, or return an address literal as-is
    /// without querying anything. Empty on invalid input, failure or timeout.
    pub async fn resolve_host(&self, hostname: &str, timeout: Duration) -> Vec<IpAddr> {
        if !is_valid_hostname(hostname) {
            return Vec::new();
        }
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return vec![ip];
        }

        match time::timeout(timeout, lookup_forward(hostname)).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(e)) => {
                debug!(hostname, "forward lookup failed: {e}");
                Vec::new()
            }
            Err(_) => {
                debug!(hostname, "forward lookup timed out");
                Vec::new()
            }
        }
    }

    /// Hostname for an address literal, or an empty string.
    pub async fn reverse_resolve(&self, address: &str, timeout: Duration) -> String {
        let Ok(ip) = address.parse::<IpAddr>() else {
            return String::new();
        };

        match time::timeout(timeout, lookup_reverse(ip)).await {
            Ok(Ok(hostname)) => hostname,
            Ok(Err(e)) => {
                debug!(address, "reverse lookup failed: {e}");
                String::new()
            }
            Err(_) => {
                debug!(address, "reverse lookup timed out");
                String::new()
            }
        }
    }

    /// Start a forward lookup in the background. Must be called from within a
    /// tokio runtime.
    pub fn resolve_host_async(&self, hostname: &str) -> LookupHandle {
        if !is_valid_hostname(hostname) {
            return LookupHandle::Invalid;
        }
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            self.events.emit(DnsEvent::HostResolved {
                id: None,
                hostname: hostname.to_string(),
                addresses: vec![ip],
            });
            return LookupHandle::Immediate;
        }

        let query = hostname.to_string();
        let limit = self.timeout;
        self.spawn_lookup(query.clone(), Direction::Forward, async move {
            bounded(limit, lookup_forward(&query)).await.map(Answer::Addresses)
        })
    }

    /// Start a reverse lookup in the background. Must be called from within a
    /// tokio runtime.
    pub fn reverse_resolve_async(&self, address: &str) -> LookupHandle {
        let Ok(ip) = address.parse::<IpAddr>() else {
            return LookupHandle::Invalid;
        };
        let limit = self.timeout;
        self.spawn_lookup(address.to_string(), Direction::Reverse, async move {
            bounded(limit, lookup_reverse(ip)).await.map(Answer::Hostname)
        })
    }

    /// Abort a pending async lookup. Its result, if any arrives, is discarded.
    pub fn cancel_lookup(&self, id: LookupId) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match entry {
            Some(entry) => {
                entry.abort.abort();
                debug!(id, query = %entry.query, "lookup cancelled");
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_lookup<F>(&self, query: String, direction: Direction, lookup: F) -> LookupHandle
    where
        F: std::future::Future<Output = Result<Answer, String>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let events = self.events.clone();

        // Hold the table while spawning so the completion cannot run before
        // the entry exists.
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            let outcome = lookup.await;
            complete_lookup(&pending, &events, id, outcome);
        });
        table.insert(
            id,
            PendingLookup {
                query,
                direction,
                abort: task.abort_handle(),
            },
        );
        LookupHandle::Pending(id)
    }
}

fn complete_lookup(
    pending: &Mutex<HashMap<LookupId, PendingLookup>>,
    events: &Notifier<DnsEvent>,
    id: LookupId,
    outcome: Result<Answer, String>,
) {
    let entry = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    let Some(entry) = entry else {
        return;
    };

    let event = match (entry.direction, outcome) {
        (_, Err(error)) => DnsEvent::ResolutionFailed { id, error },
        (Direction::Forward, Ok(Answer::Addresses(addresses))) => DnsEvent::HostResolved {
            id: Some(id),
            hostname: entry.query,
            addresses,
        },
        (Direction::Reverse, Ok(Answer::Hostname(hostname))) => DnsEvent::ReverseResolved {
            id,
            address: entry.query,
            hostname,
        },
        _ => DnsEvent::ResolutionFailed {
            id,
            error: "mismatched lookup answer".to_string(),
        },
    };
    events.emit(event);
}

async fn bounded<T, F>(limit: Duration, lookup: F) -> Result<T, String>
where
    F: std::future::Future<Output = Result<T, String>>,
{
    match time::timeout(limit, lookup).await {
        Ok(outcome) => outcome,
        Err(_) => Err(format!("lookup timed out after {} ms", limit.as_millis())),
    }
}

async fn lookup_forward(hostname: &str) -> Result<Vec<IpAddr>, String> {
    let addrs = tokio::net::lookup_host((hostname, 0))
        .await
        .map_err(|e| e.to_string())?;
    let mut out: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !out.contains(&addr.ip()) {
            out.push(addr.ip());
        }
    }
    if out.is_empty() {
        return Err(format!("no addresses found for {hostname}"));
    }
    Ok(out)
}

async fn lookup_reverse(ip: IpAddr) -> Result<String, String> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        debug!("system resolver configuration unavailable, using defaults: {e}");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });
    let lookup = resolver.reverse_lookup(ip).await.map_err(|e| e.to_string())?;
    lookup
        .iter()
        .map(|name| name.to_string().trim_end_matches('.').to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| format!("no PTR record for {ip}"))
}

pub fn is_valid_ip_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

/// Address literals, or RFC 1123 style names: dot separated labels of 1-63
/// alphanumerics and inner hyphens, at most 253 characters overall.
pub fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if is_valid_ip_address(hostname) {
        return true;
    }
    hostname.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_LABEL_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}
