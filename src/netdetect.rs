use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::events::{DiscoveryEvent, Notifier};
use crate::types::HostInfo;

/// Largest address block that expansion will produce.
pub const MAX_EXPANSION: u64 = 65_536;

/// Port probed by host discovery.
pub const DISCOVERY_PORT: u16 = 80;

/// Local interface enumeration, IPv4 range expansion and TCP liveness sweeps.
#[derive(Debug, Clone, Default)]
pub struct NetworkInterface {
    events: Arc<Notifier<DiscoveryEvent>>,
}

impl NetworkInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Names of interfaces carrying at least one non-loopback address.
    pub fn interfaces(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for iface in get_if_addrs()? {
            if iface.is_loopback() || names.contains(&iface.name) {
                continue;
            }
            names.push(iface.name);
        }
        Ok(names)
    }

    /// IPv4 addresses configured on one interface.
    pub fn interface_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        Ok(get_if_addrs()?
            .into_iter()
            .filter(|iface| iface.name == name)
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some(v4.ip),
                IfAddr::V6(_) => None,
            })
            .collect())
    }

    /// First non-loopback IPv4 address on this machine.
    pub fn local_ip_address(&self) -> Option<Ipv4Addr> {
        let ifaces = match get_if_addrs() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                debug!("failed to enumerate interfaces: {e}");
                return None;
            }
        };
        ifaces.into_iter().find_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
            _ => None,
        })
    }

    /// Expand `a.b.c.d/n` into its usable host addresses (network and broadcast
    /// excluded). Malformed input, blocks of /31 or smaller, and blocks larger
    /// than [`MAX_EXPANSION`] all yield an empty list.
    pub fn expand_cidr(&self, cidr: &str) -> Vec<Ipv4Addr> {
        match parse_cidr(cidr) {
            Some(net) => expand_ipv4net_hosts(net),
            None => Vec::new(),
        }
    }

    /// Every address from `start` to `end` inclusive. Empty if either bound is
    /// not an IPv4 literal, the bounds are reversed, or the span is larger
    /// than [`MAX_EXPANSION`].
    pub fn expand_range(&self, start: &str, end: &str) -> Vec<Ipv4Addr> {
        let (Ok(start), Ok(end)) = (
            start.trim().parse::<Ipv4Addr>(),
            end.trim().parse::<Ipv4Addr>(),
        ) else {
            return Vec::new();
        };
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end || u64::from(end - start) + 1 > MAX_EXPANSION {
            return Vec::new();
        }
        (start..=end).map(Ipv4Addr::from).collect()
    }

    /// Expand one target spec: a CIDR block, a `start-end` range of IPv4
    /// literals, or a single host which is passed through untouched.
    pub fn expand_target(&self, target: &str) -> Vec<String> {
        let target = target.trim();
        let range = target
            .split_once('-')
            .filter(|(start, _)| start.trim().parse::<Ipv4Addr>().is_ok());
        if target.contains('/') {
            to_strings(self.expand_cidr(target))
        } else if let Some((start, end)) = range {
            to_strings(self.expand_range(start, end))
        } else if target.is_empty() {
            Vec::new()
        } else {
            vec![target.to_string()]
        }
    }

    /// Single TCP connect liveness probe.
    pub async fn is_host_alive(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                true
            }
            _ => false,
        }
    }

    /// Sequentially probe every address the targets expand to on
    /// [`DISCOVERY_PORT`], recording aliveness and connect time.
    pub async fn discover_hosts(&self, targets: &[String], timeout: Duration) -> Vec<HostInfo> {
        let all: Vec<String> = targets
            .iter()
            .flat_map(|t| self.expand_target(t))
            .collect();
        let total = all.len();
        info!(targets = targets.len(), addresses = total, "host discovery started");
        self.events.emit(DiscoveryEvent::Started { total });

        let mut hosts = Vec::with_capacity(total);
        let mut hosts_found = 0usize;
        for (idx, address) in all.into_iter().enumerate() {
            self.events.emit(DiscoveryEvent::Progress {
                current: idx + 1,
                total,
            });

            let start = Instant::now();
            let info = if self.is_host_alive(&address, DISCOVERY_PORT, timeout).await {
                hosts_found += 1;
                let info = HostInfo {
                    ip_address: address,
                    hostname: None,
                    is_alive: true,
                    response_time_ms: start.elapsed().as_millis() as i64,
                };
                debug!(address = %info.ip_address, ms = info.response_time_ms, "host is alive");
                self.events.emit(DiscoveryEvent::HostDiscovered(info.clone()));
                info
            } else {
                HostInfo::unreachable(address)
            };
            hosts.push(info);
        }

        info!(hosts_found, "host discovery finished");
        self.events.emit(DiscoveryEvent::Completed { hosts_found });
        hosts
    }
}

/// Detect local non-loopback IPv4 networks from each interface's address and
/// netmask, falling back to the surrounding /24 when the mask is unusable.
/// Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() {
                continue;
            }
            let cidr = Ipv4Net::with_netmask(ip, v4.netmask)
                .map(|n| n.trunc())
                .unwrap_or_else(|_| ipv4_to_default_cidr(ip));
            set.insert(cidr);
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    // Sort for stable output
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).unwrap_or_else(|_| Ipv4Net::from(ip))
}

/// Strict `a.b.c.d/n`: dotted-decimal IPv4 and a one or two digit prefix
/// no larger than 32. Host bits are masked off.
fn parse_cidr(cidr: &str) -> Option<Ipv4Net> {
    let (addr, prefix) = cidr.trim().split_once('/')?;
    if prefix.is_empty() || prefix.len() > 2 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    Ipv4Net::new(addr, prefix).ok().map(|n| n.trunc())
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    // Use the numeric span, then skip network and broadcast.
    let start = u64::from(u32::from(net.network()));
    let end = u64::from(u32::from(net.broadcast()));
    let size = end - start + 1;
    if size > MAX_EXPANSION || size <= 2 {
        return Vec::new();
    }
    (start + 1..end)
        .filter_map(|n| u32::try_from(n).ok())
        .map(Ipv4Addr::from)
        .collect()
}

fn to_strings(ips: Vec<Ipv4Addr>) -> Vec<String> {
    ips.into_iter().map(|ip| ip.to_string()).collect()
}
