//! Service fingerprinting for open ports.
//!
//! Identification starts from a well-known port table and is refined by a
//! banner grab: connect, optionally send a probe, read whatever the service
//! says first, then run the banner through an ordered list of heuristics.
//! Every failure degrades to the port-table guess.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::types::{Protocol, ServiceInfo};

const BANNER_LIMIT: usize = 4096;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(3000);
const HTTP_PROBE: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

const TCP_SERVICES: &[(u16, &str)] = &[
    (20, "ftp-data"),
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (443, "https"),
    (445, "smb"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5900, "vnc"),
    (6379, "redis"),
    (8080, "http-proxy"),
    (8443, "https-alt"),
    (27017, "mongodb"),
];

const UDP_SERVICES: &[(u16, &str)] = &[
    (53, "dns"),
    (67, "dhcp-server"),
    (68, "dhcp-client"),
    (69, "tftp"),
    (123, "ntp"),
    (161, "snmp"),
    (162, "snmp-trap"),
    (500, "ipsec"),
    (514, "syslog"),
];

/// Well-known service name for a port, or `"unknown"`.
pub fn service_by_port(port: u16, protocol: Protocol) -> &'static str {
    let table = match protocol {
        Protocol::Tcp => TCP_SERVICES,
        Protocol::Udp => UDP_SERVICES,
    };
    table
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

/// Bytes to send before reading, for services that wait for the client.
fn probe_for_port(port: u16) -> Option<&'static [u8]> {
    match port {
        80 | 8080 | 8443 => Some(HTTP_PROBE),
        // ssh, ftp, smtp, pop3 and imap greet first; everything else is read passively
        _ => None,
    }
}

/// Name and version recognised in a banner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BannerMatch {
    pub name: Option<&'static str>,
    pub version: String,
}

impl BannerMatch {
    fn named(name: &'static str, version: impl Into<String>) -> Self {
        Self {
            name: Some(name),
            version: version.into(),
        }
    }
}

/// Classify a banner. The first matching rule wins; an unmatched banner
/// yields no name and an empty version.
pub fn parse_banner(banner: &str, port: u16) -> BannerMatch {
    if banner.is_empty() {
        return BannerMatch::default();
    }
    let first_line = banner.lines().next().unwrap_or("").trim();

    if let Some(http_version) = find_http_status(banner) {
        let mut version = format!("HTTP/{http_version}");
        if let Some(server) = header_value(banner, "Server") {
            version.push_str(&format!(" ({server})"));
        }
        return BannerMatch::named("http", version);
    }

    if let Some(rest) = banner.strip_prefix("SSH-") {
        let line = rest.lines().next().unwrap_or("");
        let version = match line.split_once('-') {
            Some((proto, software)) if is_dotted_pair(proto) && !software.trim().is_empty() => {
                format!("SSH {proto} ({})", software.trim())
            }
            _ => String::new(),
        };
        return BannerMatch::named("ssh", version);
    }

    if banner.starts_with("220") {
        let greeting = greeting_after_code(first_line).unwrap_or_default();
        let name = if banner.to_ascii_uppercase().contains("SMTP") {
            "smtp"
        } else {
            "ftp"
        };
        return BannerMatch::named(name, greeting);
    }

    if banner.starts_with("+OK") {
        let version = first_line
            .strip_prefix("+OK ")
            .map(str::trim)
            .unwrap_or_default();
        return BannerMatch::named("pop3", version);
    }

    if banner.contains("IMAP") || banner.starts_with("* OK") {
        let version = banner
            .find("* OK ")
            .map(|i| {
                banner[i + "* OK ".len()..]
                    .lines()
                    .next()
                    .unwrap_or("")
                    .trim()
            })
            .unwrap_or_default();
        return BannerMatch::named("imap", version);
    }

    if banner.to_ascii_lowercase().contains("mysql") || port == 3306 {
        return BannerMatch::named("mysql", find_semver(banner).unwrap_or_default());
    }

    match port {
        5432 => BannerMatch::named("postgresql", ""),
        6379 => BannerMatch::named("redis", ""),
        27017 => BannerMatch::named("mongodb", ""),
        _ => BannerMatch::default(),
    }
}

/// `HTTP/<d+.d+>` followed by whitespace and a status code, anywhere in the text.
fn find_http_status(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(idx) = rest.find("HTTP/") {
        let after = &rest[idx + "HTTP/".len()..];
        let ver_len = after
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(after.len());
        let version = &after[..ver_len];
        let tail = &after[ver_len..];
        let trimmed = tail.trim_start();
        let has_gap = trimmed.len() < tail.len();
        if is_dotted_pair(version)
            && has_gap
            && trimmed.starts_with(|c: char| c.is_ascii_digit())
        {
            return Some(version);
        }
        rest = after;
    }
    None
}

fn header_value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == name {
            let value = value.trim();
            (!value.is_empty()).then_some(value)
        } else {
            None
        }
    })
}

fn greeting_after_code(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("220")?;
    let rest = rest.strip_prefix([' ', '-'])?;
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

/// True for `<digits>.<digits>`.
fn is_dotted_pair(s: &str) -> bool {
    match s.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// First `<digits>.<digits>.<digits>` run in the text.
fn find_semver(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let mut parts = 0;
        let mut j = i;
        loop {
            let start = j;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j == start {
                break;
            }
            parts += 1;
            if parts == 3 || j >= bytes.len() || bytes[j] != b'.' {
                break;
            }
            if !bytes.get(j + 1).is_some_and(u8::is_ascii_digit) {
                break;
            }
            j += 1;
        }
        if parts == 3 {
            return Some(text[i..j].to_string());
        }
        i += 1;
    }
    None
}

/// Decode raw bytes one byte per char so binary handshakes stay inspectable.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[derive(Debug, Clone)]
pub struct ServiceDetector {
    read_timeout: Duration,
}

impl Default for ServiceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceDetector {
    pub fn new() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
    }

    /// Identify the service on an open port. Never fails: on any network
    /// problem the port-table name is returned with an empty version and banner.
    pub async fn detect_service(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> ServiceInfo {
        let mut info = ServiceInfo {
            port,
            protocol: Protocol::Tcp,
            name: service_by_port(port, Protocol::Tcp).to_string(),
            ..ServiceInfo::default()
        };

        let mut stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(host, port, "service detection connect failed: {e}");
                return info;
            }
            Err(_) => {
                debug!(host, port, "service detection connect timed out");
                return info;
            }
        };

        info.banner = self.grab_banner(&mut stream, port).await;
        if !info.banner.is_empty() {
            let parsed = parse_banner(&info.banner, port);
            if let Some(name) = parsed.name {
                info.name = name.to_string();
            }
            info.version = parsed.version;
        }
        let _ = stream.shutdown().await;

        debug!(host, port, service = %info.name, version = %info.version, "service detected");
        info
    }

    async fn grab_banner(&self, stream: &mut TcpStream, port: u16) -> String {
        if let Some(probe) = probe_for_port(port) {
            if let Err(e) = stream.write_all(probe).await {
                debug!(port, "failed to send probe: {e}");
                return String::new();
            }
        }

        let mut buf = vec![0u8; BANNER_LIMIT];
        match timeout(self.read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => latin1(&buf[..n]).trim().to_string(),
            _ => String::new(),
        }
    }
}
