use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::types::{PortResult, PortState};

/// A single TCP connect probe against one (host, port) pair.
#[derive(Debug, Clone)]
pub struct ScanWorker {
    target: String,
    port: u16,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ScanWorker {
    pub fn new(
        target: impl Into<String>,
        port: u16,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target: target.into(),
            port,
            timeout,
            cancel,
        }
    }

    /// Attempt the handshake and classify it. Never fails: every outcome,
    /// including cancellation, is a [`PortState`].
    pub async fn run(self) -> PortResult {
        if self.cancel.is_cancelled() {
            return PortResult::new(self.port, PortState::Cancelled);
        }

        let connect = time::timeout(
            self.timeout,
            TcpStream::connect((self.target.as_str(), self.port)),
        );
        let state = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => PortState::Cancelled,
            outcome = connect => match outcome {
                Ok(Ok(mut stream)) => {
                    let _ = stream.shutdown().await;
                    PortState::Open
                }
                Ok(Err(e)) => classify_connect_error(&e),
                Err(_elapsed) => PortState::Filtered,
            },
        };

        trace!(host = %self.target, port = self.port, %state, "probe finished");
        PortResult::new(self.port, state)
    }
}

/// Map a failed connect to a port state, preferring the structured error kind
/// and falling back to the message text.
pub fn classify_connect_error(err: &io::Error) -> PortState {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => PortState::Closed,
        io::ErrorKind::TimedOut
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => PortState::Filtered,
        _ => classify_error_text(&err.to_string()),
    }
}

/// Case-insensitive classification of a connect error message.
pub fn classify_error_text(message: &str) -> PortState {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["connection refused"]) {
        PortState::Closed
    } else if has(&["timed out", "timeout", "unreachable", "no route"]) {
        PortState::Filtered
    } else if has(&[
        "not found",
        "could not find",
        "failed to lookup address",
        "name or service not known",
        "nodename nor servname",
        "no such host",
    ]) {
        PortState::UnknownHost
    } else {
        PortState::Closed
    }
}
