use std::collections::HashSet;
use std::time::Duration;

use netrecon::events::ScannerEvent;
use netrecon::scanner::PortScanner;
use netrecon::{PortState, ScanError};
use tokio::net::TcpListener;

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn next_completion(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ScannerEvent>) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Some(ScannerEvent::Completed { cancelled })) => return cancelled,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("scanner dropped its notifier"),
            Err(_) => panic!("scan did not complete"),
        }
    }
}

#[tokio::test]
async fn finds_open_port_and_reports_every_port_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = vec![closed_port().await, closed_port().await];

    let mut scanner = PortScanner::new();
    let mut rx = scanner.subscribe();
    scanner.set_target("127.0.0.1");
    scanner.set_ports(vec![closed[0], open, closed[1]]);
    scanner.set_timeout(Duration::from_millis(500));
    scanner.set_worker_count(2);
    scanner.start_scan().await.expect("scan starts");

    let mut found = Vec::new();
    let mut last_scanned = 0;
    loop {
        match rx.recv().await.expect("event") {
            ScannerEvent::PortFound(p) => found.push(p.port),
            ScannerEvent::Progress { scanned, total } => {
                assert_eq!(total, 3);
                assert!(scanned > last_scanned);
                last_scanned = scanned;
            }
            ScannerEvent::Completed { cancelled } => {
                assert!(!cancelled);
                break;
            }
            ScannerEvent::Error(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(!scanner.wait().await);
    assert!(!scanner.is_scanning());
    assert_eq!(found, vec![open]);
    assert_eq!(last_scanned, 3);
    assert_eq!(scanner.scanned_count(), 3);

    let results = scanner.results().await;
    assert_eq!(results.len(), 3);
    let unique: HashSet<u16> = results.iter().map(|r| r.port).collect();
    assert_eq!(unique.len(), 3);
    for r in &results {
        let expected = if r.port == open { PortState::Open } else { PortState::Closed };
        assert_eq!(r.state(), expected, "port {}", r.port);
    }

    let open_ports = scanner.open_ports().await;
    assert_eq!(open_ports.len(), 1);
    assert_eq!(open_ports[0].port, open);
    assert_eq!(open_ports[0].protocol.to_string(), "TCP");
}

#[tokio::test]
async fn unknown_host_is_classified_per_port() {
    let mut scanner = PortScanner::new();
    scanner.set_target("no-such-host.invalid");
    scanner.set_ports(vec![80, 443]);
    scanner.set_timeout(Duration::from_secs(5));
    scanner.start_scan().await.expect("scan starts");
    assert!(!scanner.wait().await);

    let results = scanner.results().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.state() != PortState::Open));
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let mut scanner = PortScanner::new();
    let mut rx = scanner.subscribe();
    scanner.set_target("127.0.0.1");
    scanner.set_port_range(1, 65535);
    scanner.set_worker_count(1);
    scanner.start_scan().await.expect("scan starts");

    assert_eq!(scanner.start_scan().await, Err(ScanError::AlreadyScanning));
    assert!(scanner.is_scanning());
    scanner.stop_scan().await;
    assert!(next_completion(&mut rx).await);
}

#[tokio::test]
async fn stop_scan_drains_and_allows_restart() {
    let mut scanner = PortScanner::new();
    let mut rx = scanner.subscribe();
    scanner.set_target("127.0.0.1");
    scanner.set_port_range(1, 65535);
    scanner.set_timeout(Duration::from_millis(200));
    scanner.set_worker_count(1);
    scanner.start_scan().await.expect("scan starts");

    tokio::time::sleep(Duration::from_millis(20)).await;
    scanner.stop_scan().await;

    assert!(!scanner.is_scanning());
    assert!(next_completion(&mut rx).await);
    let scanned = scanner.scanned_count();
    assert!(scanned < 65535);
    assert_eq!(scanner.results().await.len(), scanned);

    // No late arrivals after the drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scanner.scanned_count(), scanned);

    let port = closed_port().await;
    scanner.set_ports(vec![port]);
    scanner.start_scan().await.expect("restart");
    assert!(!next_completion(&mut rx).await);
    assert_eq!(scanner.results().await.len(), 1);
}

#[tokio::test]
async fn stop_right_after_start_records_only_drained_probes() {
    let mut scanner = PortScanner::new();
    let mut rx = scanner.subscribe();
    scanner.set_target("127.0.0.1");
    scanner.set_port_range(1, 65535);
    scanner.set_worker_count(1);
    scanner.start_scan().await.expect("scan starts");
    scanner.stop_scan().await;

    assert!(!scanner.is_scanning());
    assert!(next_completion(&mut rx).await);

    let results = scanner.results().await;
    assert_eq!(results.len(), scanner.scanned_count());
    // The dispatcher sees the cancellation before its first permit.
    assert!(results.is_empty(), "{results:?}");
    assert!(scanner.open_ports().await.is_empty());
}

#[tokio::test]
async fn stop_mid_flight_keeps_states_consistent() {
    let mut scanner = PortScanner::new();
    scanner.set_target("127.0.0.1");
    scanner.set_port_range(1, 65535);
    scanner.set_worker_count(1);
    scanner.start_scan().await.expect("scan starts");
    tokio::task::yield_now().await;
    scanner.stop_scan().await;

    let results = scanner.results().await;
    assert_eq!(results.len(), scanner.scanned_count());
    assert!(results.len() < 65535);
    let unique: HashSet<u16> = results.iter().map(|r| r.port).collect();
    assert_eq!(unique.len(), results.len());
    for r in &results {
        assert!(
            matches!(
                r.state(),
                PortState::Cancelled | PortState::Open | PortState::Closed | PortState::Filtered
            ),
            "port {} ended {}",
            r.port,
            r.state()
        );
    }
}
