use std::time::Duration;

use netrecon::dns::DnsResolver;
use netrecon::events::ScanEvent;
use netrecon::service::ServiceDetector;
use netrecon::{EnginePhase, PortState, ScanConfiguration, ScanEngine, ScanError, ScanStatus};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

async fn closed_ports(n: usize) -> Vec<u16> {
    let mut ports = Vec::with_capacity(n);
    for _ in 0..n {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(l.local_addr().unwrap().port());
    }
    ports
}

/// Answer every connection with an SSH greeting.
async fn ssh_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            });
        }
    });
    port
}

fn loopback_config(ports: Vec<u16>) -> ScanConfiguration {
    ScanConfiguration {
        target: "127.0.0.1".to_string(),
        ports,
        timeout_ms: 500,
        max_workers: 4,
        ..ScanConfiguration::default()
    }
}

/// Collect events up to and including the terminal one.
async fn collect_events(rx: &mut UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("scan finished in time")
            .expect("engine alive");
        let terminal = matches!(event, ScanEvent::Completed(_) | ScanEvent::Failed(_));
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn percents(events: &[ScanEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn invalid_configuration_fails_without_starting() {
    let engine = ScanEngine::new();
    let mut rx = engine.subscribe();
    let mut config = loopback_config(vec![80]);
    config.target.clear();

    let err = engine.start_scan(config).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfiguration(_)));
    assert!(matches!(rx.recv().await, Some(ScanEvent::Failed(_))));
    assert!(rx.try_recv().is_err());
    assert_eq!(engine.phase().await, EnginePhase::Idle);
    assert!(engine.configuration().await.is_none());
}

#[tokio::test]
async fn closed_ports_scan_completes() {
    let ports = closed_ports(5).await;
    let engine = ScanEngine::new();
    let mut rx = engine.subscribe();
    engine.start_scan(loopback_config(ports.clone())).await.expect("start");
    assert!(engine.is_scanning().await);

    let events = collect_events(&mut rx).await;
    assert_eq!(events.first(), Some(&ScanEvent::Started("127.0.0.1".to_string())));
    let result = match events.last() {
        Some(ScanEvent::Completed(result)) => result.clone(),
        other => panic!("expected completion, got {other:?}"),
    };
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::PortDiscovered(_))));

    let progress = percents(&events);
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    assert_eq!(result.status, ScanStatus::Completed);
    assert_eq!(result.target_host, "127.0.0.1");
    assert!(result.end_time.is_some());
    assert_eq!(result.ports.len(), ports.len());
    for p in &result.ports {
        assert!(ports.contains(&p.port));
        assert!(matches!(p.state(), PortState::Closed | PortState::Filtered));
    }

    assert!(!engine.is_scanning().await);
    assert_eq!(engine.wait().await, result);
    assert_eq!(engine.current_result().await, result);
}

#[tokio::test]
async fn service_detection_merges_into_result() {
    let open = ssh_server().await;
    let mut ports = closed_ports(2).await;
    ports.push(open);

    let engine = ScanEngine::new();
    let mut rx = engine.subscribe();
    let mut config = loopback_config(ports);
    config.service_detection = true;
    engine.start_scan(config).await.expect("start");

    let events = collect_events(&mut rx).await;
    let discovered: Vec<u16> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::PortDiscovered(p) => Some(p.port),
            _ => None,
        })
        .collect();
    assert_eq!(discovered, vec![open]);

    let detected = events.iter().find_map(|e| match e {
        ScanEvent::ServiceDetected(info) => Some(info.clone()),
        _ => None,
    });
    let detected = detected.expect("service detected");
    assert_eq!(detected.port, open);
    assert_eq!(detected.name, "ssh");

    let progress = percents(&events);
    assert!(progress.contains(&80));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    let mut result = engine.wait().await;
    assert_eq!(result.status, ScanStatus::Completed);
    result.sort_by_port();
    let entry = result.ports.iter().find(|p| p.port == open).expect("open port");
    assert!(entry.is_open());
    assert_eq!(entry.service, "ssh");
    assert_eq!(entry.version, "SSH 2.0 (OpenSSH_9.6)");
    assert_eq!(result.open_ports().count(), 1);
}

#[tokio::test]
async fn dns_stage_runs_before_port_scan() {
    let ports = closed_ports(2).await;
    let engine = ScanEngine::new();
    let mut rx = engine.subscribe();
    let mut config = loopback_config(ports);
    config.target = "localhost".to_string();
    config.dns_resolution = true;
    engine.start_scan(config).await.expect("start");

    let events = collect_events(&mut rx).await;
    assert!(matches!(events.last(), Some(ScanEvent::Completed(_))));
    let progress = percents(&events);
    assert_eq!(progress[..3], [0u8, 5, 10]);
    assert_eq!(engine.wait().await.target_host, "localhost");
}

#[tokio::test]
async fn dns_stage_uses_the_resolver_timeout() {
    let mut resolver = DnsResolver::new();
    resolver.set_timeout(Duration::from_millis(1));
    let engine = ScanEngine::with_components(resolver, ServiceDetector::new());
    let mut rx = engine.subscribe();

    let mut config = loopback_config(closed_ports(1).await);
    config.target = "localhost".to_string();
    config.dns_resolution = true;
    engine.start_scan(config).await.expect("start");

    // Resolved or not, the scan goes on and completes.
    let events = collect_events(&mut rx).await;
    assert!(matches!(events.last(), Some(ScanEvent::Completed(_))));
    assert!(percents(&events).contains(&5));
}

#[tokio::test]
async fn second_start_is_rejected_and_cancel_restores_idle() {
    let engine = ScanEngine::new();
    let mut config = loopback_config(Vec::new());
    config.start_port = 1;
    config.end_port = 65535;
    config.max_workers = 1;
    engine.start_scan(config.clone()).await.expect("start");

    let mut rx = engine.subscribe();
    assert_eq!(engine.start_scan(config).await, Err(ScanError::AlreadyScanning));
    assert!(engine.is_scanning().await);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.cancel_scan().await);
    assert!(!engine.is_scanning().await);
    assert!(!engine.cancel_scan().await);

    let result = engine.current_result().await;
    assert_eq!(result.status, ScanStatus::Cancelled);
    assert!(result.end_time.is_some());

    let mut failures = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ScanEvent::Completed(_) => panic!("cancelled scan completed"),
            ScanEvent::Failed(reason) => failures.push(reason),
            _ => {}
        }
    }
    assert_eq!(
        failures,
        vec![
            ScanError::AlreadyScanning.to_string(),
            "Scan cancelled by user".to_string(),
        ]
    );

    // The cancelled run must not touch the next one.
    engine
        .start_scan(loopback_config(closed_ports(1).await))
        .await
        .expect("restart");
    let result = engine.wait().await;
    assert_eq!(result.status, ScanStatus::Completed);
    assert_eq!(result.ports.len(), 1);
}

#[tokio::test]
async fn wait_without_scan_returns_default() {
    let engine = ScanEngine::new();
    let result = engine.wait().await;
    assert_eq!(result.status, ScanStatus::Running);
    assert!(result.ports.is_empty());
}

#[tokio::test]
async fn cancel_keeps_ports_found_so_far() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    // The open port is dispatched first; the rest keep the single worker busy.
    let mut ports = vec![open];
    ports.extend((1..=60000).filter(|&p| p != open));

    let engine = ScanEngine::new();
    let mut rx = engine.subscribe();
    let mut config = loopback_config(ports);
    config.max_workers = 1;
    engine.start_scan(config).await.expect("start");

    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("open port reported in time")
            .expect("engine alive");
        match event {
            ScanEvent::PortDiscovered(p) => {
                assert_eq!(p.port, open);
                break;
            }
            ScanEvent::Completed(_) | ScanEvent::Failed(_) => panic!("scan ended early"),
            _ => {}
        }
    }

    let mid_scan = engine.current_result().await;
    assert_eq!(mid_scan.status, ScanStatus::Running);
    assert!(mid_scan.open_ports().any(|p| p.port == open));

    assert!(engine.cancel_scan().await);
    let result = engine.current_result().await;
    assert_eq!(result.status, ScanStatus::Cancelled);
    assert!(result.end_time.is_some());
    assert!(!result.ports.is_empty());
    assert!(result.ports.len() < 60000);
    let kept: Vec<u16> = result.open_ports().map(|p| p.port).collect();
    assert!(kept.contains(&open), "{kept:?}");
}
