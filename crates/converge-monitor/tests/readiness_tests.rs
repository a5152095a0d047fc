//! Readiness race against a local HTTP stub and a temp log file

use converge_monitor::{ReadinessConfig, ReadinessError, ReadinessMonitor, ReadySignal};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Answers every connection with `503`, which still counts as ready
async fn unhealthy_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        }
    });
    format!("http://{addr}/health")
}

async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/health")
}

fn config() -> ReadinessConfig {
    ReadinessConfig {
        markers: vec!["Started LegionApplication".to_string()],
        poll_interval: Duration::from_millis(100),
        max_wait: Duration::from_secs(10),
        progress_interval: Duration::from_secs(1),
        ..ReadinessConfig::default()
    }
}

fn append(path: &Path, text: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

#[tokio::test]
async fn any_http_response_means_ready() {
    let url = unhealthy_server().await;
    let monitor = ReadinessMonitor::new(ReadinessConfig {
        health_url: Some(url.clone()),
        ..config()
    })
    .unwrap();

    let signal = monitor.wait().await.unwrap();

    assert_eq!(signal, ReadySignal::Health { url, status: 503 });
}

#[tokio::test]
async fn log_marker_wins_when_endpoint_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("legion.log");
    append(&log, "INFO Started LegionApplication in 90s (previous run)\n");
    let monitor = ReadinessMonitor::new(ReadinessConfig {
        health_url: Some(closed_port_url().await),
        log_file: Some(log.clone()),
        ..config()
    })
    .unwrap();

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        append(&log, "INFO Started LegionApplication in 42s\n");
    });
    let signal = monitor.wait().await.unwrap();
    writer.await.unwrap();

    assert_eq!(
        signal,
        ReadySignal::LogMarker {
            line: "INFO Started LegionApplication in 42s".to_string()
        }
    );
}

#[tokio::test]
async fn gives_up_after_max_wait() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("legion.log");
    let monitor = ReadinessMonitor::new(ReadinessConfig {
        health_url: Some(closed_port_url().await),
        log_file: Some(log.clone()),
        max_wait: Duration::from_millis(600),
        ..config()
    })
    .unwrap();

    let err = monitor.wait().await.unwrap_err();

    match &err {
        ReadinessError::Timeout { log: Some(path), waited, .. } => {
            assert_eq!(path, &log);
            assert!(*waited >= Duration::from_millis(600));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("legion.log"));
}

#[tokio::test]
async fn cancel_signal_stops_the_wait() {
    let monitor = ReadinessMonitor::new(ReadinessConfig {
        health_url: Some(closed_port_url().await),
        ..config()
    })
    .unwrap();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
    });

    assert!(matches!(monitor.wait_with_cancel(rx).await, Err(ReadinessError::Cancelled)));
}

#[tokio::test]
async fn dropped_cancel_sender_does_not_cancel() {
    let url = unhealthy_server().await;
    let monitor = ReadinessMonitor::new(ReadinessConfig {
        health_url: Some(url),
        poll_interval: Duration::from_millis(300),
        ..config()
    })
    .unwrap();
    let (tx, rx) = watch::channel(false);
    drop(tx);

    assert!(monitor.wait_with_cancel(rx).await.is_ok());
}
