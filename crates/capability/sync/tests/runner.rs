use async_trait::async_trait;
use domain::{Value, shutdown_channel};
use ds_ipc::{IpcClient, IpcClientConfig, IpcError, IpcServer, IpcServerConfig};
use ds_store::{DataStore, Registration};
use ds_sync::{
    HttpUpstream, PolledValues, SyncConfig, SyncError, SyncRunner, SyncState, SyncWriter,
    UpstreamSource,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct StaticUpstream(serde_json::Value);

#[async_trait]
impl UpstreamSource for StaticUpstream {
    async fn poll(&self) -> Result<PolledValues, SyncError> {
        serde_json::from_value(self.0.clone()).map_err(|err| SyncError::Upstream(err.to_string()))
    }
}

struct FailingUpstream;

#[async_trait]
impl UpstreamSource for FailingUpstream {
    async fn poll(&self) -> Result<PolledValues, SyncError> {
        Err(SyncError::Upstream("connection refused".to_string()))
    }
}

#[derive(Default)]
struct RecordingWriter {
    writes: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl SyncWriter for RecordingWriter {
    async fn write(&self, key: &str, value: Value) -> Result<(), IpcError> {
        self.writes
            .lock()
            .expect("lock")
            .push((key.to_string(), value));
        Ok(())
    }
}

struct DownWriter;

#[async_trait]
impl SyncWriter for DownWriter {
    async fn write(&self, _key: &str, _value: Value) -> Result<(), IpcError> {
        Err(IpcError::Closed)
    }
}

fn sample_upstream() -> Arc<StaticUpstream> {
    Arc::new(StaticUpstream(json!({
        "deviceA": {
            "tag1": {"value": 12.5, "status": "SUCCESS"},
            "tag2": {"value": null, "status": "FAIL"}
        }
    })))
}

#[tokio::test]
async fn cycle_writes_only_successful_values() {
    let writer = Arc::new(RecordingWriter::default());
    let mut runner = SyncRunner::new(sample_upstream(), writer.clone(), SyncConfig::default());

    let report = runner.run_cycle().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);

    let writes = writer.writes.lock().expect("lock").clone();
    assert_eq!(writes, vec![("deviceA.tag1".to_string(), Value::Float(12.5))]);

    let stats = runner.stats();
    assert_eq!(stats.total_cycles, 1);
    assert_eq!(stats.successful_writes, 1);
    assert_eq!(stats.failed_writes, 0);
    assert!(stats.last_sync_ms.is_some());
}

#[tokio::test]
async fn upstream_failure_records_error_without_writes() {
    let writer = Arc::new(RecordingWriter::default());
    let mut runner = SyncRunner::new(Arc::new(FailingUpstream), writer.clone(), SyncConfig::default());

    let report = runner.run_cycle().await;
    assert!(report.upstream_failed);
    assert!(writer.writes.lock().expect("lock").is_empty());

    let stats = runner.stats();
    assert_eq!(stats.total_cycles, 1);
    assert_eq!(stats.failed_writes, 0);
    assert_eq!(stats.errors.back().map(|r| r.key.as_str()), Some("upstream"));
}

#[tokio::test]
async fn ipc_outage_is_recorded_and_recovers_without_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sync.sock");
    let store = Arc::new(DataStore::with_default_schema());
    store
        .register(Registration::new("deviceA.tag1"))
        .expect("register");

    let mut client_config = IpcClientConfig::new(&path);
    client_config.timeout = Duration::from_millis(500);
    let client = Arc::new(IpcClient::new(client_config));
    let mut runner = SyncRunner::new(sample_upstream(), client, SyncConfig::default());

    let report = runner.run_cycle().await;
    assert_eq!(report.failed, 1);
    assert!(report.endpoint_down());
    let stats = runner.stats();
    assert_eq!(stats.failed_writes, 1);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].key, "deviceA.tag1");

    let (trigger, shutdown) = shutdown_channel();
    let server = IpcServer::new(store.clone(), IpcServerConfig::new(&path));
    let listener = server.bind().await.expect("bind");
    let handle = tokio::spawn(server.serve(listener, shutdown));

    let report = runner.run_cycle().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.read("deviceA.tag1"), Value::Float(12.5));
    let stats = runner.stats();
    assert_eq!(stats.successful_writes, 1);
    assert_eq!(stats.failed_writes, 1);
    assert_eq!(stats.total_cycles, 2);

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test(start_paused = true)]
async fn run_loop_backs_off_and_stops_on_shutdown() {
    let config = SyncConfig {
        interval: Duration::from_secs(1),
        max_backoff: Duration::from_secs(4),
    };
    let runner = SyncRunner::new(sample_upstream(), Arc::new(DownWriter), config);
    let stats = runner.stats_handle();
    let state = runner.watch_state();
    let (trigger, shutdown) = shutdown_channel();
    let handle = tokio::spawn(runner.run(shutdown));

    // 间隔 1s，退避依次为 1s、2s、4s、4s：约 20s 内完成 5 个周期
    tokio::time::sleep(Duration::from_secs(20)).await;
    let cycles = stats.lock().expect("lock").total_cycles;
    assert!((4..=6).contains(&cycles), "cycles = {cycles}");
    assert_eq!(*state.borrow(), SyncState::Sleeping);

    trigger.trigger();
    let final_stats = handle.await.expect("join");
    assert_eq!(final_stats.failed_writes, final_stats.total_cycles);
    assert_eq!(*state.borrow(), SyncState::Terminated);
}

#[tokio::test]
async fn backoff_is_bounded() {
    let config = SyncConfig {
        interval: Duration::from_millis(100),
        max_backoff: Duration::from_millis(350),
    };
    let mut runner = SyncRunner::new(sample_upstream(), Arc::new(DownWriter), config);
    assert_eq!(runner.backoff(), Duration::ZERO);
    assert_eq!(runner.state(), SyncState::Idle);

    let report = runner.run_cycle().await;
    assert!(report.endpoint_down());
    assert_eq!(runner.backoff(), Duration::from_millis(100));
    runner.run_cycle().await;
    assert_eq!(runner.backoff(), Duration::from_millis(200));
    runner.run_cycle().await;
    assert_eq!(runner.backoff(), Duration::from_millis(350));
    runner.run_cycle().await;
    assert_eq!(runner.backoff(), Duration::from_millis(350));
}

#[tokio::test]
async fn http_upstream_parses_polled_values() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let body = json!({"plc1": {"t1": {"value": 3, "status": "SUCCESS", "tag_name": "speed"}}})
        .to_string();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut request = vec![0u8; 1024];
            let _ = stream.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });

    let upstream = HttpUpstream::new(
        &format!("http://{addr}/deploy/api/io/polled-values"),
        Duration::from_secs(5),
    )
    .expect("upstream");
    let polled = upstream.poll().await.expect("poll");
    let tag = &polled["plc1"]["t1"];
    assert!(tag.is_valid());
    assert_eq!(tag.display_name("t1"), "speed");
}

#[tokio::test]
async fn http_upstream_reports_unreachable_source() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let upstream =
        HttpUpstream::new(&format!("http://{addr}/values"), Duration::from_secs(1)).expect("url");
    assert!(matches!(upstream.poll().await, Err(SyncError::Upstream(_))));
}
