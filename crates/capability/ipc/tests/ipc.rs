use domain::{Shutdown, Value, shutdown_channel};
use ds_ipc::{IpcClient, IpcClientConfig, IpcError, IpcServer, IpcServerConfig, WriteItem};
use ds_store::DataStore;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

async fn start_server(
    store: Arc<DataStore>,
    path: &Path,
    shutdown: Shutdown,
) -> JoinHandle<Result<(), IpcError>> {
    let server = IpcServer::new(store, IpcServerConfig::new(path));
    let listener = server.bind().await.expect("bind");
    tokio::spawn(server.serve(listener, shutdown))
}

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("gateway.sock")
}

#[tokio::test]
async fn client_write_reaches_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());
    let (trigger, shutdown) = shutdown_channel();
    let handle = start_server(store.clone(), &path, shutdown).await;

    let client = IpcClient::new(IpcClientConfig::new(&path));
    let ack = client
        .write("temperature", Value::Float(28.7))
        .await
        .expect("write");
    assert_eq!(ack.key, "temperature");
    assert_eq!(ack.value, Value::Float(28.7));
    assert!(!ack.adjusted);
    assert_eq!(store.read("temperature"), Value::Float(28.7));

    let ack = client.write_address(3, Value::Bool(true)).await.expect("by address");
    assert_eq!(ack.key, "status");
    assert_eq!(store.read("status"), Value::Int(1));

    // 应用层拒绝不影响后续请求
    let err = client
        .write("unknown", Value::Float(1.0))
        .await
        .expect_err("rejected");
    assert!(matches!(err, IpcError::Rejected(_)));
    assert!(!err.is_connection_error());
    client
        .write("humidity", Value::Float(f64::NAN))
        .await
        .map(|ack| assert!(ack.adjusted))
        .expect("write after rejection");

    let results = client
        .bulk_write(vec![
            WriteItem::key("pressure", Value::Float(1.2)),
            WriteItem::key("nope", Value::Float(1.0)),
        ])
        .await
        .expect("bulk");
    assert!(results[0].ok);
    assert!(!results[1].ok);

    trigger.trigger();
    handle.await.expect("join").expect("server");
    assert!(!path.exists());
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());
    let (trigger, shutdown) = shutdown_channel();
    let handle = start_server(store.clone(), &path, shutdown).await;

    let client = IpcClient::new(IpcClientConfig::new(&path));
    client
        .write("temperature", Value::Float(1.0))
        .await
        .expect("first");

    let stream = UnixStream::connect(&path).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half.write_all(b"this is not json\n").await.expect("send");
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("response");
    let response: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(response["ok"], serde_json::json!(false));
    line.clear();
    let read = reader.read_line(&mut line).await.expect("eof");
    assert_eq!(read, 0);

    client
        .write("temperature", Value::Float(2.0))
        .await
        .expect("other connection unaffected");
    assert_eq!(store.read("temperature"), Value::Float(2.0));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());
    let (trigger, shutdown) = shutdown_channel();
    let handle = start_server(store.clone(), &path, shutdown).await;

    let stream = UnixStream::connect(&path).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half
        .write_all(
            concat!(
                "{\"action\":\"write\",\"key\":\"temperature\",\"value\":10.5}\n",
                "{\"action\":\"write\",\"key\":\"missing\",\"value\":1}\n",
                "{\"action\":\"write\",\"address\":3,\"value\":4}\n",
            )
            .as_bytes(),
        )
        .await
        .expect("send");

    let mut oks = Vec::new();
    for _ in 0..3 {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("line");
        let response: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
        oks.push(response["ok"].as_bool().unwrap_or(false));
    }
    assert_eq!(oks, [true, false, true]);
    assert_eq!(store.read("status"), Value::Int(4));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());
    let (trigger, shutdown) = shutdown_channel();
    let mut config = IpcServerConfig::new(&path);
    config.max_frame_bytes = 64;
    let server = IpcServer::new(store, config);
    let listener = server.bind().await.expect("bind");
    let handle = tokio::spawn(server.serve(listener, shutdown));

    let stream = UnixStream::connect(&path).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let long_key = "k".repeat(200);
    let frame = format!("{{\"action\":\"write\",\"key\":\"{long_key}\",\"value\":1}}\n");
    write_half.write_all(frame.as_bytes()).await.expect("send");

    let mut line = String::new();
    reader.read_line(&mut line).await.expect("response");
    assert!(line.contains("exceeds"));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn bind_replaces_stale_file_and_restricts_permissions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    std::fs::write(&path, b"stale").expect("stale file");

    let store = Arc::new(DataStore::with_default_schema());
    let server = IpcServer::new(store.clone(), IpcServerConfig::new(&path));
    let listener = server.bind().await.expect("bind over stale file");
    let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let (trigger, shutdown) = shutdown_channel();
    let handle = tokio::spawn(server.serve(listener, shutdown));

    let second = IpcServer::new(store, IpcServerConfig::new(&path));
    assert!(matches!(second.bind().await, Err(IpcError::AddressInUse(_))));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn client_recovers_after_server_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());

    let mut config = IpcClientConfig::new(&path);
    config.timeout = Duration::from_millis(500);
    let client = IpcClient::new(config);

    let err = client
        .write("temperature", Value::Float(1.0))
        .await
        .expect_err("server down");
    assert!(matches!(err, IpcError::Connect { .. }));
    assert!(err.is_connection_error());

    let (trigger, shutdown) = shutdown_channel();
    let handle = start_server(store.clone(), &path, shutdown).await;
    client
        .write("temperature", Value::Float(3.5))
        .await
        .expect("after recovery");
    assert_eq!(store.read("temperature"), Value::Float(3.5));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn non_finite_writes_are_stored_as_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let store = Arc::new(DataStore::with_default_schema());
    store.write("humidity", Value::Float(55.0)).expect("seed");
    let (trigger, shutdown) = shutdown_channel();
    let handle = start_server(store.clone(), &path, shutdown).await;

    let client = IpcClient::new(IpcClientConfig::new(&path));
    let before = store.statistics().adjusted_writes;
    let ack = client
        .write("humidity", Value::Float(f64::NAN))
        .await
        .expect("nan write");
    assert!(ack.adjusted);
    assert_eq!(ack.value, Value::Float(0.0));
    assert_eq!(store.read("humidity"), Value::Float(0.0));

    client
        .write_address(2, Value::Float(f64::NEG_INFINITY))
        .await
        .expect("inf write");
    assert_eq!(store.read("pressure"), Value::Float(0.0));
    assert_eq!(store.statistics().adjusted_writes, before + 2);

    // 同一连接继续可用
    client
        .write("humidity", Value::Float(41.5))
        .await
        .expect("follow-up write");
    assert_eq!(store.read("humidity"), Value::Float(41.5));

    trigger.trigger();
    handle.await.expect("join").expect("server");
}

#[tokio::test]
async fn client_reconnects_after_server_closes_on_frame_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let listener = tokio::net::UnixListener::bind(&path).expect("bind");

    // 第一个连接：返回帧级错误后关闭；第二个连接：正常应答。
    let fake = tokio::spawn(async move {
        let replies = [
            "{\"ok\":false,\"error\":\"malformed request\",\"closing\":true}\n",
            "{\"ok\":true,\"key\":\"temperature\",\"value\":5.0,\"adjusted\":false}\n",
        ];
        for reply in replies {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("request");
            write_half.write_all(reply.as_bytes()).await.expect("reply");
        }
    });

    let client = IpcClient::new(IpcClientConfig::new(&path));
    let err = client
        .write("temperature", Value::Float(5.0))
        .await
        .expect_err("frame error");
    assert!(matches!(err, IpcError::Protocol(_)));

    let ack = client
        .write("temperature", Value::Float(5.0))
        .await
        .expect("fresh connection");
    assert_eq!(ack.value, Value::Float(5.0));
    fake.await.expect("fake server");
}
