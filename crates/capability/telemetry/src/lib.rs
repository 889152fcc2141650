//! 追踪初始化、请求 ID 生成与网关计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ipc_connections: u64,
    pub ipc_requests: u64,
    pub ipc_failures: u64,
    pub protocol_writes: u64,
    pub protocol_rejections: u64,
    pub http_writes: u64,
    pub mqtt_published: u64,
    pub mqtt_publish_failures: u64,
    pub mqtt_dropped: u64,
    pub worker_failures: u64,
}

/// 网关计数指标（进程内全局，仅增不减）。
pub struct TelemetryMetrics {
    ipc_connections: AtomicU64,
    ipc_requests: AtomicU64,
    ipc_failures: AtomicU64,
    protocol_writes: AtomicU64,
    protocol_rejections: AtomicU64,
    http_writes: AtomicU64,
    mqtt_published: AtomicU64,
    mqtt_publish_failures: AtomicU64,
    mqtt_dropped: AtomicU64,
    worker_failures: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            ipc_connections: AtomicU64::new(0),
            ipc_requests: AtomicU64::new(0),
            ipc_failures: AtomicU64::new(0),
            protocol_writes: AtomicU64::new(0),
            protocol_rejections: AtomicU64::new(0),
            http_writes: AtomicU64::new(0),
            mqtt_published: AtomicU64::new(0),
            mqtt_publish_failures: AtomicU64::new(0),
            mqtt_dropped: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ipc_connections: self.ipc_connections.load(Ordering::Relaxed),
            ipc_requests: self.ipc_requests.load(Ordering::Relaxed),
            ipc_failures: self.ipc_failures.load(Ordering::Relaxed),
            protocol_writes: self.protocol_writes.load(Ordering::Relaxed),
            protocol_rejections: self.protocol_rejections.load(Ordering::Relaxed),
            http_writes: self.http_writes.load(Ordering::Relaxed),
            mqtt_published: self.mqtt_published.load(Ordering::Relaxed),
            mqtt_publish_failures: self.mqtt_publish_failures.load(Ordering::Relaxed),
            mqtt_dropped: self.mqtt_dropped.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info，可由 RUST_LOG 覆盖）。
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// 初始化 tracing，未设置 RUST_LOG 时使用给定的默认过滤规则。
pub fn init_tracing_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 记录 IPC 新连接。
pub fn record_ipc_connection() {
    metrics().ipc_connections.fetch_add(1, Ordering::Relaxed);
}

/// 记录 IPC 请求处理结果。
pub fn record_ipc_request(ok: bool) {
    let metrics = metrics();
    metrics.ipc_requests.fetch_add(1, Ordering::Relaxed);
    if !ok {
        metrics.ipc_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// 记录协议客户端写入成功。
pub fn record_protocol_write() {
    metrics().protocol_writes.fetch_add(1, Ordering::Relaxed);
}

/// 记录协议客户端写入被拒绝。
pub fn record_protocol_rejection() {
    metrics()
        .protocol_rejections
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录 HTTP 写入次数。
pub fn record_http_write() {
    metrics().http_writes.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 快照发布成功。
pub fn record_mqtt_published() {
    metrics().mqtt_published.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 快照发布失败（已重新入队）。
pub fn record_mqtt_publish_failure() {
    metrics()
        .mqtt_publish_failures
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录队列满时丢弃的快照数。
pub fn record_mqtt_dropped(count: u64) {
    metrics().mqtt_dropped.fetch_add(count, Ordering::Relaxed);
}

/// 记录后台任务异常退出。
pub fn record_worker_failure() {
    metrics().worker_failures.fetch_add(1, Ordering::Relaxed);
}
