//! 独立同步进程：轮询上游现场值并通过 IPC 写入网关。
//!
//! ```bash
//! ds-sync-runner --socket-path /tmp/dataservice.sock --interval 1.0
//! ```

use clap::Parser;
use domain::{shutdown_channel, termination_signal};
use ds_config::DEFAULT_IPC_SOCKET_PATH;
use ds_ipc::{IpcClient, IpcClientConfig};
use ds_sync::{HttpUpstream, SyncConfig, SyncError, SyncRunner, spawn_stats_reporter};
use ds_telemetry::init_tracing_with_default;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 上游请求超时。
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// DataService 同步进程
#[derive(Parser, Debug)]
#[command(name = "ds-sync-runner")]
#[command(version, about, long_about = None)]
struct Args {
    /// 网关 IPC Socket 路径
    #[arg(long, env = "DS_IPC_SOCKET_PATH", default_value = DEFAULT_IPC_SOCKET_PATH)]
    socket_path: PathBuf,

    /// 上游轮询值接口
    #[arg(
        long,
        env = "DS_SYNC_UPSTREAM_URL",
        default_value = "http://localhost:8000/deploy/api/io/polled-values"
    )]
    upstream_url: String,

    /// 同步间隔（秒）
    #[arg(long, env = "DS_SYNC_INTERVAL_SECS", default_value_t = 1.0)]
    interval: f64,

    /// 统计日志间隔（秒）
    #[arg(long, env = "DS_SYNC_STATS_INTERVAL_SECS", default_value_t = 300)]
    stats_interval: u64,

    /// 单次 IPC 调用超时（毫秒）
    #[arg(long, env = "DS_SYNC_IPC_TIMEOUT_MS", default_value_t = 2000)]
    ipc_timeout_ms: u64,

    /// 端点不可达时的最大退避（秒）
    #[arg(long, env = "DS_SYNC_MAX_BACKOFF_SECS", default_value_t = 30)]
    max_backoff_secs: u64,

    /// 仅输出警告及以上日志
    #[arg(long)]
    quiet: bool,
}

impl Args {
    /// 同步间隔；非正、非有限或超出 `Duration` 表示范围时报错。
    fn interval(&self) -> Result<Duration, SyncError> {
        Duration::try_from_secs_f64(self.interval)
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!(
                    "interval must be a positive number of seconds, got {}",
                    self.interval
                ))
            })
    }

    fn validate(&self) -> Result<(), SyncError> {
        self.interval()?;
        if self.stats_interval == 0 {
            return Err(SyncError::InvalidConfig(
                "stats interval must be positive".to_string(),
            ));
        }
        if self.ipc_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "ipc timeout must be positive".to_string(),
            ));
        }
        let parent = self
            .socket_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            if !dir.is_dir() {
                return Err(SyncError::InvalidConfig(format!(
                    "socket directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing_with_default(if args.quiet { "warn" } else { "info" });

    let interval = match args.validate().and_then(|()| args.interval()) {
        Ok(interval) => interval,
        Err(err) => {
            error!(target: "ds.sync", error = %err, "refusing to start");
            return Err(err.into());
        }
    };

    let upstream = Arc::new(HttpUpstream::new(&args.upstream_url, UPSTREAM_TIMEOUT)?);
    let mut ipc_config = IpcClientConfig::new(&args.socket_path);
    ipc_config.timeout = Duration::from_millis(args.ipc_timeout_ms);
    let client = Arc::new(IpcClient::new(ipc_config));

    let config = SyncConfig {
        interval,
        max_backoff: Duration::from_secs(args.max_backoff_secs),
    };
    info!(
        target: "ds.sync",
        upstream = %upstream.url(),
        socket = %args.socket_path.display(),
        interval_secs = args.interval,
        "starting sync runner"
    );

    let runner = SyncRunner::new(upstream, client, config);
    let (trigger, shutdown) = shutdown_channel();
    let reporter = spawn_stats_reporter(
        runner.stats_handle(),
        Duration::from_secs(args.stats_interval),
        shutdown.clone(),
    );
    let sync = tokio::spawn(runner.run(shutdown));

    termination_signal().await;
    info!(target: "ds.sync", "termination signal received, stopping");
    trigger.trigger();

    let stats = sync.await?;
    if let Err(err) = reporter.await {
        warn!(target: "ds.sync", error = %err, "stats reporter task failed");
    }
    info!(
        target: "ds.sync",
        total_cycles = stats.total_cycles,
        successful_writes = stats.successful_writes,
        failed_writes = stats.failed_writes,
        "sync runner exited"
    );
    Ok(())
}
