//! 同步循环
//!
//! 状态流转：`Idle → Polling → Filtering → Writing → Sleeping → Polling …`，
//! 任意状态收到关停信号后进入 `Stopping → Terminated`。
//!
//! 写入失败只记录不退出；若一个周期内所有写入都因端点不可达而失败，
//! 下一次休眠额外叠加有上限的指数退避，任一写入成功后退避清零。

use crate::stats::SyncStats;
use crate::upstream::{UpstreamSource, collect_updates, json_to_value};
use async_trait::async_trait;
use domain::{Shutdown, Value};
use ds_ipc::{IpcClient, IpcError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 同步写入端接口。
#[async_trait]
pub trait SyncWriter: Send + Sync {
    async fn write(&self, key: &str, value: Value) -> Result<(), IpcError>;
}

#[async_trait]
impl SyncWriter for IpcClient {
    async fn write(&self, key: &str, value: Value) -> Result<(), IpcError> {
        IpcClient::write(self, key, value).await.map(|_| ())
    }
}

/// 同步循环状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Polling,
    Filtering,
    Writing,
    Sleeping,
    Stopping,
    Terminated,
}

/// 同步循环配置。
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// 单个周期的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub connection_failures: usize,
    pub upstream_failed: bool,
}

impl CycleReport {
    /// 本周期有写入且全部因端点不可达失败。
    pub fn endpoint_down(&self) -> bool {
        self.attempted > 0 && self.connection_failures == self.attempted
    }
}

/// 同步循环。
pub struct SyncRunner {
    upstream: Arc<dyn UpstreamSource>,
    writer: Arc<dyn SyncWriter>,
    config: SyncConfig,
    stats: Arc<Mutex<SyncStats>>,
    state: watch::Sender<SyncState>,
    outage_cycles: u32,
}

impl SyncRunner {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        writer: Arc<dyn SyncWriter>,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            upstream,
            writer,
            config,
            stats: Arc::new(Mutex::new(SyncStats::default())),
            state,
            outage_cycles: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// 订阅状态变化。
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// 共享统计句柄（供汇报任务使用）。
    pub fn stats_handle(&self) -> Arc<Mutex<SyncStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, SyncStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// 当前退避时长（不含基础间隔）。
    pub fn backoff(&self) -> Duration {
        if self.outage_cycles == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (self.outage_cycles - 1).min(16);
        self.config
            .interval
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    /// 执行一个完整周期：轮询、过滤、转换、逐条写入、记录统计并更新退避。
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        self.set_state(SyncState::Polling);
        let polled = match self.upstream.poll().await {
            Ok(polled) => polled,
            Err(err) => {
                warn!(target: "ds.sync", error = %err, "upstream poll failed");
                let mut stats = self.lock_stats();
                stats.push_error("upstream", err.to_string());
                stats.finish_cycle();
                report.upstream_failed = true;
                return report;
            }
        };

        self.set_state(SyncState::Filtering);
        let updates = collect_updates(&polled);
        if updates.is_empty() {
            debug!(target: "ds.sync", "no valid polled values");
        }

        self.set_state(SyncState::Writing);
        for (key, raw) in updates {
            report.attempted += 1;
            let Some(value) = json_to_value(&raw) else {
                report.failed += 1;
                self.lock_stats()
                    .record_failure(&key, format!("non-numeric value: {raw}"));
                continue;
            };
            match self.writer.write(&key, value).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.lock_stats().record_success();
                }
                Err(err) => {
                    report.failed += 1;
                    if err.is_connection_error() {
                        report.connection_failures += 1;
                    }
                    warn!(target: "ds.sync", key = %key, error = %err, "ipc write failed");
                    self.lock_stats().record_failure(&key, err.to_string());
                }
            }
        }

        self.lock_stats().finish_cycle();
        self.update_backoff(&report);
        if report.attempted > 0 {
            debug!(
                target: "ds.sync",
                succeeded = report.succeeded,
                failed = report.failed,
                "sync cycle finished"
            );
        }
        report
    }

    fn update_backoff(&mut self, report: &CycleReport) {
        if report.endpoint_down() {
            self.outage_cycles = self.outage_cycles.saturating_add(1);
            warn!(
                target: "ds.sync",
                consecutive = self.outage_cycles,
                backoff_ms = self.backoff().as_millis() as u64,
                "ipc endpoint unreachable, backing off"
            );
        } else if report.succeeded > 0 {
            if self.outage_cycles > 0 {
                info!(target: "ds.sync", "ipc endpoint recovered");
            }
            self.outage_cycles = 0;
        }
    }

    /// 运行同步循环直到收到关停信号，返回最终统计。
    pub async fn run(mut self, shutdown: Shutdown) -> SyncStats {
        info!(
            target: "ds.sync",
            interval_ms = self.config.interval.as_millis() as u64,
            "sync runner started"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let started = Instant::now();
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = self.run_cycle() => {}
            };

            let pause = self.config.interval.saturating_sub(started.elapsed()) + self.backoff();
            self.set_state(SyncState::Sleeping);
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.set_state(SyncState::Stopping);
        let stats = self.stats();
        stats.log_summary("sync runner stopped");
        self.set_state(SyncState::Terminated);
        stats
    }
}
