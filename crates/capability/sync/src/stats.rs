//! 同步统计
//!
//! 进程重启前只增不减；错误记录保留最近 100 条，超出时淘汰最旧的一条。

use domain::{Shutdown, now_epoch_ms};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// 错误记录上限。
pub const MAX_ERROR_RECORDS: usize = 100;

/// 单条错误记录。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorRecord {
    pub timestamp_ms: i64,
    pub key: String,
    pub error: String,
}

/// 同步统计。
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub total_cycles: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub last_sync_ms: Option<i64>,
    pub errors: VecDeque<SyncErrorRecord>,
}

impl SyncStats {
    pub fn record_success(&mut self) {
        self.successful_writes += 1;
    }

    /// 记录一次失败写入。
    pub fn record_failure(&mut self, key: impl Into<String>, error: impl Into<String>) {
        self.failed_writes += 1;
        self.push_error(key, error);
    }

    /// 记录与具体写入无关的错误（如上游轮询失败），不计入失败写入数。
    pub fn push_error(&mut self, key: impl Into<String>, error: impl Into<String>) {
        if self.errors.len() >= MAX_ERROR_RECORDS {
            self.errors.pop_front();
        }
        self.errors.push_back(SyncErrorRecord {
            timestamp_ms: now_epoch_ms(),
            key: key.into(),
            error: error.into(),
        });
    }

    pub fn finish_cycle(&mut self) {
        self.total_cycles += 1;
        self.last_sync_ms = Some(now_epoch_ms());
    }

    /// 最近 `count` 条错误（新的在后）。
    pub fn recent_errors(&self, count: usize) -> Vec<SyncErrorRecord> {
        let skip = self.errors.len().saturating_sub(count);
        self.errors.iter().skip(skip).cloned().collect()
    }

    /// 输出一条汇总日志。
    pub fn log_summary(&self, label: &str) {
        let recent: Vec<String> = self
            .recent_errors(5)
            .into_iter()
            .map(|record| format!("{}: {}", record.key, record.error))
            .collect();
        info!(
            target: "ds.sync",
            total_cycles = self.total_cycles,
            successful_writes = self.successful_writes,
            failed_writes = self.failed_writes,
            last_sync_ms = self.last_sync_ms.unwrap_or(0),
            recent_errors = ?recent,
            "{label}"
        );
    }
}

/// 启动统计汇报任务：按固定间隔输出统计日志，不阻塞同步循环。
pub fn spawn_stats_reporter(
    stats: Arc<Mutex<SyncStats>>,
    interval: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let snapshot = stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    snapshot.log_summary("sync statistics");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_keeps_latest_hundred() {
        let mut stats = SyncStats::default();
        for index in 0..150 {
            stats.record_failure(format!("key{index}"), "down");
        }
        assert_eq!(stats.failed_writes, 150);
        assert_eq!(stats.errors.len(), MAX_ERROR_RECORDS);
        assert_eq!(stats.errors.front().map(|r| r.key.as_str()), Some("key50"));
        assert_eq!(stats.errors.back().map(|r| r.key.as_str()), Some("key149"));
    }

    #[test]
    fn recent_errors_returns_tail() {
        let mut stats = SyncStats::default();
        stats.push_error("upstream", "timeout");
        stats.record_failure("a.b", "rejected");
        let recent = stats.recent_errors(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].key, "a.b");
        assert_eq!(stats.failed_writes, 1);
        assert_eq!(stats.recent_errors(1)[0].key, "a.b");
    }
}
