//! 后台服务编排
//!
//! 每个协议服务、IPC、MQTT 与 HTTP 各占一个任务。单个服务失败只记录日志与计数，
//! 不影响其他服务；关停时在宽限期内等待全部退出，超时后中止剩余任务。

use ds_telemetry::record_worker_failure;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

#[derive(Default)]
pub struct Workers {
    tasks: JoinSet<()>,
    names: Vec<&'static str>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, E>(&mut self, name: &'static str, worker: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.names.push(name);
        self.tasks.spawn(async move {
            info!(target: "ds.gateway", worker = name, "worker started");
            match worker.await {
                Ok(()) => info!(target: "ds.gateway", worker = name, "worker stopped"),
                Err(err) => {
                    record_worker_failure();
                    error!(target: "ds.gateway", worker = name, error = %err, "worker failed");
                }
            }
        });
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// 仍在运行的任务数。先回收已结束的任务。
    pub fn running(&mut self) -> usize {
        while let Some(joined) = self.tasks.try_join_next() {
            log_join_error(joined);
        }
        self.tasks.len()
    }

    /// 在宽限期内等待全部任务退出，超时后中止剩余任务。返回被中止的任务数。
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                log_join_error(joined);
            }
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let remaining = self.tasks.len();
        warn!(
            target: "ds.gateway",
            remaining,
            grace_secs = grace.as_secs_f64(),
            "grace period elapsed, aborting workers"
        );
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        remaining
    }
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            record_worker_failure();
            error!(target: "ds.gateway", error = %err, "worker panicked");
        }
    }
}
