//! 转发器编排：采样任务 + 事件循环 + 发布循环。

use crate::publisher::{MqttPublisher, drain, qos_from_u8};
use crate::queue::SnapshotQueue;
use crate::sampler::run_sampler;
use domain::Shutdown;
use ds_config::MqttConfig;
use ds_store::DataStore;
use rumqttc::MqttOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// 连接可用时的补发轮询间隔上限。
const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain: bool,
    pub publish_interval: Duration,
    pub max_queue: usize,
}

impl ForwarderConfig {
    /// 快照主题：`{prefix}/snapshot`。
    pub fn topic(&self) -> String {
        let prefix = self.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            "snapshot".to_string()
        } else {
            format!("{prefix}/snapshot")
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            let password = self.password.clone().unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }
        options
    }
}

impl From<&MqttConfig> for ForwarderConfig {
    fn from(config: &MqttConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            topic_prefix: config.topic_prefix.clone(),
            qos: config.qos,
            retain: config.retain,
            publish_interval: config.publish_interval,
            max_queue: config.max_queue,
        }
    }
}

pub struct MqttForwarder {
    store: Arc<DataStore>,
    config: ForwarderConfig,
    queue: Arc<SnapshotQueue>,
}

impl MqttForwarder {
    pub fn new(store: Arc<DataStore>, config: ForwarderConfig) -> Self {
        let queue = Arc::new(SnapshotQueue::new(config.max_queue));
        Self {
            store,
            config,
            queue,
        }
    }

    pub fn queue(&self) -> Arc<SnapshotQueue> {
        self.queue.clone()
    }

    /// 运行到关停信号到达。连接失败不会终止转发器。
    pub async fn run(self, shutdown: Shutdown) {
        let topic = self.config.topic();
        let (publisher, eventloop) = MqttPublisher::new(
            self.config.mqtt_options(),
            topic.clone(),
            qos_from_u8(self.config.qos),
            self.config.retain,
        );
        info!(
            target: "ds.mqtt",
            host = %self.config.host,
            port = self.config.port,
            topic = %topic,
            max_queue = self.config.max_queue,
            "mqtt forwarder starting"
        );

        let sampler = tokio::spawn(run_sampler(
            self.store.clone(),
            self.queue.clone(),
            self.config.publish_interval,
            shutdown.clone(),
        ));
        let driver = {
            let publisher = publisher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.drive(eventloop, shutdown).await })
        };

        let mut ticker = tokio::time::interval(self.config.publish_interval.min(DRAIN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    drain(&self.queue, &publisher);
                }
            }
        }

        publisher.disconnect().await;
        if let Err(err) = sampler.await {
            warn!(target: "ds.mqtt", error = %err, "sampler task failed");
        }
        if let Err(err) = driver.await {
            warn!(target: "ds.mqtt", error = %err, "event loop task failed");
        }
        info!(
            target: "ds.mqtt",
            pending = self.queue.len(),
            dropped = self.queue.dropped(),
            "mqtt forwarder stopped"
        );
    }
}
