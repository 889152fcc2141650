//! 网关运行配置加载。
//!
//! 所有配置均来自 `DS_*` 环境变量（可由 `.env` 提供），未设置时使用默认值。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 默认 IPC Socket 路径（网关与同步进程共用）。
pub const DEFAULT_IPC_SOCKET_PATH: &str = "/tmp/dataservice.sock";

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_addr: String,
    /// 协议服务监听地址。
    pub bind_host: String,
    pub shutdown_grace_secs: u64,
    pub ipc_socket_path: String,
    pub ipc_auto_register: bool,
    pub modbus_enabled: bool,
    pub modbus_port: u16,
    pub opcua_enabled: bool,
    pub opcua_port: u16,
    pub opcua_namespace_uri: String,
    pub opcua_refresh_ms: u64,
    pub iec104_enabled: bool,
    pub iec104_port: u16,
    pub iec104_common_address: u16,
    pub iec104_ioa_base: u32,
    pub iec104_publish_interval_ms: u64,
    pub snmp_enabled: bool,
    pub snmp_port: u16,
    pub snmp_community: String,
    pub snmp_base_oid: String,
    pub mqtt: MqttConfig,
}

/// MQTT 快照转发配置。
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
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

impl GatewayConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_addr = env::var("DS_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_host = env::var("DS_BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let shutdown_grace_secs = read_u64_with_default("DS_SHUTDOWN_GRACE_SECS", 5)?;
        let ipc_socket_path = read_optional("DS_IPC_SOCKET_PATH")
            .unwrap_or_else(|| DEFAULT_IPC_SOCKET_PATH.to_string());
        let ipc_auto_register = read_bool_with_default("DS_IPC_AUTO_REGISTER", false);

        let modbus_enabled = read_bool_with_default("DS_MODBUS_ENABLED", true);
        let modbus_port = read_u16_with_default("DS_MODBUS_PORT", 502)?;

        let opcua_enabled = read_bool_with_default("DS_OPCUA_ENABLED", true);
        let opcua_port = read_u16_with_default("DS_OPCUA_PORT", 4840)?;
        let opcua_namespace_uri = env::var("DS_OPCUA_NAMESPACE_URI")
            .unwrap_or_else(|_| "http://dataservice.gateway.io".to_string());
        let opcua_refresh_ms = read_u64_with_default("DS_OPCUA_REFRESH_MS", 1000)?;

        let iec104_enabled = read_bool_with_default("DS_IEC104_ENABLED", true);
        let iec104_port = read_u16_with_default("DS_IEC104_PORT", 2404)?;
        let iec104_common_address = read_u16_with_default("DS_IEC104_COMMON_ADDRESS", 1)?;
        let iec104_ioa_base = read_u32_with_default("DS_IEC104_IOA_BASE", 1)?;
        let iec104_publish_interval_ms =
            read_u64_with_default("DS_IEC104_PUBLISH_INTERVAL_MS", 1000)?;

        let snmp_enabled = read_bool_with_default("DS_SNMP_ENABLED", true);
        let snmp_port = read_u16_with_default("DS_SNMP_PORT", 161)?;
        let snmp_community =
            env::var("DS_SNMP_COMMUNITY").unwrap_or_else(|_| "public".to_string());
        let snmp_base_oid =
            env::var("DS_SNMP_BASE_OID").unwrap_or_else(|_| "1.3.6.1.4.1.53864.1".to_string());

        let mqtt = MqttConfig::from_env()?;

        if opcua_refresh_ms == 0 {
            return Err(ConfigError::Invalid("DS_OPCUA_REFRESH_MS".to_string(), "0".to_string()));
        }
        if iec104_publish_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "DS_IEC104_PUBLISH_INTERVAL_MS".to_string(),
                "0".to_string(),
            ));
        }

        Ok(Self {
            http_addr,
            bind_host,
            shutdown_grace_secs,
            ipc_socket_path,
            ipc_auto_register,
            modbus_enabled,
            modbus_port,
            opcua_enabled,
            opcua_port,
            opcua_namespace_uri,
            opcua_refresh_ms,
            iec104_enabled,
            iec104_port,
            iec104_common_address,
            iec104_ioa_base,
            iec104_publish_interval_ms,
            snmp_enabled,
            snmp_port,
            snmp_community,
            snmp_base_oid,
            mqtt,
        })
    }

    /// 协议服务监听地址，如 `0.0.0.0:502`。
    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host, port)
    }
}

impl MqttConfig {
    /// 从环境变量读取 MQTT 配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = read_bool_with_default("DS_MQTT_ENABLED", false);
        let host = env::var("DS_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = read_u16_with_default("DS_MQTT_PORT", 1883)?;
        let client_id =
            env::var("DS_MQTT_CLIENT_ID").unwrap_or_else(|_| "dataservice-gateway".to_string());
        let username = read_optional("DS_MQTT_USERNAME");
        let password = read_optional("DS_MQTT_PASSWORD");
        let topic_prefix = env::var("DS_MQTT_TOPIC_PREFIX")
            .map(|prefix| prefix.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| "dataservice".to_string());
        let qos = read_u8_with_default("DS_MQTT_QOS", 1)?;
        if qos > 2 {
            return Err(ConfigError::Invalid("DS_MQTT_QOS".to_string(), qos.to_string()));
        }
        let retain = read_bool_with_default("DS_MQTT_RETAIN", false);
        let publish_interval =
            read_secs_with_default("DS_MQTT_PUBLISH_INTERVAL_SECS", Duration::from_secs(1))?;
        let max_queue = read_u64_with_default("DS_MQTT_MAX_QUEUE", 1000)?.max(1) as usize;

        Ok(Self {
            enabled,
            host,
            port,
            client_id,
            username,
            password,
            topic_prefix,
            qos,
            retain,
            publish_interval,
            max_queue,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

/// 秒数（可带小数），必须为正且可表示为 `Duration`。
fn read_secs_with_default(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|interval| !interval.is_zero())
        .ok_or_else(|| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
