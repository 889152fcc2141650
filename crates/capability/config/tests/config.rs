use ds_config::{ConfigError, DEFAULT_IPC_SOCKET_PATH, GatewayConfig};
use std::time::Duration;

// 环境变量为进程级状态，全部断言放在同一个测试里顺序执行。
#[test]
fn load_config_from_env() {
    let config = GatewayConfig::from_env().expect("defaults");
    assert_eq!(config.http_addr, "0.0.0.0:8080");
    assert_eq!(config.ipc_socket_path, DEFAULT_IPC_SOCKET_PATH);
    assert_eq!(config.modbus_port, 502);
    assert_eq!(config.opcua_port, 4840);
    assert_eq!(config.iec104_port, 2404);
    assert_eq!(config.snmp_port, 161);
    assert_eq!(config.snmp_community, "public");
    assert!(!config.mqtt.enabled);
    assert_eq!(config.mqtt.topic_prefix, "dataservice");
    assert_eq!(config.mqtt.qos, 1);
    assert_eq!(config.mqtt.max_queue, 1000);
    assert_eq!(config.bind_addr(config.modbus_port), "0.0.0.0:502");

    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("DS_HTTP_ADDR", "127.0.0.1:8081");
        std::env::set_var("DS_MODBUS_PORT", "5020");
        std::env::set_var("DS_SNMP_ENABLED", "false");
        std::env::set_var("DS_MQTT_ENABLED", "on");
        std::env::set_var("DS_MQTT_TOPIC_PREFIX", "plant/line1/");
        std::env::set_var("DS_MQTT_PUBLISH_INTERVAL_SECS", "0.5");
        std::env::set_var("DS_IPC_SOCKET_PATH", "/run/ds/ipc.sock");
    }

    let config = GatewayConfig::from_env().expect("config");
    assert_eq!(config.http_addr, "127.0.0.1:8081");
    assert_eq!(config.modbus_port, 5020);
    assert!(!config.snmp_enabled);
    assert!(config.mqtt.enabled);
    assert_eq!(config.mqtt.topic_prefix, "plant/line1");
    assert_eq!(config.mqtt.publish_interval, Duration::from_millis(500));
    assert_eq!(config.ipc_socket_path, "/run/ds/ipc.sock");

    // 无法表示为时长的间隔返回配置错误而不是 panic
    for bad in ["1e300", "0", "-1", "NaN", "inf"] {
        unsafe {
            std::env::set_var("DS_MQTT_PUBLISH_INTERVAL_SECS", bad);
        }
        match GatewayConfig::from_env() {
            Err(ConfigError::Invalid(key, value)) => {
                assert_eq!(key, "DS_MQTT_PUBLISH_INTERVAL_SECS");
                assert_eq!(value, bad);
            }
            other => panic!("unexpected for {bad}: {other:?}"),
        }
    }
    unsafe {
        std::env::set_var("DS_MQTT_PUBLISH_INTERVAL_SECS", "0.5");
    }

    unsafe {
        std::env::set_var("DS_MODBUS_PORT", "not-a-port");
    }
    match GatewayConfig::from_env() {
        Err(ConfigError::Invalid(key, value)) => {
            assert_eq!(key, "DS_MODBUS_PORT");
            assert_eq!(value, "not-a-port");
        }
        other => panic!("unexpected: {other:?}"),
    }

    unsafe {
        std::env::set_var("DS_MODBUS_PORT", "502");
        std::env::set_var("DS_MQTT_QOS", "3");
    }
    assert!(GatewayConfig::from_env().is_err());
}
