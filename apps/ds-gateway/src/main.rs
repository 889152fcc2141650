//! DataService 网关进程
//!
//! 启动共享 DataStore，并在同一进程内运行 IPC、各协议服务、MQTT 转发与 HTTP 控制接口。

use domain::{shutdown_channel, termination_signal};
use ds_config::GatewayConfig;
use ds_forwarder::{ForwarderConfig, MqttForwarder};
use ds_gateway::{AppState, build_app, workers::Workers};
use ds_ipc::{IpcServer, IpcServerConfig};
use ds_protocol::{
    Iec104Config, Iec104Server, ModbusConfig, ModbusServer, OpcUaConfig, OpcUaServer, SnmpAgent,
    SnmpConfig,
};
use ds_store::DataStore;
use ds_telemetry::init_tracing;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    init_tracing();

    let store = Arc::new(DataStore::with_default_schema());
    let (trigger, shutdown) = shutdown_channel();
    let mut workers = Workers::new();

    let mut ipc_config = IpcServerConfig::new(config.ipc_socket_path.clone());
    ipc_config.auto_register = config.ipc_auto_register;
    let ipc = IpcServer::new(store.clone(), ipc_config);
    workers.spawn("ipc", ipc.run(shutdown.clone()));

    if config.modbus_enabled {
        let server = ModbusServer::new(
            store.clone(),
            ModbusConfig::new(config.bind_addr(config.modbus_port)),
        );
        workers.spawn("modbus", server.run(shutdown.clone()));
    }

    if config.iec104_enabled {
        let mut iec104 = Iec104Config::new(config.bind_addr(config.iec104_port));
        iec104.common_address = config.iec104_common_address;
        iec104.ioa_base = config.iec104_ioa_base;
        iec104.publish_interval = Duration::from_millis(config.iec104_publish_interval_ms);
        let server = Iec104Server::new(store.clone(), iec104);
        workers.spawn("iec104", server.run(shutdown.clone()));
    }

    if config.snmp_enabled {
        let snmp = SnmpConfig::new(
            config.bind_addr(config.snmp_port),
            config.snmp_community.clone(),
            &config.snmp_base_oid,
        )?;
        let agent = SnmpAgent::new(store.clone(), snmp);
        workers.spawn("snmp", agent.run(shutdown.clone()));
    }

    if config.opcua_enabled {
        let mut opcua = OpcUaConfig::new(
            config.bind_host.clone(),
            config.opcua_port,
            config.opcua_namespace_uri.clone(),
        );
        opcua.refresh_interval = Duration::from_millis(config.opcua_refresh_ms);
        let server = OpcUaServer::new(store.clone(), opcua);
        workers.spawn("opcua", server.run(shutdown.clone()));
    }

    if config.mqtt.enabled {
        let forwarder = MqttForwarder::new(store.clone(), ForwarderConfig::from(&config.mqtt));
        let mqtt_shutdown = shutdown.clone();
        workers.spawn("mqtt", async move {
            forwarder.run(mqtt_shutdown).await;
            Ok::<(), Infallible>(())
        });
    }

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    let app = build_app(AppState::new(store.clone()));
    let http_shutdown = shutdown.clone();
    workers.spawn("http", async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.wait().await })
            .await
    });

    info!(
        target: "ds.gateway",
        http_addr = %config.http_addr,
        ipc_socket = %config.ipc_socket_path,
        entries = store.len(),
        workers = ?workers.names(),
        "gateway started"
    );

    termination_signal().await;
    info!(
        target: "ds.gateway",
        running = workers.running(),
        "termination signal received, shutting down"
    );
    trigger.trigger();

    let aborted = workers
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
    info!(target: "ds.gateway", aborted, "gateway stopped");
    Ok(())
}
