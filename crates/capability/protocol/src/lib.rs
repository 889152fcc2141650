//! # 协议服务能力模块
//!
//! 将同一个 [`DataStore`](ds_store::DataStore) 通过多种工业协议对外暴露：
//! - **Modbus TCP**：保持/输入寄存器 ↔ 存储地址
//! - **IEC 60870-5-104**：信息对象地址 ↔ 存储地址，支持总召唤、突发上送与设点命令
//! - **SNMP v2c**：企业 OID 子树 ↔ 存储地址，支持 Get/GetNext/GetBulk/Set
//! - **OPC UA**：每个键一个变量节点（网络服务需启用 `opcua` 特性）
//!
//! ## 架构设计
//!
//! ```text
//!                Arc<DataStore>
//!                      │
//!    ┌──────────┬──────┴─────┬──────────┐
//!    ▼          ▼            ▼          ▼
//! Modbus     IEC104        SNMP       OPC UA
//! (TCP)      (TCP)         (UDP)      (TCP)
//! ```
//!
//! 每个服务独占自己的套接字，在独立任务中运行并观察同一个关停信号；
//! 单个服务出错只结束该服务，不影响其他服务与存储。
//!
//! 协议客户端的写入先按协议自身的类型/范围规则校验，再交给
//! `DataStore::write`；存储拒绝通过协议原生的错误通道返回
//! （Modbus 异常码、IEC104 否定确认、SNMP error-status）。

pub mod apdu;
pub mod ber;
pub mod error;
pub mod iec104;
pub mod modbus_tcp;
pub mod opcua;
pub mod snmp;

pub use error::ProtocolError;
pub use iec104::{Iec104Config, Iec104Server};
pub use modbus_tcp::{ModbusConfig, ModbusServer};
pub use opcua::{OpcUaConfig, OpcUaServer};
pub use snmp::{SnmpAgent, SnmpConfig};

use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};

pub(crate) async fn bind_tcp(addr: &str) -> Result<TcpListener, ProtocolError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProtocolError::Bind {
            addr: addr.to_string(),
            source,
        })
}

pub(crate) async fn bind_udp(addr: &str) -> Result<UdpSocket, ProtocolError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| ProtocolError::Bind {
            addr: addr.to_string(),
            source,
        })
}

pub(crate) fn local_addr_or_unknown(addr: std::io::Result<SocketAddr>) -> String {
    addr.map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
