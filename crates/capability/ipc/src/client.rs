//! IPC 客户端
//!
//! 惰性建立连接并复用；传输错误或服务端报告帧级错误后丢弃连接，下次调用重新连接。
//! 每次调用受超时约束，客户端内部不做重试，重试策略由调用方决定。

use crate::error::IpcError;
use crate::frame::{IpcRequest, IpcResponse, WriteItem};
use domain::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

/// IPC 客户端配置
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    pub socket_path: PathBuf,
    pub timeout: Duration,
}

impl IpcClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// 写入确认
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    pub key: String,
    pub value: Value,
    pub adjusted: bool,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// IPC 客户端
pub struct IpcClient {
    config: IpcClientConfig,
    connection: Mutex<Option<Connection>>,
}

impl IpcClient {
    pub fn new(config: IpcClientConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.config.socket_path
    }

    /// 按键写入。
    pub async fn write(&self, key: &str, value: Value) -> Result<WriteAck, IpcError> {
        let response = self
            .request(&IpcRequest::Write(WriteItem::key(key, value)))
            .await?;
        ack_from(response, key)
    }

    /// 按地址写入。
    pub async fn write_address(&self, address: u32, value: Value) -> Result<WriteAck, IpcError> {
        let response = self
            .request(&IpcRequest::Write(WriteItem::address(address, value)))
            .await?;
        ack_from(response, &address.to_string())
    }

    /// 批量写入，返回逐项结果。
    pub async fn bulk_write(&self, updates: Vec<WriteItem>) -> Result<Vec<IpcResponse>, IpcError> {
        let response = self.request(&IpcRequest::BulkWrite { updates }).await?;
        response
            .results
            .ok_or_else(|| IpcError::Protocol("bulk response without results".to_string()))
    }

    /// 发送一个请求并等待响应。`ok:false` 转为 `IpcError::Rejected`。
    pub async fn request(&self, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut payload =
            serde_json::to_vec(request).map_err(|err| IpcError::Protocol(err.to_string()))?;
        payload.push(b'\n');

        let mut guard = self.connection.lock().await;
        let result = tokio::time::timeout(
            self.config.timeout,
            self.exchange(&mut guard, &payload),
        )
        .await
        .unwrap_or(Err(IpcError::Timeout(self.config.timeout)));

        match result {
            Ok(response) if response.ok => Ok(response),
            Ok(response) if response.closing => {
                guard.take();
                let message = response
                    .error
                    .unwrap_or_else(|| "frame rejected".to_string());
                debug!(target: "ds.ipc", error = %message, "server closed ipc connection");
                Err(IpcError::Protocol(message))
            }
            Ok(response) => Err(IpcError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string()),
            )),
            Err(err) => {
                if guard.take().is_some() {
                    debug!(target: "ds.ipc", error = %err, "dropping ipc connection");
                }
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        slot: &mut Option<Connection>,
        payload: &[u8],
    ) -> Result<IpcResponse, IpcError> {
        if slot.is_none() {
            let stream = UnixStream::connect(&self.config.socket_path)
                .await
                .map_err(|source| IpcError::Connect {
                    path: self.config.socket_path.display().to_string(),
                    source,
                })?;
            let (read_half, write_half) = stream.into_split();
            *slot = Some(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            });
        }
        let Some(connection) = slot.as_mut() else {
            return Err(IpcError::Closed);
        };

        connection.writer.write_all(payload).await?;
        let mut line = String::new();
        let read = connection.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(IpcError::Closed);
        }
        serde_json::from_str(line.trim()).map_err(|err| IpcError::Protocol(err.to_string()))
    }
}

fn ack_from(response: IpcResponse, fallback_key: &str) -> Result<WriteAck, IpcError> {
    let value = response
        .value
        .ok_or_else(|| IpcError::Protocol("write response without value".to_string()))?;
    Ok(WriteAck {
        key: response.key.unwrap_or_else(|| fallback_key.to_string()),
        value,
        adjusted: response.adjusted.unwrap_or(false),
    })
}
