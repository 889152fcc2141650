//! IPC 服务端
//!
//! 监听 Unix Socket，每个连接一个任务，逐行解析请求并写入 DataStore。
//!
//! - 存储层拒绝（未知键、未映射地址）：返回 `ok:false`，连接保持
//! - 帧错误（非法 JSON、未知 action、超长、非 UTF-8）：返回错误后仅关闭该连接

use crate::MAX_FRAME_BYTES;
use crate::error::IpcError;
use crate::frame::{IpcRequest, IpcResponse, WriteItem};
use domain::{Shutdown, WriteTarget};
use ds_store::{DataStore, Registration, StoreError};
use ds_telemetry::{record_ipc_connection, record_ipc_request};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// IPC 服务端配置
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    pub socket_path: PathBuf,
    /// 写入未知键时自动注册为无地址浮点点位。
    pub auto_register: bool,
    pub max_frame_bytes: usize,
}

impl IpcServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            auto_register: false,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// IPC 服务端
#[derive(Clone)]
pub struct IpcServer {
    store: Arc<DataStore>,
    config: Arc<IpcServerConfig>,
}

impl IpcServer {
    pub fn new(store: Arc<DataStore>, config: IpcServerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// 绑定 Socket：清理残留文件并将权限收紧为 0600。
    ///
    /// 若已有进程在该路径上监听，返回 `AddressInUse` 而不是抢占。
    pub async fn bind(&self) -> Result<UnixListener, IpcError> {
        let path = &self.config.socket_path;
        if tokio::fs::symlink_metadata(path).await.is_ok() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(IpcError::AddressInUse(path.display().to_string()));
            }
            info!(target: "ds.ipc", path = %path.display(), "removing stale socket file");
            tokio::fs::remove_file(path).await?;
        }
        let listener = UnixListener::bind(path)?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(listener)
    }

    /// 绑定并运行，直到收到关停信号。
    pub async fn run(self, shutdown: Shutdown) -> Result<(), IpcError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上接受连接。退出时删除 Socket 文件。
    pub async fn serve(self, listener: UnixListener, shutdown: Shutdown) -> Result<(), IpcError> {
        info!(target: "ds.ipc", path = %self.config.socket_path.display(), "ipc server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    record_ipc_connection();
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream, shutdown).await {
                            warn!(target: "ds.ipc", error = %err, "ipc connection closed with error");
                        }
                    });
                }
                Err(err) => {
                    error!(target: "ds.ipc", error = %err, "failed to accept ipc connection");
                }
            }
        }

        drop(listener);
        remove_socket_file(&self.config.socket_path).await;
        info!(target: "ds.ipc", "ipc server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: UnixStream,
        shutdown: Shutdown,
    ) -> Result<(), IpcError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::with_capacity(256);
        let limit = self.config.max_frame_bytes as u64 + 1;

        loop {
            buf.clear();
            let mut limited = (&mut reader).take(limit);
            let read = tokio::select! {
                _ = shutdown.wait() => break,
                read = limited.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                debug!(target: "ds.ipc", "ipc peer disconnected");
                break;
            }
            if buf.last() != Some(&b'\n') && buf.len() > self.config.max_frame_bytes {
                record_ipc_request(false);
                let response = IpcResponse::fatal(format!(
                    "frame exceeds {} bytes",
                    self.config.max_frame_bytes
                ));
                send_response(&mut write_half, &response).await?;
                return Err(IpcError::Protocol("frame too long".to_string()));
            }

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(_) => {
                    record_ipc_request(false);
                    send_response(&mut write_half, &IpcResponse::fatal("frame is not utf-8"))
                        .await?;
                    return Err(IpcError::Protocol("frame is not utf-8".to_string()));
                }
            };
            if line.is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<IpcRequest>(line) {
                Ok(request) => request,
                Err(err) => {
                    record_ipc_request(false);
                    let message = format!("malformed request: {err}");
                    send_response(&mut write_half, &IpcResponse::fatal(message.clone())).await?;
                    return Err(IpcError::Protocol(message));
                }
            };

            let response = self.handle_request(request);
            record_ipc_request(response.ok);
            send_response(&mut write_half, &response).await?;
        }
        Ok(())
    }

    /// 处理单个已解析的请求。
    pub fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Write(item) => self.apply(&item),
            IpcRequest::BulkWrite { updates } => {
                let results = updates.iter().map(|item| self.apply(item)).collect();
                IpcResponse::bulk(results)
            }
        }
    }

    fn apply(&self, item: &WriteItem) -> IpcResponse {
        let target = match item.target() {
            Ok(target) => target,
            Err(message) => return IpcResponse::failure(message),
        };
        match self.store.write(target.clone(), item.value) {
            Ok(outcome) => IpcResponse::written(&outcome),
            Err(StoreError::UnknownKey(key)) if self.config.auto_register => {
                self.register_and_write(key, target, item)
            }
            Err(err) => {
                debug!(target: "ds.ipc", write_target = %target, error = %err, "ipc write rejected");
                IpcResponse::failure(err.to_string())
            }
        }
    }

    fn register_and_write(&self, key: String, target: WriteTarget, item: &WriteItem) -> IpcResponse {
        if let Err(err) = self.store.register(Registration::new(key.clone())) {
            return IpcResponse::failure(err.to_string());
        }
        info!(target: "ds.ipc", key = %key, "auto-registered key from ipc write");
        match self.store.write(target, item.value) {
            Ok(outcome) => IpcResponse::written(&outcome),
            Err(err) => IpcResponse::failure(err.to_string()),
        }
    }
}

async fn send_response<W>(writer: &mut W, response: &IpcResponse) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(response).map_err(|err| IpcError::Protocol(err.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

async fn remove_socket_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(target: "ds.ipc", path = %path.display(), "socket file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(target: "ds.ipc", path = %path.display(), error = %err, "failed to remove socket file"),
    }
}
