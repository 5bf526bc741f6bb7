//! Socket 传输层
//!
//! 每个实例持有一条到 Agent 的物理连接：connect / auth / send / close。
//! 入站事件在这里一次性解码为 [`AgentEvent`] 并交给分发器；
//! 实例是一次性的，任何传输层故障进入 `Closed` 后只能重新构造

use crate::dispatcher::EventDispatcher;
use crate::error::ClientError;
use crate::events::{AgentEvent, AgentRequest, EventKind};
use futures::FutureExt;
use native_tls::{Certificate, Identity, TlsConnector};
use rust_socketio::{
    asynchronous::{Client, ClientBuilder},
    Payload,
};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// 连接状态机
///
/// `Idle → Connecting → Authenticating → Connected`；
/// `Connected` 上的软重认证只经过 `Authenticating` 往返，不断开通道；
/// 任何传输层故障进入 `Closed`，该状态对单个实例是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Authenticating = 2,
    Connected = 3,
    Reconnecting = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Reconnecting,
            _ => ConnectionState::Closed,
        }
    }
}

/// 原子状态单元
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// TLS 配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
    /// 客户端证书路径 (PEM 或 P12)
    pub client_cert_path: Option<PathBuf>,
    /// 客户端私钥路径 (PEM)，P12 时不需要
    pub client_key_path: Option<PathBuf>,
    /// P12 密码（如果使用 PKCS#12 格式）
    pub client_p12_password: Option<String>,
    /// 是否跳过服务器证书验证（仅开发用）
    pub danger_accept_invalid_certs: bool,
}

/// 传输层配置
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// TLS 配置
    pub tls: TlsConfig,
}

/// 传输层内部伪事件名（socket 级断开）
const SOCKET_CLOSED_EVENT: &str = "__socket-closed";

/// 入站事件目录（在 ClientBuilder 上逐个注册）
const INBOUND_EVENTS: &[&str] = &[
    "stats",
    "image-pull-progress",
    "image-pull-completed",
    "backup-progress",
    "backup-restore-progress",
    "backup-completed",
    "install-completed",
    "schedule-started",
    "schedule-completed",
    "schedule-step-status",
    "schedule-step-error",
    "operation-progress",
    "operation-completed",
    "operation-error",
    "relocation-status",
    "credential-expiring",
    "credential-expired",
    "auth-error",
    "connection-closed",
];

/// 传输层抽象
///
/// SessionController 只通过这个接口持有连接，测试时可替换为假实现
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// 建立物理连接，成功后进入 `Authenticating`
    async fn connect(&self, url: &str) -> Result<(), ClientError>;

    /// 提交凭证；`soft = true` 表示在不断开通道的前提下重新认证
    async fn submit_credential(&self, token: &str, soft: bool) -> Result<(), ClientError>;

    /// 发送请求（fire-and-forget；未连接时是带日志的空操作，绝不 panic）
    async fn send(&self, request: AgentRequest) -> Result<(), ClientError>;

    /// 关闭连接，实例进入终态
    async fn close(&self);

    /// 当前连接状态
    fn state(&self) -> ConnectionState;
}

/// 传输实例工厂
///
/// 唯一的构造入口：SessionController 在挂载和硬重连时各取一个新实例
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

/// 基于 rust_socketio 的传输实现
pub struct SocketTransport {
    config: TransportConfig,
    dispatcher: Arc<EventDispatcher>,
    client: Arc<RwLock<Option<Client>>>,
    state: Arc<StateCell>,
    /// 事件泵任务句柄（把 socket 事件解码后交给分发器）
    pump_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl SocketTransport {
    /// 创建传输实例（尚未连接）
    pub fn new(config: TransportConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            client: Arc::new(RwLock::new(None)),
            state: Arc::new(StateCell::new(ConnectionState::Idle)),
            pump_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// 构建 TLS 连接器（支持 mTLS）
    fn build_tls_connector(&self) -> Result<Option<TlsConnector>, ClientError> {
        let tls = &self.config.tls;

        // 如果没有 TLS 配置，返回 None
        if tls.ca_cert_path.is_none()
            && tls.client_cert_path.is_none()
            && !tls.danger_accept_invalid_certs
        {
            return Ok(None);
        }

        let mut builder = native_tls::TlsConnector::builder();

        // 加载 CA 证书
        if let Some(ca_path) = &tls.ca_cert_path {
            info!("Loading CA certificate from {:?}", ca_path);
            let ca_pem = fs::read(ca_path)
                .map_err(|e| ClientError::TlsError(format!("Failed to read CA cert: {}", e)))?;
            let ca_cert = Certificate::from_pem(&ca_pem)
                .map_err(|e| ClientError::TlsError(format!("Failed to parse CA cert: {}", e)))?;
            builder.add_root_certificate(ca_cert);
        }

        // 加载客户端证书（mTLS）
        if let Some(cert_path) = &tls.client_cert_path {
            info!("Loading client certificate from {:?}", cert_path);
            let cert_data = fs::read(cert_path)
                .map_err(|e| ClientError::TlsError(format!("Failed to read client cert: {}", e)))?;

            let is_p12 = cert_path
                .extension()
                .map(|ext| ext == "p12" || ext == "pfx")
                .unwrap_or(false);

            let identity = if is_p12 {
                let password = tls.client_p12_password.as_deref().unwrap_or("");
                Identity::from_pkcs12(&cert_data, password)
                    .map_err(|e| ClientError::TlsError(format!("Failed to parse PKCS#12: {}", e)))?
            } else {
                let key_pem = if let Some(key_path) = &tls.client_key_path {
                    fs::read(key_path).map_err(|e| {
                        ClientError::TlsError(format!("Failed to read client key: {}", e))
                    })?
                } else {
                    return Err(ClientError::TlsError(
                        "Client key path required for PEM format".into(),
                    ));
                };
                Identity::from_pkcs8(&cert_data, &key_pem).map_err(|e| {
                    ClientError::TlsError(format!("Failed to create identity from PEM: {}", e))
                })?
            };
            builder.identity(identity);
        }

        // 开发模式：跳过证书验证
        if tls.danger_accept_invalid_certs {
            warn!("TLS certificate verification disabled - FOR DEVELOPMENT ONLY");
            builder.danger_accept_invalid_certs(true);
        }

        let connector = builder
            .build()
            .map_err(|e| ClientError::TlsError(format!("Failed to build TLS connector: {}", e)))?;

        Ok(Some(connector))
    }

    /// 启动事件泵：接收 (事件名, 参数) 并解码分发
    async fn start_pump(&self, mut event_rx: mpsc::Receiver<(String, Vec<Value>)>) {
        let dispatcher = self.dispatcher.clone();
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            while let Some((name, args)) = event_rx.recv().await {
                // 伪事件：socket 级断开由传输层自己注入
                if name == SOCKET_CLOSED_EVENT {
                    let reason = args
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    dispatcher.emit(&AgentEvent::SocketClosed { reason });
                    continue;
                }
                match AgentEvent::decode(&name, &args) {
                    Ok(event) => {
                        // Agent 主动关闭即该实例的终态
                        if event.kind() == EventKind::ConnectionClosed {
                            state.store(ConnectionState::Closed);
                        }
                        dispatcher.emit(&event);
                    }
                    Err(e) => {
                        // 负载损坏：在边界处丢弃，状态片不受影响
                        warn!("[SocketTransport] Dropping event {}: {}", name, e);
                    }
                }
            }
        });

        *self.pump_handle.write().await = Some(handle);
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    async fn connect(&self, url: &str) -> Result<(), ClientError> {
        if self.state.load() == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        self.state.store(ConnectionState::Connecting);
        info!("[SocketTransport] Connecting to {}", url);

        let (event_tx, event_rx) = mpsc::channel::<(String, Vec<Value>)>(100);
        self.start_pump(event_rx).await;

        // 构建 TLS 连接器
        let tls_connector = self.build_tls_connector()?;

        // 构建客户端（强制使用 WebSocket）
        let mut builder =
            ClientBuilder::new(url).transport_type(rust_socketio::TransportType::Websocket);

        if let Some(connector) = tls_connector {
            builder = builder.tls_config(connector);
        }

        // 注册入站事件目录，统一转发给事件泵
        for &name in INBOUND_EVENTS {
            let tx = event_tx.clone();
            builder = builder.on(name, move |payload, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((name.to_string(), payload_args(payload))).await;
                }
                .boxed()
            });
        }

        // socket 级故障：实例进入终态并以 SocketClosed 形式上浮
        let builder = builder
            .on("error", {
                let tx = event_tx.clone();
                let state = self.state.clone();
                move |payload, _| {
                    let tx = tx.clone();
                    let state = state.clone();
                    async move {
                        error!("[SocketTransport] Socket error: {:?}", payload);
                        state.store(ConnectionState::Closed);
                        let reason = json!(format!("network error: {:?}", payload));
                        let _ = tx.send((SOCKET_CLOSED_EVENT.to_string(), vec![reason])).await;
                    }
                    .boxed()
                }
            })
            .on("disconnect", {
                let tx = event_tx.clone();
                let state = self.state.clone();
                move |_, _| {
                    let tx = tx.clone();
                    let state = state.clone();
                    async move {
                        if state.load() != ConnectionState::Closed {
                            warn!("[SocketTransport] Socket disconnected");
                            state.store(ConnectionState::Closed);
                            let reason = json!("socket disconnected");
                            let _ = tx.send((SOCKET_CLOSED_EVENT.to_string(), vec![reason])).await;
                        }
                    }
                    .boxed()
                }
            });

        let client = builder.connect().await.map_err(|e| {
            self.state.store(ConnectionState::Closed);
            ClientError::ConnectionFailed(e.to_string())
        })?;

        // connect() 成功后直接推进状态（不依赖 connect 回调，回调行为不可靠）
        *self.client.write().await = Some(client);
        self.state.store(ConnectionState::Authenticating);
        info!("[SocketTransport] Channel open, awaiting authentication");
        Ok(())
    }

    async fn submit_credential(&self, token: &str, soft: bool) -> Result<(), ClientError> {
        match self.state.load() {
            ConnectionState::Authenticating => {}
            ConnectionState::Connected if soft => {
                // 软重认证：同一条通道上重新提交凭证
                self.state.store(ConnectionState::Authenticating);
            }
            ConnectionState::Closed => return Err(ClientError::Closed),
            other => {
                return Err(ClientError::ConnectionFailed(format!(
                    "cannot authenticate in state {:?}",
                    other
                )));
            }
        }

        let result = {
            let client = self.client.read().await;
            let client = client.as_ref().ok_or(ClientError::NotConnected)?;
            client.emit("auth", json!(token)).await
        };

        match result {
            Ok(()) => {
                self.state.store(ConnectionState::Connected);
                debug!("[SocketTransport] Credential submitted (soft: {})", soft);
                Ok(())
            }
            Err(e) => {
                if soft {
                    // 软重认证失败不拆连接，留给远端按过期处理
                    self.state.store(ConnectionState::Connected);
                } else {
                    self.close().await;
                }
                Err(ClientError::EmitFailed(e.to_string()))
            }
        }
    }

    async fn send(&self, request: AgentRequest) -> Result<(), ClientError> {
        if self.state.load() != ConnectionState::Connected {
            // 未连接时丢弃而不是报错，调用方不因此中断
            debug!(
                "[SocketTransport] Dropping {} while not connected",
                request.event_name()
            );
            return Ok(());
        }

        let client = self.client.read().await;
        let client = client.as_ref().ok_or(ClientError::NotConnected)?;
        client
            .emit(request.event_name(), request.payload())
            .await
            .map_err(|e| ClientError::EmitFailed(e.to_string()))
    }

    async fn close(&self) {
        self.state.store(ConnectionState::Closed);

        // 1. 停止事件泵
        if let Some(handle) = self.pump_handle.write().await.take() {
            handle.abort();
        }

        // 2. 断开 socket
        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.disconnect().await {
                error!("[SocketTransport] Disconnect error: {:?}", e);
            }
        }

        info!("[SocketTransport] Closed");
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }
}

/// 提取 socket.io 负载中的参数列表
fn payload_args(payload: Payload) -> Vec<Value> {
    match payload {
        Payload::Text(values) => values,
        _ => vec![],
    }
}

/// 生产环境工厂：每次构造一个全新的 SocketTransport
pub struct SocketTransportFactory {
    config: TransportConfig,
    dispatcher: Arc<EventDispatcher>,
}

impl SocketTransportFactory {
    pub fn new(config: TransportConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { config, dispatcher }
    }
}

impl TransportFactory for SocketTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        Arc::new(SocketTransport::new(
            self.config.clone(),
            self.dispatcher.clone(),
        ))
    }
}
