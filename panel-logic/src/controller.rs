//! 会话控制器
//!
//! 一个服务器视图的"当前物理连接"唯一属主：负责挂载、凭证续期（软重认证）、
//! 迁移触发的硬重连与卸载。其他组件不得构造或关闭传输实例

use crate::state::ServerState;
use agent_client::{
    AgentEvent, AgentRequest, ClientError, ConnectionState, CredentialBroker, EventDispatcher,
    EventKind, ListenerHandle, StateCell, Transport, TransportFactory,
};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// 致命错误回调类型（上浮给视图层，例如跳转离开）
pub type FatalCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// 内部控制信号（由分发器回调推入，run_once 消费）
#[derive(Debug, Clone)]
enum ControlSignal {
    /// 凭证续期（软重认证，不断开通道）
    Renew,
    /// 迁移状态变化
    Relocation(String),
    /// 凭证被拒（非过期类）
    AuthRejected(String),
    /// 连接关闭（Agent 主动或 socket 级故障）
    Closed(String),
}

/// 会话控制器
pub struct SessionController {
    server_id: String,
    broker: Arc<dyn CredentialBroker>,
    factory: Arc<dyn TransportFactory>,
    dispatcher: Arc<EventDispatcher>,
    state: Arc<ServerState>,
    /// 当前传输实例；重连时整体替换，任一时刻至多一条在开
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// 会话级状态
    status: StateCell,
    /// 续期单飞锁：续期在途时后续过期信号被忽略
    renewal: Mutex<()>,
    /// 卸载后置 false；在途的凭证结果按此丢弃
    alive: AtomicBool,
    signal_tx: mpsc::UnboundedSender<ControlSignal>,
    signal_rx: Mutex<mpsc::UnboundedReceiver<ControlSignal>>,
    /// 内部监听凭据，卸载时逐个注销
    handles: StdMutex<Vec<ListenerHandle>>,
    fatal_callback: StdRwLock<Option<FatalCallback>>,
}

impl SessionController {
    /// 创建控制器（尚未挂载）
    pub fn new(
        server_id: &str,
        broker: Arc<dyn CredentialBroker>,
        factory: Arc<dyn TransportFactory>,
        dispatcher: Arc<EventDispatcher>,
        state: Arc<ServerState>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Self {
            server_id: server_id.to_string(),
            broker,
            factory,
            dispatcher,
            state,
            transport: RwLock::new(None),
            status: StateCell::new(ConnectionState::Idle),
            renewal: Mutex::new(()),
            alive: AtomicBool::new(true),
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
            handles: StdMutex::new(Vec::new()),
            fatal_callback: StdRwLock::new(None),
        }
    }

    /// 设置致命错误回调
    pub fn set_fatal_callback(&self, callback: FatalCallback) {
        *self.fatal_callback.write().unwrap() = Some(callback);
    }

    /// 事件分发器（消费方在这里注册投影器）
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// 会话状态
    pub fn status(&self) -> ConnectionState {
        self.status.load()
    }

    /// 挂载：注册内部监听并建立初始会话
    ///
    /// 初次连接即被拒（authRejected 类）会在这里直接返回错误，由视图处理
    pub async fn start(&self) -> Result<(), ClientError> {
        info!("[SessionController] Starting session for {}", self.server_id);
        self.register_internal_listeners();
        self.mount().await
    }

    /// 卸载：恰好执行一次，无论经历了多少次续期 / 重连
    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[SessionController] Shutting down session for {}", self.server_id);

        for handle in self.handles.lock().unwrap().drain(..) {
            self.dispatcher.off(&handle);
        }

        if let Some(transport) = self.transport.write().await.take() {
            transport.close().await;
        }
        self.status.store(ConnectionState::Closed);
    }

    /// 向 Agent 发送请求；没有在用连接时静默丢弃
    pub async fn send(&self, request: AgentRequest) -> Result<(), ClientError> {
        let transport = self.transport.read().await.clone();
        match transport {
            Some(transport) => transport.send(request).await,
            None => {
                debug!("[SessionController] No transport, dropping {}", request.event_name());
                Ok(())
            }
        }
    }

    /// 处理单个控制信号（非阻塞，带超时）
    pub async fn run_once(self: &Arc<Self>) -> Result<()> {
        let signal = {
            let mut rx = self.signal_rx.lock().await;
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(signal) => signal,
                Err(_) => None, // 超时
            }
        };

        if let Some(signal) = signal {
            self.handle_signal(signal).await;
        }
        Ok(())
    }

    /// 运行控制循环，直到卸载
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        while self.alive.load(Ordering::SeqCst) {
            self.run_once().await?;
        }
        Ok(())
    }

    // ==================== 内部实现 ====================

    /// 注册内部监听：过期 / 认证 / 迁移 / 关闭四类信号
    fn register_internal_listeners(&self) {
        let mut handles = self.handles.lock().unwrap();

        for kind in [EventKind::CredentialExpiring, EventKind::CredentialExpired] {
            let tx = self.signal_tx.clone();
            handles.push(self.dispatcher.on(
                kind,
                Arc::new(move |_| {
                    let _ = tx.send(ControlSignal::Renew);
                }),
            ));
        }

        {
            let tx = self.signal_tx.clone();
            handles.push(self.dispatcher.on(
                EventKind::AuthError,
                Arc::new(move |event| {
                    if let AgentEvent::AuthError { message } = event {
                        // 带 expired 的按过期处理：带外过期通知的兜底
                        if message.to_lowercase().contains("expired") {
                            let _ = tx.send(ControlSignal::Renew);
                        } else {
                            let _ = tx.send(ControlSignal::AuthRejected(message.clone()));
                        }
                    }
                }),
            ));
        }

        {
            let tx = self.signal_tx.clone();
            handles.push(self.dispatcher.on(
                EventKind::RelocationStatus,
                Arc::new(move |event| {
                    if let AgentEvent::RelocationStatus { status } = event {
                        let _ = tx.send(ControlSignal::Relocation(status.clone()));
                    }
                }),
            ));
        }

        {
            let tx = self.signal_tx.clone();
            handles.push(self.dispatcher.on(
                EventKind::ConnectionClosed,
                Arc::new(move |event| {
                    if let AgentEvent::ConnectionClosed { reason } = event {
                        let _ = tx.send(ControlSignal::Closed(format!("server closed: {}", reason)));
                    }
                }),
            ));
        }

        {
            let tx = self.signal_tx.clone();
            handles.push(self.dispatcher.on(
                EventKind::SocketClosed,
                Arc::new(move |event| {
                    if let AgentEvent::SocketClosed { reason } = event {
                        let _ = tx.send(ControlSignal::Closed(reason.clone()));
                    }
                }),
            ));
        }
    }

    async fn handle_signal(self: &Arc<Self>, signal: ControlSignal) {
        match signal {
            ControlSignal::Renew => {
                // 续期放后台，控制循环不被占住；单飞锁在任务内部把关
                let controller = self.clone();
                tokio::spawn(async move {
                    controller.renew_credential().await;
                });
            }
            ControlSignal::Relocation(status) => match status.as_str() {
                "starting" | "success" => {
                    debug!("[SessionController] Ignoring relocation status {}", status);
                }
                other => {
                    info!("[SessionController] Relocation status {}, hard reconnect", other);
                    self.hard_reconnect().await;
                }
            },
            ControlSignal::AuthRejected(message) => {
                let err = ClientError::AuthFailure(message);
                error!("[SessionController] Credential rejected: {}", err);
                self.emit_fatal(&err);
            }
            ControlSignal::Closed(reason) => {
                if self.alive.load(Ordering::SeqCst) {
                    warn!("[SessionController] Connection lost: {}", reason);
                    self.emit_fatal(&ClientError::ConnectionFailed(reason));
                }
            }
        }
    }

    /// 建立会话：取凭证 → 新传输实例 → 连接 → 提交凭证
    async fn mount(&self) -> Result<(), ClientError> {
        self.status.store(ConnectionState::Connecting);

        let credential = self.broker.request_credential(&self.server_id).await?;
        if !self.alive.load(Ordering::SeqCst) {
            debug!("[SessionController] Discarding credential, controller torn down");
            return Ok(());
        }
        info!(
            "[SessionController] Connecting {} via {}",
            self.server_id, credential.endpoint_url
        );

        // 不变式：任一时刻至多一条物理连接
        if let Some(old) = self.transport.write().await.take() {
            old.close().await;
        }

        let transport = self.factory.create();
        transport.connect(&credential.endpoint_url).await?;
        self.status.store(ConnectionState::Authenticating);
        transport.submit_credential(&credential.token, false).await?;

        // alive 判定和写入槽位必须在同一个临界区里：
        // 先查后锁会和 shutdown 的 take 交错，留下无主的活连接
        {
            let mut slot = self.transport.write().await;
            if !self.alive.load(Ordering::SeqCst) {
                drop(slot);
                transport.close().await;
                return Ok(());
            }
            *slot = Some(transport);
            self.status.store(ConnectionState::Connected);
        }
        info!("[SessionController] Session established for {}", self.server_id);
        Ok(())
    }

    /// 软重认证：在现有连接上重新提交新凭证
    ///
    /// 稳态下的续期失败只记日志，连接保持原样——凭证真过期时
    /// 远端自会关闭连接并走 Closed 路径
    async fn renew_credential(self: Arc<Self>) {
        let _guard = match self.renewal.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("[SessionController] Renewal already in flight, ignoring signal");
                return;
            }
        };

        info!("[SessionController] Renewing credential for {}", self.server_id);
        let result = self.broker.request_credential(&self.server_id).await;

        if !self.alive.load(Ordering::SeqCst) {
            debug!("[SessionController] Discarding renewal result, controller torn down");
            return;
        }

        match result {
            Ok(credential) => {
                let transport = self.transport.read().await.clone();
                if let Some(transport) = transport {
                    match transport.submit_credential(&credential.token, true).await {
                        Ok(()) => info!("[SessionController] Credential renewed"),
                        Err(e) => {
                            warn!("[SessionController] Renewal submit failed, leaving connection as-is: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    "[SessionController] Credential renewal failed, leaving connection as-is: {}",
                    e
                );
            }
        }
    }

    /// 硬重连：迁移使原端点失效，拆掉整条会话重新挂载
    async fn hard_reconnect(&self) {
        self.status.store(ConnectionState::Reconnecting);

        if let Some(old) = self.transport.write().await.take() {
            old.close().await;
        }
        // 与旧连接绑定的瞬态状态已经失效
        self.state.reset_transient();

        match self.mount().await {
            Ok(()) => {}
            Err(e) => {
                // 迁移目标不可达：上浮致命错误，不做内部重试
                error!("[SessionController] Reconnect after relocation failed: {}", e);
                self.emit_fatal(&e);
            }
        }
    }

    fn emit_fatal(&self, error: &ClientError) {
        let callback = self.fatal_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_client::Credential;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    struct MockTransport {
        connected_url: StdMutex<Option<String>>,
        auth_calls: StdMutex<Vec<(String, bool)>>,
        closes: AtomicUsize,
        state: StateCell,
        /// 有 gate 时 submit_credential 要先拿到一个 permit
        auth_gate: Option<Arc<Semaphore>>,
    }

    impl MockTransport {
        fn new(auth_gate: Option<Arc<Semaphore>>) -> Self {
            Self {
                connected_url: StdMutex::new(None),
                auth_calls: StdMutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                state: StateCell::new(ConnectionState::Idle),
                auth_gate,
            }
        }

        fn connected_url(&self) -> Option<String> {
            self.connected_url.lock().unwrap().clone()
        }

        fn auth_calls(&self) -> Vec<(String, bool)> {
            self.auth_calls.lock().unwrap().clone()
        }

        fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, url: &str) -> Result<(), ClientError> {
            *self.connected_url.lock().unwrap() = Some(url.to_string());
            self.state.store(ConnectionState::Authenticating);
            Ok(())
        }

        async fn submit_credential(&self, token: &str, soft: bool) -> Result<(), ClientError> {
            if let Some(gate) = &self.auth_gate {
                gate.acquire().await.unwrap().forget();
            }
            self.auth_calls
                .lock()
                .unwrap()
                .push((token.to_string(), soft));
            self.state.store(ConnectionState::Connected);
            Ok(())
        }

        async fn send(&self, _request: AgentRequest) -> Result<(), ClientError> {
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.state.store(ConnectionState::Closed);
        }

        fn state(&self) -> ConnectionState {
            self.state.load()
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: StdMutex<Vec<Arc<MockTransport>>>,
        auth_gate: Option<Arc<Semaphore>>,
    }

    impl MockFactory {
        fn with_auth_gate(gate: Arc<Semaphore>) -> Self {
            Self {
                auth_gate: Some(gate),
                ..Self::default()
            }
        }

        fn created(&self) -> Vec<Arc<MockTransport>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl TransportFactory for MockFactory {
        fn create(&self) -> Arc<dyn Transport> {
            let transport = Arc::new(MockTransport::new(self.auth_gate.clone()));
            self.created.lock().unwrap().push(transport.clone());
            transport
        }
    }

    struct MockBroker {
        calls: AtomicUsize,
        endpoints: StdMutex<VecDeque<String>>,
        /// 有 gate 时每次请求都要先拿到一个 permit
        gate: Option<Arc<Semaphore>>,
        failing: AtomicBool,
    }

    impl MockBroker {
        fn new(endpoints: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                endpoints: StdMutex::new(endpoints.iter().map(|s| s.to_string()).collect()),
                gate: None,
                failing: AtomicBool::new(false),
            }
        }

        fn gated(endpoints: &[&str], gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(endpoints)
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialBroker for MockBroker {
        async fn request_credential(&self, server_id: &str) -> Result<Credential, ClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::NetworkFailure("broker unreachable".to_string()));
            }
            let endpoint = {
                let mut endpoints = self.endpoints.lock().unwrap();
                if endpoints.len() > 1 {
                    endpoints.pop_front().unwrap()
                } else {
                    endpoints
                        .front()
                        .cloned()
                        .unwrap_or_else(|| "wss://node-a.example/ws".to_string())
                }
            };
            Ok(Credential {
                server_id: server_id.to_string(),
                token: format!("token-{}", n),
                endpoint_url: endpoint,
                issued_at: Utc::now(),
            })
        }
    }

    fn controller(
        broker: Arc<MockBroker>,
        factory: Arc<MockFactory>,
    ) -> (Arc<SessionController>, Arc<EventDispatcher>, Arc<ServerState>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let state = Arc::new(ServerState::new());
        let controller = Arc::new(SessionController::new(
            "srv-1",
            broker,
            factory,
            dispatcher.clone(),
            state.clone(),
        ));
        (controller, dispatcher, state)
    }

    #[tokio::test]
    async fn test_start_mounts_session() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());

        controller.start().await.unwrap();

        assert_eq!(broker.call_count(), 1);
        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(
            created[0].connected_url().as_deref(),
            Some("wss://node-a.example/ws")
        );
        assert_eq!(created[0].auth_calls(), vec![("token-1".to_string(), false)]);
        assert_eq!(controller.status(), ConnectionState::Connected);
        assert_eq!(dispatcher.listener_count(), 6);
    }

    #[tokio::test]
    async fn test_renewal_is_single_flight() {
        // mount 消耗掉第 1 个 permit，后续续期请求全部卡在 gate 上
        let gate = Arc::new(Semaphore::new(1));
        let broker = Arc::new(MockBroker::gated(&["wss://node-a.example/ws"], gate.clone()));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());
        controller.start().await.unwrap();

        // 续期在途期间连续到达的过期信号只触发一次请求
        for _ in 0..3 {
            dispatcher.emit(&AgentEvent::CredentialExpired);
            controller.run_once().await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.call_count(), 2); // mount + 1 renewal

        // 放行后续期完成，软重认证提交到现有实例
        gate.add_permits(1);
        sleep(Duration::from_millis(50)).await;
        let transport = &factory.created()[0];
        assert_eq!(
            transport.auth_calls(),
            vec![
                ("token-1".to_string(), false),
                ("token-2".to_string(), true)
            ]
        );
        assert_eq!(transport.close_count(), 0); // 续期不重连

        // 单飞锁释放后，新的过期信号可以再次触发续期
        gate.add_permits(1);
        dispatcher.emit(&AgentEvent::CredentialExpiring);
        controller.run_once().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.call_count(), 3);
    }

    #[tokio::test]
    async fn test_relocation_starting_and_success_do_not_reconnect() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());
        controller.start().await.unwrap();

        for status in ["starting", "success"] {
            dispatcher.emit(&AgentEvent::RelocationStatus {
                status: status.to_string(),
            });
            controller.run_once().await.unwrap();
        }

        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].close_count(), 0);
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_relocation_triggers_hard_reconnect_to_new_endpoint() {
        let broker = Arc::new(MockBroker::new(&[
            "wss://node-a.example/ws",
            "wss://node-b.example/ws",
        ]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, state) = controller(broker.clone(), factory.clone());
        controller.start().await.unwrap();

        // 硬重连要把旧连接绑定的瞬态状态清掉
        state.replace_resources(agent_client::ResourceStats {
            memory_bytes: 1,
            memory_limit_bytes: 0,
            cpu_absolute: 0.0,
            disk_bytes: 0,
            network: Default::default(),
            uptime: 0,
            state: None,
        });

        dispatcher.emit(&AgentEvent::RelocationStatus {
            status: "migrating".to_string(),
        });
        controller.run_once().await.unwrap();

        let created = factory.created();
        assert_eq!(created.len(), 2); // 恰好一个新实例
        assert_eq!(created[0].close_count(), 1); // 旧实例恰好关一次
        assert_eq!(
            created[1].connected_url().as_deref(),
            Some("wss://node-b.example/ws")
        );
        assert_eq!(created[1].auth_calls(), vec![("token-2".to_string(), false)]);
        assert_eq!(controller.status(), ConnectionState::Connected);
        assert!(state.resources().is_none());
    }

    #[tokio::test]
    async fn test_failed_remount_after_relocation_is_fatal() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());

        let fatals = Arc::new(StdMutex::new(Vec::new()));
        {
            let fatals = fatals.clone();
            controller.set_fatal_callback(Arc::new(move |e| {
                fatals.lock().unwrap().push(e.to_string());
            }));
        }

        controller.start().await.unwrap();
        broker.failing.store(true, Ordering::SeqCst);

        dispatcher.emit(&AgentEvent::RelocationStatus {
            status: "migrating".to_string(),
        });
        controller.run_once().await.unwrap();

        let fatals = fatals.lock().unwrap();
        assert_eq!(fatals.len(), 1);
        assert!(fatals[0].contains("broker unreachable"));
        assert_eq!(factory.created()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_auth_error_with_expired_message_renews() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());
        controller.start().await.unwrap();

        dispatcher.emit(&AgentEvent::AuthError {
            message: "jwt: exp claim is expired".to_string(),
        });
        controller.run_once().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.call_count(), 2);
        let transport = &factory.created()[0];
        assert_eq!(transport.auth_calls().last().unwrap(), &("token-2".to_string(), true));
    }

    #[tokio::test]
    async fn test_auth_rejection_surfaces_fatal_without_reconnect() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());

        let fatals = Arc::new(StdMutex::new(Vec::new()));
        {
            let fatals = fatals.clone();
            controller.set_fatal_callback(Arc::new(move |e| {
                fatals.lock().unwrap().push(e.to_string());
            }));
        }

        controller.start().await.unwrap();
        dispatcher.emit(&AgentEvent::AuthError {
            message: "token is not valid for this server".to_string(),
        });
        controller.run_once().await.unwrap();

        assert_eq!(fatals.lock().unwrap().len(), 1);
        assert_eq!(factory.created().len(), 1); // 不自动重连
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_exactly_once_and_removes_listeners() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());

        controller.start().await.unwrap();
        assert_eq!(dispatcher.listener_count(), 6);

        controller.shutdown().await;
        controller.shutdown().await; // 第二次是空操作

        assert_eq!(dispatcher.listener_count(), 0);
        assert_eq!(factory.created()[0].close_count(), 1);
        assert_eq!(controller.status(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_repeated_mount_unmount_leaves_no_listeners() {
        let dispatcher = Arc::new(EventDispatcher::new());

        for _ in 0..3 {
            let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
            let factory = Arc::new(MockFactory::default());
            let state = Arc::new(ServerState::new());
            let controller = Arc::new(SessionController::new(
                "srv-1",
                broker,
                factory,
                dispatcher.clone(),
                state,
            ));
            controller.start().await.unwrap();
            controller.shutdown().await;
        }

        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_renewal_result_ignored_after_shutdown() {
        let gate = Arc::new(Semaphore::new(1));
        let broker = Arc::new(MockBroker::gated(&["wss://node-a.example/ws"], gate.clone()));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());
        controller.start().await.unwrap();

        dispatcher.emit(&AgentEvent::CredentialExpired);
        controller.run_once().await.unwrap();
        sleep(Duration::from_millis(20)).await; // 续期任务卡在 gate 上

        controller.shutdown().await;
        gate.add_permits(1);
        sleep(Duration::from_millis(50)).await;

        // 在途续期的结果被丢弃，没有软重认证落到已关闭的实例上
        let transport = &factory.created()[0];
        assert_eq!(transport.auth_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_mount_leaves_no_open_transport() {
        let auth_gate = Arc::new(Semaphore::new(0));
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::with_auth_gate(auth_gate.clone()));
        let (controller, _, _) = controller(broker, factory.clone());

        // 挂载卡在认证握手上
        let mounting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start().await })
        };
        sleep(Duration::from_millis(20)).await;

        controller.shutdown().await;
        auth_gate.add_permits(1);
        mounting.await.unwrap().unwrap();

        // 挂载中途卸载：刚连上的实例必须被关掉，不能无主存活
        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].close_count(), 1);
        assert_eq!(controller.status(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connection_closed_surfaces_fatal() {
        let broker = Arc::new(MockBroker::new(&["wss://node-a.example/ws"]));
        let factory = Arc::new(MockFactory::default());
        let (controller, dispatcher, _) = controller(broker.clone(), factory.clone());

        let fatals = Arc::new(StdMutex::new(Vec::new()));
        {
            let fatals = fatals.clone();
            controller.set_fatal_callback(Arc::new(move |e| {
                fatals.lock().unwrap().push(e.to_string());
            }));
        }

        controller.start().await.unwrap();
        dispatcher.emit(&AgentEvent::ConnectionClosed {
            reason: "node shutting down".to_string(),
        });
        controller.run_once().await.unwrap();

        let fatals = fatals.lock().unwrap();
        assert_eq!(fatals.len(), 1);
        assert!(fatals[0].contains("node shutting down"));
    }
}
