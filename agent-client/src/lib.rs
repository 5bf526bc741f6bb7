//! Agent 会话客户端模块
//!
//! 封装与节点 Agent 的实时双向通信：凭证获取、Socket 传输、
//! 强类型事件目录与事件分发

mod credentials;
mod dispatcher;
mod error;
mod events;
mod transport;

pub use credentials::{Credential, CredentialBroker, HttpCredentialBroker, PanelConfig};
pub use dispatcher::{EventCallback, EventDispatcher, ListenerHandle};
pub use error::ClientError;
pub use events::{
    // 入站事件与负载
    AgentEvent, BackupResult, DecodeError, EventKind, NetworkStats, OperationKind,
    OperationUpdate, PullProgress, ResourceStats, TransferProgress,
    // 出站请求
    AgentRequest, PowerAction,
};
pub use transport::{
    ConnectionState, SocketTransport, SocketTransportFactory, StateCell, TlsConfig, Transport,
    TransportConfig, TransportFactory,
};
