//! 客户端错误定义

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Credential request rejected: {0}")]
    AuthFailure(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Emit failed: {0}")]
    EmitFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}
