//! 连接凭证获取
//!
//! 从控制面 API 请求短期连接凭证（token + 端点地址），
//! 初次连接与续期走同一条路径

use crate::error::ClientError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

/// 短期连接凭证
///
/// 每个会话同一时刻只有一份生效；续期产生的新凭证直接取代旧凭证
#[derive(Debug, Clone)]
pub struct Credential {
    /// 服务器标识
    pub server_id: String,
    /// 认证 token（对传输层不透明，仅用于 auth 消息）
    pub token: String,
    /// Agent 端点地址（relocation 后可能指向另一台节点）
    pub endpoint_url: String,
    /// 签发时间
    pub issued_at: DateTime<Utc>,
}

/// 控制面返回的凭证响应体
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialResponse {
    token: String,
    endpoint_url: String,
}

/// 凭证代理
///
/// 无状态，不做内部重试；重试策略由调用方决定
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn request_credential(&self, server_id: &str) -> Result<Credential, ClientError>;
}

/// 控制面 API 配置
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// 控制面 base URL
    pub base_url: String,
    /// API key（Bearer）
    pub api_key: Option<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        // 从环境变量读取配置，默认 localhost:8080
        let base_url = std::env::var("PANEL_API_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let api_key = std::env::var("PANEL_API_KEY").ok();

        Self { base_url, api_key }
    }
}

/// 基于控制面 REST API 的凭证代理
pub struct HttpCredentialBroker {
    config: PanelConfig,
    http: reqwest::Client,
}

impl HttpCredentialBroker {
    /// 创建凭证代理
    pub fn new(config: PanelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// 使用默认配置创建
    pub fn from_env() -> Self {
        Self::new(PanelConfig::default())
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn request_credential(&self, server_id: &str) -> Result<Credential, ClientError> {
        let url = format!("{}/credential", self.config.base_url);
        debug!("[CredentialBroker] Requesting credential for {}", server_id);

        let mut request = self.http.get(&url).query(&[("serverId", server_id)]);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::AuthFailure(body));
        }
        if !status.is_success() {
            return Err(ClientError::NetworkFailure(format!(
                "unexpected status {} from credential endpoint",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::NetworkFailure(e.to_string()))?;
        let body: CredentialResponse = serde_json::from_str(&body)?;

        Ok(Credential {
            server_id: server_id.to_string(),
            token: body.token,
            endpoint_url: body.endpoint_url,
            issued_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_config_default() {
        std::env::remove_var("PANEL_API_URL");
        std::env::remove_var("PANEL_API_KEY");
        let config = PanelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8080");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_malformed_credential_body_is_a_serialization_error() {
        let err = serde_json::from_str::<CredentialResponse>("{not json").unwrap_err();
        let err: ClientError = err.into();
        assert!(matches!(err, ClientError::Serialization(_)));
    }

    #[test]
    fn test_credential_response_parse() {
        let body = r#"{"token":"abc123","endpointUrl":"wss://node-a.example/ws"}"#;
        let parsed: CredentialResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.token, "abc123");
        assert_eq!(parsed.endpoint_url, "wss://node-a.example/ws");
    }
}
