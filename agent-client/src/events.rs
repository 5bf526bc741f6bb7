//! Agent 事件定义
//!
//! 入站事件在传输层边界一次性解码为强类型 [`AgentEvent`]，
//! 下游投影器不再接触原始 JSON 文本；解码失败的事件在边界处丢弃

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ==================== 入站事件 (Agent → Panel) ====================

/// Agent 推送的事件
///
/// 单条连接内按发送顺序投递；硬重连前后无跨连接顺序保证
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// 资源用量快照
    Stats(ResourceStats),

    /// 镜像拉取进度
    ImagePullProgress { id: String, progress: PullProgress },

    /// 镜像拉取完成
    ImagePullCompleted { id: String },

    /// 备份进度
    BackupProgress {
        uuid: String,
        progress: TransferProgress,
    },

    /// 备份恢复进度
    BackupRestoreProgress {
        uuid: String,
        progress: TransferProgress,
    },

    /// 备份完成
    BackupCompleted { uuid: String, result: BackupResult },

    /// 安装完成（成功 / 失败）
    InstallCompleted { successful: bool },

    /// 计划任务开始
    ScheduleStarted { uuid: String },

    /// 计划任务完成
    ScheduleCompleted { uuid: String },

    /// 计划任务步骤切换
    ScheduleStepStatus { uuid: String, step_uuid: String },

    /// 计划任务步骤出错
    ScheduleStepError { uuid: String, error: String },

    /// 文件操作进度（compress / decompress / pull）
    OperationProgress {
        uuid: String,
        operation: OperationUpdate,
    },

    /// 文件操作完成
    OperationCompleted { uuid: String },

    /// 文件操作失败
    OperationError { uuid: String, error: String },

    /// 工作负载迁移状态
    RelocationStatus { status: String },

    /// 凭证即将过期
    CredentialExpiring,

    /// 凭证已过期
    CredentialExpired,

    /// 认证错误
    AuthError { message: String },

    /// Agent 主动关闭连接
    ConnectionClosed { reason: String },

    /// 传输层断开（socket 级错误，非 Agent 发出）
    SocketClosed { reason: String },
}

/// 事件类别（分发器按类别注册监听）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Stats,
    ImagePullProgress,
    ImagePullCompleted,
    BackupProgress,
    BackupRestoreProgress,
    BackupCompleted,
    InstallCompleted,
    ScheduleStarted,
    ScheduleCompleted,
    ScheduleStepStatus,
    ScheduleStepError,
    OperationProgress,
    OperationCompleted,
    OperationError,
    RelocationStatus,
    CredentialExpiring,
    CredentialExpired,
    AuthError,
    ConnectionClosed,
    SocketClosed,
}

impl AgentEvent {
    /// 事件类别
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::Stats(_) => EventKind::Stats,
            AgentEvent::ImagePullProgress { .. } => EventKind::ImagePullProgress,
            AgentEvent::ImagePullCompleted { .. } => EventKind::ImagePullCompleted,
            AgentEvent::BackupProgress { .. } => EventKind::BackupProgress,
            AgentEvent::BackupRestoreProgress { .. } => EventKind::BackupRestoreProgress,
            AgentEvent::BackupCompleted { .. } => EventKind::BackupCompleted,
            AgentEvent::InstallCompleted { .. } => EventKind::InstallCompleted,
            AgentEvent::ScheduleStarted { .. } => EventKind::ScheduleStarted,
            AgentEvent::ScheduleCompleted { .. } => EventKind::ScheduleCompleted,
            AgentEvent::ScheduleStepStatus { .. } => EventKind::ScheduleStepStatus,
            AgentEvent::ScheduleStepError { .. } => EventKind::ScheduleStepError,
            AgentEvent::OperationProgress { .. } => EventKind::OperationProgress,
            AgentEvent::OperationCompleted { .. } => EventKind::OperationCompleted,
            AgentEvent::OperationError { .. } => EventKind::OperationError,
            AgentEvent::RelocationStatus { .. } => EventKind::RelocationStatus,
            AgentEvent::CredentialExpiring => EventKind::CredentialExpiring,
            AgentEvent::CredentialExpired => EventKind::CredentialExpired,
            AgentEvent::AuthError { .. } => EventKind::AuthError,
            AgentEvent::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            AgentEvent::SocketClosed { .. } => EventKind::SocketClosed,
        }
    }

    /// 从 (事件名, 参数列表) 解码
    pub fn decode(name: &str, args: &[Value]) -> Result<AgentEvent, DecodeError> {
        match name {
            "stats" => Ok(AgentEvent::Stats(parse_payload(name, arg(name, args, 0)?)?)),
            "image-pull-progress" => Ok(AgentEvent::ImagePullProgress {
                id: arg_str(name, args, 0)?,
                progress: parse_payload(name, arg(name, args, 1)?)?,
            }),
            "image-pull-completed" => Ok(AgentEvent::ImagePullCompleted {
                id: arg_str(name, args, 0)?,
            }),
            "backup-progress" => Ok(AgentEvent::BackupProgress {
                uuid: arg_str(name, args, 0)?,
                progress: parse_payload(name, arg(name, args, 1)?)?,
            }),
            "backup-restore-progress" => Ok(AgentEvent::BackupRestoreProgress {
                uuid: arg_str(name, args, 0)?,
                progress: parse_payload(name, arg(name, args, 1)?)?,
            }),
            "backup-completed" => Ok(AgentEvent::BackupCompleted {
                uuid: arg_str(name, args, 0)?,
                result: parse_payload(name, arg(name, args, 1)?)?,
            }),
            "install-completed" => {
                let flag = arg_str(name, args, 0)?;
                let successful = match flag.as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(DecodeError::InvalidFlag {
                            event: name.to_string(),
                            value: other.to_string(),
                        })
                    }
                };
                Ok(AgentEvent::InstallCompleted { successful })
            }
            "schedule-started" => Ok(AgentEvent::ScheduleStarted {
                uuid: arg_str(name, args, 0)?,
            }),
            "schedule-completed" => Ok(AgentEvent::ScheduleCompleted {
                uuid: arg_str(name, args, 0)?,
            }),
            "schedule-step-status" => Ok(AgentEvent::ScheduleStepStatus {
                uuid: arg_str(name, args, 0)?,
                step_uuid: arg_str(name, args, 1)?,
            }),
            "schedule-step-error" => Ok(AgentEvent::ScheduleStepError {
                uuid: arg_str(name, args, 0)?,
                error: arg_str(name, args, 1)?,
            }),
            "operation-progress" => Ok(AgentEvent::OperationProgress {
                uuid: arg_str(name, args, 0)?,
                operation: parse_payload(name, arg(name, args, 1)?)?,
            }),
            "operation-completed" => Ok(AgentEvent::OperationCompleted {
                uuid: arg_str(name, args, 0)?,
            }),
            "operation-error" => Ok(AgentEvent::OperationError {
                uuid: arg_str(name, args, 0)?,
                error: arg_str(name, args, 1).unwrap_or_default(),
            }),
            "relocation-status" => Ok(AgentEvent::RelocationStatus {
                status: arg_str(name, args, 0)?,
            }),
            "credential-expiring" => Ok(AgentEvent::CredentialExpiring),
            "credential-expired" => Ok(AgentEvent::CredentialExpired),
            "auth-error" => Ok(AgentEvent::AuthError {
                message: arg_str(name, args, 0).unwrap_or_default(),
            }),
            "connection-closed" => Ok(AgentEvent::ConnectionClosed {
                reason: arg_str(name, args, 0).unwrap_or_default(),
            }),
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }
}

/// 事件解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("missing argument {index} for event {event}")]
    MissingArg { event: String, index: usize },

    #[error("malformed payload for event {event}: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid flag for event {event}: {value}")]
    InvalidFlag { event: String, value: String },
}

fn arg<'a>(event: &str, args: &'a [Value], index: usize) -> Result<&'a Value, DecodeError> {
    args.get(index).ok_or_else(|| DecodeError::MissingArg {
        event: event.to_string(),
        index,
    })
}

fn arg_str(event: &str, args: &[Value], index: usize) -> Result<String, DecodeError> {
    let value = arg(event, args, index)?;
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

/// 解析负载：参数可能是 JSON 对象，也可能是内嵌 JSON 的字符串
fn parse_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    value: &Value,
) -> Result<T, DecodeError> {
    let result = match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    result.map_err(|e| DecodeError::MalformedPayload {
        event: event.to_string(),
        source: e,
    })
}

// ==================== 负载结构 ====================

/// 资源用量快照（整片替换，last-write-wins）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub memory_bytes: u64,
    #[serde(default)]
    pub memory_limit_bytes: u64,
    pub cpu_absolute: f64,
    #[serde(default)]
    pub disk_bytes: u64,
    #[serde(default)]
    pub network: NetworkStats,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

/// 镜像拉取进度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub total: u64,
}

/// 备份 / 恢复进度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub progress: u64,
    pub total: u64,
}

/// 备份完成结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    pub checksum: String,
    #[serde(default)]
    pub checksum_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default = "default_true")]
    pub successful: bool,
}

fn default_true() -> bool {
    true
}

/// 文件操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Compress,
    Decompress,
    Pull,
}

/// 文件操作进度负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub total: u64,
}

// ==================== 出站请求 (Panel → Agent) ====================

/// 电源操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

/// Panel 发送给 Agent 的请求（fire-and-forget，无响应关联）
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRequest {
    /// 请求一次资源快照
    SendStats,
    /// 请求历史日志
    SendLogs,
    /// 变更电源状态
    SetState(PowerAction),
}

impl AgentRequest {
    /// 请求对应的事件名
    pub fn event_name(&self) -> &'static str {
        match self {
            AgentRequest::SendStats => "send-stats",
            AgentRequest::SendLogs => "send-logs",
            AgentRequest::SetState(_) => "set-state",
        }
    }

    /// 请求负载
    pub fn payload(&self) -> Value {
        match self {
            AgentRequest::SendStats | AgentRequest::SendLogs => Value::Array(vec![]),
            AgentRequest::SetState(action) => {
                serde_json::to_value(action).unwrap_or(Value::Null)
            }
        }
    }
}
