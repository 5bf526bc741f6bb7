//! 状态投影器
//!
//! 每个投影器订阅一组事件，把强类型负载落到 [`ServerState`] 的一个状态片上。
//! 负载解码失败的事件到不了这里（传输层边界已丢弃）；
//! 未跟踪的 uuid 一律按空操作处理

use crate::state::{
    FileOperation, InstallOutcome, Notification, NotificationCallback, NotificationLevel,
    ServerState,
};
use agent_client::{AgentEvent, EventDispatcher, EventKind, ListenerHandle, OperationKind};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// 资源用量投影：stats 事件整片替换
pub struct StatsProjector {
    state: Arc<ServerState>,
}

impl StatsProjector {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let state = self.state.clone();
        vec![dispatcher.on(
            EventKind::Stats,
            Arc::new(move |event| {
                if let AgentEvent::Stats(stats) = event {
                    state.replace_resources(stats.clone());
                }
            }),
        )]
    }
}

/// 文件操作投影：进度 upsert，完成 / 失败时移除并发通知
pub struct FileOperationProjector {
    state: Arc<ServerState>,
    notify: NotificationCallback,
}

impl FileOperationProjector {
    pub fn new(state: Arc<ServerState>, notify: NotificationCallback) -> Self {
        Self { state, notify }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let mut handles = Vec::new();

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::OperationProgress,
                Arc::new(move |event| {
                    if let AgentEvent::OperationProgress { uuid, operation } = event {
                        state.upsert_file_operation(FileOperation::from_update(uuid, operation));
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            let notify = self.notify.clone();
            handles.push(dispatcher.on(
                EventKind::OperationCompleted,
                Arc::new(move |event| {
                    if let AgentEvent::OperationCompleted { uuid } = event {
                        // 已移除（如重复完成事件）时不再通知
                        if let Some(operation) = state.remove_file_operation(uuid) {
                            notify(Notification {
                                level: NotificationLevel::Success,
                                message: completion_message(operation.kind, &operation.path),
                            });
                        } else {
                            debug!("[FileOperationProjector] Untracked operation {}", uuid);
                        }
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            let notify = self.notify.clone();
            handles.push(dispatcher.on(
                EventKind::OperationError,
                Arc::new(move |event| {
                    if let AgentEvent::OperationError { uuid, error } = event {
                        if let Some(operation) = state.remove_file_operation(uuid) {
                            notify(Notification {
                                level: NotificationLevel::Error,
                                message: failure_message(operation.kind, &operation.path, error),
                            });
                        } else {
                            debug!("[FileOperationProjector] Untracked operation {}", uuid);
                        }
                    }
                }),
            ));
        }

        handles
    }
}

fn completion_message(kind: OperationKind, path: &str) -> String {
    match kind {
        OperationKind::Compress => format!("Archive of {} created", path),
        OperationKind::Decompress => format!("Archive {} extracted", path),
        OperationKind::Pull => format!("Download of {} finished", path),
    }
}

fn failure_message(kind: OperationKind, path: &str, error: &str) -> String {
    match kind {
        OperationKind::Compress => format!("Failed to archive {}: {}", path, error),
        OperationKind::Decompress => format!("Failed to extract {}: {}", path, error),
        OperationKind::Pull => format!("Failed to download {}: {}", path, error),
    }
}

/// 备份投影：进度对 + 完成信息合并
pub struct BackupProjector {
    state: Arc<ServerState>,
}

impl BackupProjector {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let mut handles = Vec::new();

        for kind in [EventKind::BackupProgress, EventKind::BackupRestoreProgress] {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                kind,
                Arc::new(move |event| {
                    let (uuid, progress) = match event {
                        AgentEvent::BackupProgress { uuid, progress } => (uuid, progress),
                        AgentEvent::BackupRestoreProgress { uuid, progress } => (uuid, progress),
                        _ => return,
                    };
                    let progress = progress.clone();
                    state.update_backup(uuid, |record| {
                        record.progress = Some(progress);
                    });
                }),
            ));
        }

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::BackupCompleted,
                Arc::new(move |event| {
                    if let AgentEvent::BackupCompleted { uuid, result } = event {
                        let result = result.clone();
                        state.update_backup(uuid, |record| {
                            record.progress = None;
                            record.checksum = Some(result.checksum);
                            record.checksum_type = Some(result.checksum_type);
                            record.size = Some(result.size);
                            record.file_count = Some(result.file_count);
                            record.successful = Some(result.successful);
                            record.completed_at = Some(Utc::now());
                        });
                    }
                }),
            ));
        }

        handles
    }
}

/// 计划任务投影：步骤标记与步骤错误
pub struct ScheduleProjector {
    state: Arc<ServerState>,
}

impl ScheduleProjector {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let mut handles = Vec::new();

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ScheduleStarted,
                Arc::new(move |event| {
                    if let AgentEvent::ScheduleStarted { uuid } = event {
                        state.update_schedule(uuid, |run| {
                            run.active_step = None;
                            run.step_errors.clear();
                        });
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ScheduleStepStatus,
                Arc::new(move |event| {
                    if let AgentEvent::ScheduleStepStatus { uuid, step_uuid } = event {
                        let step = step_uuid.clone();
                        state.update_schedule(uuid, |run| {
                            run.active_step = Some(step);
                        });
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ScheduleStepError,
                Arc::new(move |event| {
                    if let AgentEvent::ScheduleStepError { uuid, error } = event {
                        let error = error.clone();
                        // 线上只带计划 uuid，错误挂到当前活动步骤上
                        state.update_schedule(uuid, |run| {
                            if let Some(step) = run.active_step.clone() {
                                run.step_errors.insert(step, error);
                            }
                        });
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ScheduleCompleted,
                Arc::new(move |event| {
                    if let AgentEvent::ScheduleCompleted { uuid } = event {
                        state.update_schedule(uuid, |run| {
                            run.active_step = None;
                        });
                    }
                }),
            ));
        }

        handles
    }
}

/// 镜像拉取投影
pub struct ImagePullProjector {
    state: Arc<ServerState>,
}

impl ImagePullProjector {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let mut handles = Vec::new();

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ImagePullProgress,
                Arc::new(move |event| {
                    if let AgentEvent::ImagePullProgress { id, progress } = event {
                        state.upsert_image_pull(id, progress.clone());
                    }
                }),
            ));
        }

        {
            let state = self.state.clone();
            handles.push(dispatcher.on(
                EventKind::ImagePullCompleted,
                Arc::new(move |event| {
                    if let AgentEvent::ImagePullCompleted { id } = event {
                        state.remove_image_pull(id);
                    }
                }),
            ));
        }

        handles
    }
}

/// 安装结果投影
pub struct InstallProjector {
    state: Arc<ServerState>,
    notify: NotificationCallback,
}

impl InstallProjector {
    pub fn new(state: Arc<ServerState>, notify: NotificationCallback) -> Self {
        Self { state, notify }
    }

    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<ListenerHandle> {
        let state = self.state.clone();
        let notify = self.notify.clone();
        vec![dispatcher.on(
            EventKind::InstallCompleted,
            Arc::new(move |event| {
                if let AgentEvent::InstallCompleted { successful } = event {
                    if *successful {
                        state.set_install_outcome(InstallOutcome::Succeeded);
                        notify(Notification {
                            level: NotificationLevel::Success,
                            message: "Server installation completed".to_string(),
                        });
                    } else {
                        state.set_install_outcome(InstallOutcome::Failed);
                        notify(Notification {
                            level: NotificationLevel::Error,
                            message: "Server installation failed".to_string(),
                        });
                    }
                }
            }),
        )]
    }
}

/// 注册全套投影器，返回全部监听凭据（卸载时逐个 off）
pub fn attach_default_projectors(
    state: Arc<ServerState>,
    notify: NotificationCallback,
    dispatcher: &EventDispatcher,
) -> Vec<ListenerHandle> {
    let mut handles = Vec::new();
    handles.extend(StatsProjector::new(state.clone()).attach(dispatcher));
    handles.extend(FileOperationProjector::new(state.clone(), notify.clone()).attach(dispatcher));
    handles.extend(BackupProjector::new(state.clone()).attach(dispatcher));
    handles.extend(ScheduleProjector::new(state.clone()).attach(dispatcher));
    handles.extend(ImagePullProjector::new(state.clone()).attach(dispatcher));
    handles.extend(InstallProjector::new(state, notify).attach(dispatcher));
    handles
}
