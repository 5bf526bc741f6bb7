//! 服务器视图状态
//!
//! 各状态片由投影器独立更新；视图层只读。
//! 分发是同步的，所以状态片用 std 锁而不是异步锁

use agent_client::{OperationKind, OperationUpdate, PullProgress, ResourceStats, TransferProgress};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 用户可见通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// 用户可见通知
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// 通知回调类型
pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// 进行中的文件操作（compress / decompress / pull）
///
/// 首个进度事件创建，后续进度事件更新，完成或失败时移除
#[derive(Debug, Clone, PartialEq)]
pub struct FileOperation {
    pub uuid: String,
    pub kind: OperationKind,
    pub path: String,
    pub destination: Option<String>,
    pub progress: u64,
    pub total: u64,
}

impl FileOperation {
    pub fn from_update(uuid: &str, update: &OperationUpdate) -> Self {
        Self {
            uuid: uuid.to_string(),
            kind: update.kind,
            path: update.path.clone(),
            destination: update.destination.clone(),
            progress: update.progress,
            total: update.total,
        }
    }
}

/// 备份记录的实时侧（进度与完成信息）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupRecord {
    pub uuid: String,
    /// 进行中时有值，完成后清空
    pub progress: Option<TransferProgress>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub size: Option<u64>,
    pub file_count: Option<u64>,
    pub successful: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 计划任务的一次执行
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleRun {
    pub uuid: String,
    /// 当前执行中的步骤
    pub active_step: Option<String>,
    /// 步骤 uuid → 错误文本
    pub step_errors: HashMap<String, String>,
}

/// 安装结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Succeeded,
    Failed,
}

/// 进行中的单文件上传（非事件驱动，由文件管理器写入）
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    /// 相对路径（含目录）
    pub name: String,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub completed: bool,
}

/// 按逻辑目录聚合的上传进度
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedUploadProgress {
    pub total_size: u64,
    pub uploaded_size: u64,
    pub file_count: usize,
    pub completed_count: usize,
    pub pending_count: usize,
}

/// 一个服务器视图的全部投影状态
#[derive(Default)]
pub struct ServerState {
    resources: RwLock<Option<ResourceStats>>,
    file_operations: RwLock<HashMap<String, FileOperation>>,
    backups: RwLock<HashMap<String, BackupRecord>>,
    schedules: RwLock<HashMap<String, ScheduleRun>>,
    image_pulls: RwLock<HashMap<String, PullProgress>>,
    install: RwLock<Option<InstallOutcome>>,
    uploads: RwLock<HashMap<String, FileUpload>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== 资源用量 ====================

    /// 整片替换（last-write-wins）
    pub fn replace_resources(&self, stats: ResourceStats) {
        *self.resources.write().unwrap() = Some(stats);
    }

    pub fn resources(&self) -> Option<ResourceStats> {
        self.resources.read().unwrap().clone()
    }

    // ==================== 文件操作 ====================

    pub fn upsert_file_operation(&self, operation: FileOperation) {
        self.file_operations
            .write()
            .unwrap()
            .insert(operation.uuid.clone(), operation);
    }

    /// 移除并返回；uuid 未被跟踪时返回 None（重复完成事件是空操作）
    pub fn remove_file_operation(&self, uuid: &str) -> Option<FileOperation> {
        self.file_operations.write().unwrap().remove(uuid)
    }

    pub fn file_operation(&self, uuid: &str) -> Option<FileOperation> {
        self.file_operations.read().unwrap().get(uuid).cloned()
    }

    pub fn file_operation_count(&self) -> usize {
        self.file_operations.read().unwrap().len()
    }

    // ==================== 备份 ====================

    pub fn update_backup<F>(&self, uuid: &str, apply: F)
    where
        F: FnOnce(&mut BackupRecord),
    {
        let mut backups = self.backups.write().unwrap();
        let record = backups.entry(uuid.to_string()).or_insert_with(|| BackupRecord {
            uuid: uuid.to_string(),
            ..Default::default()
        });
        apply(record);
    }

    pub fn backup(&self, uuid: &str) -> Option<BackupRecord> {
        self.backups.read().unwrap().get(uuid).cloned()
    }

    // ==================== 计划任务 ====================

    pub fn update_schedule<F>(&self, uuid: &str, apply: F)
    where
        F: FnOnce(&mut ScheduleRun),
    {
        let mut schedules = self.schedules.write().unwrap();
        let run = schedules.entry(uuid.to_string()).or_insert_with(|| ScheduleRun {
            uuid: uuid.to_string(),
            ..Default::default()
        });
        apply(run);
    }

    pub fn schedule(&self, uuid: &str) -> Option<ScheduleRun> {
        self.schedules.read().unwrap().get(uuid).cloned()
    }

    // ==================== 镜像拉取 ====================

    pub fn upsert_image_pull(&self, id: &str, progress: PullProgress) {
        self.image_pulls
            .write()
            .unwrap()
            .insert(id.to_string(), progress);
    }

    pub fn remove_image_pull(&self, id: &str) {
        self.image_pulls.write().unwrap().remove(id);
    }

    pub fn image_pull(&self, id: &str) -> Option<PullProgress> {
        self.image_pulls.read().unwrap().get(id).cloned()
    }

    // ==================== 安装 ====================

    pub fn set_install_outcome(&self, outcome: InstallOutcome) {
        *self.install.write().unwrap() = Some(outcome);
    }

    pub fn install_outcome(&self) -> Option<InstallOutcome> {
        *self.install.read().unwrap()
    }

    // ==================== 上传 ====================

    pub fn upsert_upload(&self, upload: FileUpload) {
        self.uploads
            .write()
            .unwrap()
            .insert(upload.name.clone(), upload);
    }

    pub fn remove_upload(&self, name: &str) {
        self.uploads.write().unwrap().remove(name);
    }

    /// 按逻辑目录聚合在途上传（派生数据，每次重新计算）
    pub fn aggregated_uploads(&self) -> HashMap<String, AggregatedUploadProgress> {
        let uploads = self.uploads.read().unwrap();
        let mut grouped: HashMap<String, AggregatedUploadProgress> = HashMap::new();

        for upload in uploads.values() {
            let entry = grouped.entry(folder_of(&upload.name)).or_default();
            entry.total_size += upload.total_bytes;
            entry.uploaded_size += upload.uploaded_bytes;
            entry.file_count += 1;
            if upload.completed {
                entry.completed_count += 1;
            } else {
                entry.pending_count += 1;
            }
        }

        grouped
    }

    // ==================== 生命周期 ====================

    /// 清空与单条连接绑定的瞬态数据（硬重连时调用）
    ///
    /// 备份与计划任务记录跨连接有意义，只清掉在途进度
    pub fn reset_transient(&self) {
        *self.resources.write().unwrap() = None;
        self.file_operations.write().unwrap().clear();
        self.image_pulls.write().unwrap().clear();
        for record in self.backups.write().unwrap().values_mut() {
            record.progress = None;
        }
    }
}

/// 上传路径的逻辑目录（根目录归入 "/"）
fn folder_of(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((folder, _)) if !folder.is_empty() => folder.to_string(),
        _ => "/".to_string(),
    }
}
