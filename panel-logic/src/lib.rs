//! 面板侧会话编排模块
//!
//! 在 agent-client 之上实现单服务器视图的会话生命周期：
//! 控制器持有连接、投影器把事件流折叠成可读状态

pub mod controller;
pub mod projectors;
pub mod state;

pub use controller::{FatalCallback, SessionController};
pub use projectors::{
    attach_default_projectors, BackupProjector, FileOperationProjector, ImagePullProjector,
    InstallProjector, ScheduleProjector, StatsProjector,
};
pub use state::{
    AggregatedUploadProgress, BackupRecord, FileOperation, FileUpload, InstallOutcome,
    Notification, NotificationCallback, NotificationLevel, ScheduleRun, ServerState,
};
