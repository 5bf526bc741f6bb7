//! 事件分发器
//!
//! 按事件类别注册回调，把传输层和消费方解耦；
//! 注册 / 注销可在分发过程中安全调用（分发时只迭代快照）

use crate::events::{AgentEvent, EventKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, trace};

/// 事件回调类型
pub type EventCallback = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// 监听注册凭据
///
/// 由注册方持有，组件卸载时通过 [`EventDispatcher::off`] 注销；
/// 重复注销是安全的空操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    kind: EventKind,
    id: u64,
}

/// 事件分发器
///
/// 生命周期长于任何一条传输连接，硬重连不影响已注册的监听
pub struct EventDispatcher {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// 创建分发器
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 注册监听，按注册顺序回调
    pub fn on(&self, kind: EventKind, callback: EventCallback) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.listeners.lock().unwrap();
        listeners.entry(kind).or_default().push((id, callback));
        trace!("[EventDispatcher] Listener {} registered for {:?}", id, kind);
        ListenerHandle { kind, id }
    }

    /// 注销监听（幂等）
    pub fn off(&self, handle: &ListenerHandle) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entries) = listeners.get_mut(&handle.kind) {
            entries.retain(|(id, _)| *id != handle.id);
            if entries.is_empty() {
                listeners.remove(&handle.kind);
            }
        }
    }

    /// 分发事件
    ///
    /// 先拍监听列表快照再释放锁，因此回调里可以继续 on / off；
    /// 单个回调 panic 被隔离，不影响后续回调
    pub fn emit(&self, event: &AgentEvent) {
        let snapshot: Vec<(u64, EventCallback)> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(&event.kind()) {
                Some(entries) => entries.clone(),
                None => return,
            }
        };

        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(
                    "[EventDispatcher] Listener {} panicked while handling {:?}",
                    id,
                    event.kind()
                );
            }
        }
    }

    /// 当前注册的监听总数
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
