//! 会话监管：每个会话至多一个驱动任务
//!
//! 持有 session_id -> DriverHandle 的并发表。驱动任务通过 CancellationToken 协作取消，
//! 通过控制通道接收 pause / intervene 请求；退出时释放槽位并触发 finished。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::error::{OrchestratorError, OrchestratorResult};
use crate::engine::{Checkpoint, Intervention};
use crate::session::SessionId;

/// 发往驱动任务的控制请求，在两个输出元素之间处理
#[derive(Debug)]
pub enum DriverControl {
    Pause(oneshot::Sender<OrchestratorResult<Checkpoint>>),
    Intervene(Intervention, oneshot::Sender<OrchestratorResult<()>>),
}

/// 驱动任务的状态视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Running,
    /// 已请求取消，尚未退出
    Stopping,
}

#[derive(Debug)]
pub struct DriverHandle {
    cancel_token: CancellationToken,
    finished: CancellationToken,
    control_tx: mpsc::Sender<DriverControl>,
}

impl DriverHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发协作取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 等待驱动任务退出并释放槽位
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    pub fn status(&self) -> DriverStatus {
        if self.cancel_token.is_cancelled() {
            DriverStatus::Stopping
        } else {
            DriverStatus::Running
        }
    }

    pub async fn send(&self, control: DriverControl) -> bool {
        self.control_tx.send(control).await.is_ok()
    }
}

/// 占用的驱动槽位；control_rx 交给驱动任务
pub struct DriverLease {
    pub session_id: SessionId,
    pub handle: Arc<DriverHandle>,
    pub control_rx: mpsc::Receiver<DriverControl>,
}

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    drivers: RwLock<HashMap<SessionId, Arc<DriverHandle>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 占用槽位；已有驱动时返回 AlreadyDriving，原驱动不受影响
    pub async fn reserve(&self, session_id: &str) -> OrchestratorResult<DriverLease> {
        let mut drivers = self.drivers.write().await;
        if drivers.contains_key(session_id) {
            return Err(OrchestratorError::AlreadyDriving(session_id.to_string()));
        }
        let (control_tx, control_rx) = mpsc::channel(8);
        let handle = Arc::new(DriverHandle {
            cancel_token: CancellationToken::new(),
            finished: CancellationToken::new(),
            control_tx,
        });
        drivers.insert(session_id.to_string(), Arc::clone(&handle));
        Ok(DriverLease {
            session_id: session_id.to_string(),
            handle,
            control_rx,
        })
    }

    /// 释放槽位（仅当仍是同一个 handle）并唤醒等待者
    pub async fn release(&self, session_id: &str, handle: &Arc<DriverHandle>) {
        {
            let mut drivers = self.drivers.write().await;
            if drivers.get(session_id).is_some_and(|h| Arc::ptr_eq(h, handle)) {
                drivers.remove(session_id);
            }
        }
        handle.finished.cancel();
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<DriverHandle>> {
        self.drivers.read().await.get(session_id).cloned()
    }

    pub async fn is_driving(&self, session_id: &str) -> bool {
        self.drivers.read().await.contains_key(session_id)
    }

    pub async fn status(&self, session_id: &str) -> Option<DriverStatus> {
        self.get(session_id).await.map(|h| h.status())
    }

    pub async fn active_count(&self) -> usize {
        self.drivers.read().await.len()
    }

    /// 当前有驱动的会话 id
    pub async fn active_ids(&self) -> Vec<SessionId> {
        self.drivers.read().await.keys().cloned().collect()
    }
}
