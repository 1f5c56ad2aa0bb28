//! 会话监管：单轮串行与中断管理
//!
//! 持有根 CancellationToken；每轮对话取一个子 token 与一把轮次锁，
//! 同一会话的两轮不会重叠，用户取消只影响当前轮。

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// 当前轮次的执行许可：持有期间同会话的其它轮次排队等待
#[derive(Debug)]
pub struct TurnPermit {
    _guard: OwnedMutexGuard<()>,
    token: CancellationToken,
}

impl TurnPermit {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// 会话级生命周期管理：根取消令牌、当前轮令牌与轮次锁
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 关闭整个会话时触发
    cancel_token: CancellationToken,
    /// 当前轮的子 token（用户 Cancel 时触发）
    current: Arc<RwLock<Option<CancellationToken>>>,
    turn_lock: Arc<Mutex<()>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            current: Arc::new(RwLock::new(None)),
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 等待上一轮结束后开始新一轮
    pub async fn begin_turn(&self) -> TurnPermit {
        let guard = self.turn_lock.clone().lock_owned().await;
        let token = self.cancel_token.child_token();
        *self.current.write().await = Some(token.clone());
        TurnPermit {
            _guard: guard,
            token,
        }
    }

    /// 取消当前轮（用户点击停止）；没有进行中的轮次时无操作
    pub async fn cancel_turn(&self) {
        if let Some(token) = self.current.read().await.as_ref() {
            token.cancel();
        }
    }

    /// 关闭会话：取消当前与之后的所有轮次
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_only_affects_current_turn() {
        let supervisor = SessionSupervisor::new();
        let first = supervisor.begin_turn().await;
        assert!(supervisor.is_busy());
        supervisor.cancel_turn().await;
        assert!(first.token().is_cancelled());
        drop(first);

        let second = supervisor.begin_turn().await;
        assert!(!second.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let supervisor = SessionSupervisor::new();
        let permit = supervisor.begin_turn().await;
        supervisor.shutdown();
        assert!(permit.token().is_cancelled());
    }
}
