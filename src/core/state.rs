//! 执行阶段：一轮对话在桥接层内部推进到的位置
//!
//! 超时错误需要说明卡在哪个阶段（解析服务 / 等待补全 / 执行工具），
//! StageTracker 由主机侧中继与事件泵共同更新，桥接层超时时读取。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 执行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    /// 正在解析 / 连接补全服务
    Resolution,
    /// 已绑定服务，等待补全返回
    Completion,
    Tools,
    Finalizing,
}

impl Stage {
    fn as_u8(self) -> u8 {
        match self {
            Stage::Starting => 0,
            Stage::Resolution => 1,
            Stage::Completion => 2,
            Stage::Tools => 3,
            Stage::Finalizing => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Stage::Resolution,
            2 => Stage::Completion,
            3 => Stage::Tools,
            4 => Stage::Finalizing,
            _ => Stage::Starting,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Starting => "starting",
            Stage::Resolution => "resolution",
            Stage::Completion => "completion",
            Stage::Tools => "tools",
            Stage::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

/// 可跨任务共享的阶段记录
#[derive(Clone, Debug, Default)]
pub struct StageTracker {
    inner: Arc<AtomicU8>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stage: Stage) {
        self.inner.store(stage.as_u8(), Ordering::SeqCst);
    }

    pub fn get(&self) -> Stage {
        Stage::from_u8(self.inner.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_shared_between_clones() {
        let tracker = StageTracker::new();
        assert_eq!(tracker.get(), Stage::Starting);
        let other = tracker.clone();
        other.set(Stage::Completion);
        assert_eq!(tracker.get(), Stage::Completion);
    }
}
