//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 RelayError 决定 RetrySame / RetryAlternate / RestartSandbox / Restage / Surface 等。
//! 错误需要跨越沙箱边界（随响应标记一起回传），因此可序列化。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Stage;

/// 沙箱故障类别；前三类视为瞬时故障，可重启沙箱后重试
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// 模板渲染 / 语法错误
    Syntax,
    Timeout,
    /// 主机侧中继不可用
    ProxyUnavailable,
    /// 引擎内部错误（不可重试）
    Engine,
    /// 沙箱任务异常退出（panic 等）
    Crashed,
}

impl FaultKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FaultKind::Syntax | FaultKind::Timeout | FaultKind::ProxyUnavailable
        )
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultKind::Syntax => "syntax",
            FaultKind::Timeout => "timeout",
            FaultKind::ProxyUnavailable => "proxy-unavailable",
            FaultKind::Engine => "engine",
            FaultKind::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// 一轮对话执行中可能出现的错误（解析、补全、工具、沙箱、持久化、取消）
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RelayError {
    /// 所有候选服务 × 重试次数均无法连通
    #[error("Service resolution failed after {attempts} attempts: {last}")]
    Resolution { attempts: usize, last: String },

    /// 执行桥整轮超时：stage 表示超时发生时到达的阶段（解析 / 补全 / 工具 ...）
    #[error("Completion timed out during {stage} after {elapsed_ms} ms")]
    CompletionTimeout { stage: Stage, elapsed_ms: u64 },

    /// 服务返回 error 负载、缺少 choices、传输失败或单次调用超时（timed_out）
    #[error("Completion error: {message}")]
    Completion { message: String, timed_out: bool },

    #[error("Invalid arguments for tool {tool}: {message}")]
    ToolArgument { tool: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Sandbox {fault} fault: {message}")]
    Sandbox { fault: FaultKind, message: String },

    /// 提交时记录已离开 staging 状态
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl RelayError {
    pub fn completion(message: impl Into<String>) -> Self {
        RelayError::Completion {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn sandbox(fault: FaultKind, message: impl Into<String>) -> Self {
        RelayError::Sandbox {
            fault,
            message: message.into(),
        }
    }

    /// 补全侧错误（a-c 类）：可通过重新解析 / 换候选服务重试
    pub fn is_completion_side(&self) -> bool {
        matches!(
            self,
            RelayError::Resolution { .. }
                | RelayError::CompletionTimeout { .. }
                | RelayError::Completion { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Json(e.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 刷新绑定后按原优先级重试
    RetrySame,
    /// 轮换候选优先级，优先尝试备用服务
    RetryAlternate,
    /// 中断并重建沙箱后整轮重试
    RestartSandbox,
    /// 重新进入 staging 后再走一遍 edit / put / commit
    Restage,
    /// 转为工具错误结果写回对话，不中断本轮
    ToolResult(String),
    /// 放弃，向用户展示
    Surface,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_transience() {
        assert!(FaultKind::Syntax.is_transient());
        assert!(FaultKind::Timeout.is_transient());
        assert!(FaultKind::ProxyUnavailable.is_transient());
        assert!(!FaultKind::Engine.is_transient());
        assert!(!FaultKind::Crashed.is_transient());
    }

    #[test]
    fn test_error_survives_json() {
        let err = RelayError::CompletionTimeout {
            stage: Stage::Resolution,
            elapsed_ms: 1200,
        };
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("completion_timeout"));
        let back: RelayError = serde_json::from_str(&text).unwrap();
        assert_eq!(back, err);

        let back: RelayError =
            serde_json::from_str(&serde_json::to_string(&RelayError::Cancelled).unwrap()).unwrap();
        assert!(back.is_cancelled());
    }

    #[test]
    fn test_display_names_stage() {
        let err = RelayError::CompletionTimeout {
            stage: Stage::Completion,
            elapsed_ms: 5,
        };
        assert_eq!(err.to_string(), "Completion timed out during completion after 5 ms");
    }
}
