//! 错误恢复引擎
//!
//! 根据 RelayError 类型与已失败次数返回 RecoveryAction，供引擎循环、执行桥与会话存储决定是重试、换服务、重建沙箱还是放弃。

use serde::Deserialize;

use crate::core::{RecoveryAction, RelayError};

/// 重试耗尽策略：只有一个候选服务时「优先备用」等同于重试同一服务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryExhaustion {
    /// 继续重试同一服务直到重试次数用尽（瞬时自愈）
    #[default]
    RetrySame,
    /// 无备用服务时第一次重试失败后立即放弃
    FailFast,
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: usize,
    policy: RetryExhaustion,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, RetryExhaustion::default())
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: usize, policy: RetryExhaustion) -> Self {
        Self {
            max_retries,
            policy,
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// failures：本次补全已失败的次数（含本次，≥1）；candidates：解析器中的候选服务数
    pub fn handle(&self, err: &RelayError, failures: usize, candidates: usize) -> RecoveryAction {
        match err {
            RelayError::Resolution { .. }
            | RelayError::CompletionTimeout { .. }
            | RelayError::Completion { .. } => {
                if failures > self.max_retries {
                    return RecoveryAction::Surface;
                }
                if failures <= 1 {
                    return RecoveryAction::RetrySame;
                }
                if candidates <= 1 && self.policy == RetryExhaustion::FailFast {
                    return RecoveryAction::Surface;
                }
                RecoveryAction::RetryAlternate
            }
            RelayError::ToolArgument { tool, message } => {
                RecoveryAction::ToolResult(format!("Error: invalid arguments for {tool}: {message}"))
            }
            RelayError::ToolExecution { tool, message } => {
                RecoveryAction::ToolResult(format!("Error: {tool} failed: {message}"))
            }
            RelayError::Sandbox { fault, .. } if fault.is_transient() => {
                if failures > self.max_retries {
                    RecoveryAction::Surface
                } else {
                    RecoveryAction::RestartSandbox
                }
            }
            RelayError::PersistenceConflict(_) if failures <= 1 => RecoveryAction::Restage,
            _ => RecoveryAction::Surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FaultKind, Stage};

    fn timeout_payload() -> RelayError {
        RelayError::Completion {
            message: "timed out".to_string(),
            timed_out: true,
        }
    }

    #[test]
    fn test_first_retry_keeps_priority_then_alternates() {
        let engine = RecoveryEngine::new(3, RetryExhaustion::RetrySame);
        assert_eq!(engine.handle(&timeout_payload(), 1, 2), RecoveryAction::RetrySame);
        assert_eq!(engine.handle(&timeout_payload(), 2, 2), RecoveryAction::RetryAlternate);
        assert_eq!(engine.handle(&timeout_payload(), 3, 2), RecoveryAction::RetryAlternate);
        assert_eq!(engine.handle(&timeout_payload(), 4, 2), RecoveryAction::Surface);
    }

    #[test]
    fn test_single_candidate_policy() {
        let err = RelayError::CompletionTimeout {
            stage: Stage::Completion,
            elapsed_ms: 10,
        };
        let healing = RecoveryEngine::new(3, RetryExhaustion::RetrySame);
        assert_eq!(healing.handle(&err, 2, 1), RecoveryAction::RetryAlternate);

        let strict = RecoveryEngine::new(3, RetryExhaustion::FailFast);
        assert_eq!(strict.handle(&err, 1, 1), RecoveryAction::RetrySame);
        assert_eq!(strict.handle(&err, 2, 1), RecoveryAction::Surface);
        assert_eq!(strict.handle(&err, 2, 3), RecoveryAction::RetryAlternate);
    }

    #[test]
    fn test_tool_errors_become_results() {
        let engine = RecoveryEngine::default();
        let err = RelayError::ToolArgument {
            tool: "search_datasets".to_string(),
            message: "expected value at line 1".to_string(),
        };
        match engine.handle(&err, 1, 1) {
            RecoveryAction::ToolResult(text) => {
                assert!(text.starts_with("Error:"));
                assert!(text.contains("search_datasets"));
            }
            other => panic!("Expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn test_sandbox_faults() {
        let engine = RecoveryEngine::new(2, RetryExhaustion::RetrySame);
        let transient = RelayError::sandbox(FaultKind::ProxyUnavailable, "relay closed");
        assert_eq!(engine.handle(&transient, 1, 1), RecoveryAction::RestartSandbox);
        assert_eq!(engine.handle(&transient, 3, 1), RecoveryAction::Surface);
        let fatal = RelayError::sandbox(FaultKind::Engine, "boom");
        assert_eq!(engine.handle(&fatal, 1, 1), RecoveryAction::Surface);
    }

    #[test]
    fn test_conflict_restaged_once() {
        let engine = RecoveryEngine::default();
        let err = RelayError::PersistenceConflict("not staged".to_string());
        assert_eq!(engine.handle(&err, 1, 1), RecoveryAction::Restage);
        assert_eq!(engine.handle(&err, 2, 1), RecoveryAction::Surface);
    }

    #[test]
    fn test_cancel_surfaces() {
        let engine = RecoveryEngine::default();
        assert_eq!(engine.handle(&RelayError::Cancelled, 1, 3), RecoveryAction::Surface);
    }
}
