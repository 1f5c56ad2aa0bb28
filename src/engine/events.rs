//! 执行过程事件：工具发现、补全调用、重试、工具执行、强制收尾
//!
//! 引擎与执行桥都通过 send_event 推送；主机侧的 ProgressReporter 将其整理为消息轨迹。

use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::core::FaultKind;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 工具发现完成（沙箱生命周期内只发生一次，之后为缓存命中）
    ToolsDiscovered { names: Vec<String>, cached: bool },
    /// 开始一次补全调用
    CompletionStarted {
        turn: usize,
        attempt: usize,
        tool_choice: String,
    },
    /// 补全返回
    CompletionFinished {
        turn: usize,
        tool_calls: usize,
        elapsed_ms: u64,
    },
    /// 补全失败，准备重试
    Retrying {
        attempt: usize,
        max_retries: usize,
        prefer_alternate: bool,
        reason: String,
    },
    ToolStarted { tool: String, call_id: String },
    /// 工具返回（预览，避免过长）
    ToolFinished {
        tool: String,
        call_id: String,
        ok: bool,
        cached: bool,
        preview: String,
    },
    /// 超过软截止时间，要求模型立即作答
    SoftDeadline { elapsed_ms: u64 },
    /// 达到轮数上限，强制收尾
    ForcedFinalize { reason: String },
    /// 收尾失败，改用工具结果兜底
    Fallback { tool_outputs: usize },
    /// 新追加到对话中的消息（部分进度，失败时仍会保存）
    MessageAppended { message: Message },
    /// 沙箱瞬时故障，重建后整轮重试
    SandboxRetry {
        attempt: usize,
        fault: FaultKind,
        message: String,
    },
    /// 诊断输出（警告，不视为失败）
    Warning { text: String },
    Error { text: String },
}

pub(crate) fn send_event(
    tx: Option<&tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
    ev: ProgressEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
