//! 补全服务抽象
//!
//! CompletionService：已连通的单个服务，返回原始 JSON 负载（可能是 {choices} 也可能是 {error}）；
//! ServiceConnector：按候选标识建立连接；
//! CompletionBackend：引擎看到的补全入口，由解析器实现（主机侧），或由沙箱内的中继实现。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Message, ToolCall};
use crate::core::RelayError;
use crate::tools::ToolSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
}

impl ToolChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
        }
    }
}

/// 一次补全请求；tools 为 None 表示不带工具的纯对话
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSpec>>,
    pub tool_choice: Option<ToolChoice>,
    pub model: String,
}

/// 解析后的助手回复
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// 解析提示：首次使用缓存绑定；失败后刷新；第二次重试起优先备用服务
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveHint {
    Cached,
    Refresh,
    PreferAlternate,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// 绑定的候选标识
    fn id(&self) -> &str;

    /// 返回原始负载；Err 表示传输层失败
    async fn complete(&self, request: &CompletionRequest) -> Result<Value, String>;
}

#[async_trait]
pub trait ServiceConnector: Send + Sync {
    async fn connect(&self, candidate: &str) -> Result<Arc<dyn CompletionService>, String>;
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        hint: ResolveHint,
    ) -> Result<AssistantReply, RelayError>;

    /// 候选服务数量（决定「优先备用」是否有意义）
    fn candidate_count(&self) -> usize;
}
