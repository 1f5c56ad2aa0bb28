//! 对话数据模型：消息、工具调用与会话
//!
//! 消息序列只追加；唯一的改写入口是 edit_and_truncate（改写某条消息并丢弃其后的全部消息）。
//! 会话在首次成功持久化前是草稿，之后绑定持久 id 且不会回退为草稿。

pub mod session;

pub use session::{Binding, Session, SessionId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::ProgressTrace;

/// 消息角色（与补全接口一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// 模型发起的工具调用；arguments 保留原始 JSON 文本，解析失败在执行时处理
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// 仅 tool 消息：对应的 ToolCall.id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 仅 tool 消息：工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// 产生该消息时的执行轨迹
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<ProgressTrace>,
    /// 本轮失败时唯一的失败提示消息
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            created_at: Utc::now(),
            trace: None,
            failed: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    pub fn tool_result(call: &ToolCall, output: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, output);
        msg.tool_call_id = Some(call.id.clone());
        msg.name = Some(call.name.clone());
        msg
    }

    /// 本轮失败时追加的提示消息
    pub fn failure(content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.failed = true;
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 去掉末尾未被完整应答的工具调用组（assistant 带 tool_calls，但其后的 ToolResult 不全）
///
/// 中途取消或超时时，已追加的部分消息仍会被保存，这里保证保存的历史中 id 对应关系完整。
pub fn trim_dangling_calls(messages: &mut Vec<Message>) {
    let Some(pos) = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant && m.has_tool_calls())
    else {
        return;
    };
    let answered = messages[pos + 1..]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    if answered < messages[pos].tool_calls.len() {
        messages.truncate(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "search_datasets".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn test_message_json_shape() {
        let msg = Message::tool_result(&call("c1"), "ok");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "c1");
        assert!(value.get("failed").is_none());
        assert!(value.get("tool_calls").is_none());

        let failure = serde_json::to_value(Message::failure("boom")).unwrap();
        assert_eq!(failure["failed"], true);
    }

    #[test]
    fn test_deserialize_minimal_message() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert!(!msg.failed);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_trim_dangling_calls() {
        let mut messages = vec![
            Message::user("q"),
            Message::assistant_with_calls("", vec![call("a"), call("b")]),
            Message::tool_result(&call("a"), "1"),
        ];
        trim_dangling_calls(&mut messages);
        assert_eq!(messages.len(), 1);

        let mut complete = vec![
            Message::user("q"),
            Message::assistant_with_calls("", vec![call("a")]),
            Message::tool_result(&call("a"), "1"),
        ];
        trim_dangling_calls(&mut complete);
        assert_eq!(complete.len(), 3);
    }
}
