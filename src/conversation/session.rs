//! 会话：草稿 / 持久两态与 edit-and-truncate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::{Message, Role};
use crate::core::RelayError;

/// 会话标识：草稿只有本地 id，首次保存成功后变为持久 id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum SessionId {
    Draft(String),
    Durable(String),
}

/// bind 的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// 草稿首次升级为持久记录
    Promoted,
    Unchanged,
    /// 写入他人会话时分叉出的新记录
    Forked { from: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: Option<String>,
    pub owner: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// 新建草稿会话
    pub fn draft(owner: impl Into<String>) -> Self {
        Self {
            id: SessionId::Draft(uuid::Uuid::new_v4().to_string()),
            title: None,
            owner: owner.into(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// 从已持久化的记录恢复
    pub fn durable(
        id: impl Into<String>,
        owner: impl Into<String>,
        title: Option<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            id: SessionId::Durable(id.into()),
            title,
            owner: owner.into(),
            messages,
            updated_at: Utc::now(),
        }
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.id, SessionId::Draft(_))
    }

    /// 持久 id；草稿返回 None（保存时据此新建记录）
    pub fn durable_id(&self) -> Option<&str> {
        match &self.id {
            SessionId::Durable(id) => Some(id),
            SessionId::Draft(_) => None,
        }
    }

    /// 保存成功后绑定存储返回的 id：草稿只升级一次，持久会话只会因分叉改变 id
    pub fn bind(&mut self, id: &str) -> Binding {
        self.updated_at = Utc::now();
        match &self.id {
            SessionId::Draft(_) => {
                self.id = SessionId::Durable(id.to_string());
                Binding::Promoted
            }
            SessionId::Durable(current) if current == id => Binding::Unchanged,
            SessionId::Durable(current) => {
                let from = current.clone();
                self.id = SessionId::Durable(id.to_string());
                Binding::Forked { from }
            }
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// 改写第 index 条用户消息并丢弃其后的全部消息
    pub fn edit_and_truncate(
        &mut self,
        index: usize,
        content: impl Into<String>,
    ) -> Result<(), RelayError> {
        let msg = self
            .messages
            .get_mut(index)
            .ok_or_else(|| RelayError::Store(format!("message index {index} out of range")))?;
        if msg.role != Role::User {
            return Err(RelayError::Store(format!(
                "message {index} is a {} message; only user messages can be edited",
                msg.role.as_str()
            )));
        }
        msg.content = content.into();
        msg.created_at = Utc::now();
        self.messages.truncate(index + 1);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 是否已完成过至少一轮（用户 + 助手），用于触发标题生成
    pub fn has_first_exchange(&self) -> bool {
        let users = self.messages.iter().filter(|m| m.role == Role::User).count();
        let answers = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant && !m.has_tool_calls())
            .count();
        users >= 1 && answers >= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_promoted_exactly_once() {
        let mut session = Session::draft("alice");
        assert!(session.is_draft());
        assert_eq!(session.bind("rec-1"), Binding::Promoted);
        assert_eq!(session.durable_id(), Some("rec-1"));
        assert_eq!(session.bind("rec-1"), Binding::Unchanged);
        assert_eq!(
            session.bind("rec-2"),
            Binding::Forked {
                from: "rec-1".to_string()
            }
        );
        assert!(!session.is_draft());
    }

    #[test]
    fn test_edit_and_truncate() {
        let mut session = Session::draft("alice");
        session.push(Message::user("first"));
        session.push(Message::assistant("a1"));
        session.push(Message::user("second"));
        session.push(Message::assistant("a2"));

        session.edit_and_truncate(0, "first, edited").unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "first, edited");

        assert!(session.edit_and_truncate(5, "x").is_err());
        session.push(Message::assistant("a1"));
        assert!(session.edit_and_truncate(1, "x").is_err());
    }

    #[test]
    fn test_first_exchange() {
        let mut session = Session::draft("alice");
        session.push(Message::user("q"));
        assert!(!session.has_first_exchange());
        session.push(Message::assistant("a"));
        assert!(session.has_first_exchange());
    }
}
