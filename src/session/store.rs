//! 会话存储：把对话写成版本化记录
//!
//! save 的三种情况：没有 id 时新建；id 属于他人时分叉出新记录；否则 edit → put → commit，
//! 提交冲突时重新 staging 并整体重试一次。标题在首轮之后异步生成，不阻塞对话。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::StoreSection;
use crate::conversation::{Message, Role, Session};
use crate::core::{RecoveryAction, RecoveryEngine, RelayError};
use crate::service::{CompletionBackend, CompletionRequest, ResolveHint};
use crate::session::artifact::{ArtifactStore, Manifest};
use crate::session::file::FileArtifactStore;

/// 记录中保存消息列表的文件名
pub const MESSAGES_FILE: &str = "messages.json";
/// 标题兜底：首条用户消息的最大字符数
const TITLE_FALLBACK_CHARS: usize = 48;
const TITLE_MAX_WORDS: usize = 6;

const TITLE_PROMPT: &str = "Write a short title (at most 6 words) for the conversation below. \
Reply with the title only, without quotes.";

/// 列表用的会话概要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub agent_id: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionStore {
    artifacts: Arc<dyn ArtifactStore>,
    collection: String,
    identity: String,
    recovery: RecoveryEngine,
    /// 每条记录一把写锁：read → edit → put → commit 期间不允许同一记录的其他写入插队
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        collection: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            artifacts,
            collection: collection.into(),
            identity: identity.into(),
            recovery: RecoveryEngine::default(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 按 [store] 配置使用目录存储
    pub fn from_config(cfg: &StoreSection, identity: impl Into<String>) -> Self {
        Self::new(
            Arc::new(FileArtifactStore::new(&cfg.root)),
            cfg.collection.clone(),
            identity,
        )
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 保存对话，返回持久 id（新建或分叉时与传入的 id 不同）
    pub async fn save(
        &self,
        id: Option<&str>,
        messages: &[Message],
        agent_id: &str,
        title: Option<&str>,
    ) -> Result<String, RelayError> {
        let payload = serde_json::to_vec(messages)?;
        let Some(id) = id else {
            let manifest = self.manifest(agent_id, title.map(str::to_string), messages.len());
            return self.create_record(manifest, payload).await;
        };

        let _guard = self.lock_record(id).await;
        let existing = self.artifacts.read(id).await?;
        if existing.owner != self.identity {
            tracing::info!(from = %id, owner = %existing.owner, "foreign session, forking");
            let title = title.map(str::to_string).or(existing.title);
            let manifest = self.manifest(agent_id, title, messages.len());
            return self.create_record(manifest, payload).await;
        }

        let title = title.map(str::to_string).or(existing.title);
        let manifest = self.manifest(agent_id, title, messages.len());
        self.write_staged(id, manifest, Some(payload)).await?;
        Ok(id.to_string())
    }

    pub async fn load(&self, id: &str) -> Result<Session, RelayError> {
        let manifest = self.artifacts.read(id).await?;
        let bytes = self.artifacts.read_file(id, MESSAGES_FILE).await?;
        let messages: Vec<Message> = serde_json::from_slice(&bytes)?;
        let mut session = Session::durable(id, manifest.owner, manifest.title, messages);
        session.updated_at = manifest.updated_at;
        Ok(session)
    }

    /// 当前集合下的会话概要，最近修改的在前
    pub async fn list(&self) -> Result<Vec<SessionSummary>, RelayError> {
        let mut summaries: Vec<SessionSummary> = self
            .artifacts
            .list(&self.collection)
            .await?
            .into_iter()
            .map(|a| SessionSummary {
                id: a.id,
                title: a.manifest.title,
                agent_id: a.manifest.agent_id,
                message_count: a.manifest.message_count,
                updated_at: a.manifest.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    pub async fn update_title(&self, id: &str, title: &str) -> Result<(), RelayError> {
        let _guard = self.lock_record(id).await;
        let mut manifest = self.artifacts.read(id).await?;
        manifest.title = Some(title.to_string());
        manifest.updated_at = Utc::now();
        self.write_staged(id, manifest, None).await
    }

    async fn lock_record(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn manifest(&self, agent_id: &str, title: Option<String>, count: usize) -> Manifest {
        Manifest {
            title,
            agent_id: agent_id.to_string(),
            owner: self.identity.clone(),
            message_count: count,
            updated_at: Utc::now(),
        }
    }

    async fn create_record(&self, manifest: Manifest, payload: Vec<u8>) -> Result<String, RelayError> {
        let id = self.artifacts.create(&self.collection, manifest.clone()).await?;
        self.artifacts.put(&id, MESSAGES_FILE, payload.clone()).await?;
        if let Err(e) = self.artifacts.commit(&id).await {
            self.restage_or_surface(&e)?;
            tracing::warn!(id = %id, error = %e, "commit conflict on new record, re-staging");
            self.write_once(&id, &manifest, Some(&payload)).await?;
        }
        tracing::info!(id = %id, collection = %self.collection, "session record created");
        Ok(id)
    }

    /// edit(stage) → put → commit；冲突时重新 staging 整体重试一次
    async fn write_staged(
        &self,
        id: &str,
        manifest: Manifest,
        payload: Option<Vec<u8>>,
    ) -> Result<(), RelayError> {
        let mut failures = 0usize;
        loop {
            let result = self.write_once(id, &manifest, payload.as_deref()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    failures += 1;
                    match self.recovery.handle(&e, failures, 0) {
                        RecoveryAction::Restage => {
                            tracing::warn!(id = %id, error = %e, "commit conflict, re-staging");
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    async fn write_once(
        &self,
        id: &str,
        manifest: &Manifest,
        payload: Option<&[u8]>,
    ) -> Result<(), RelayError> {
        self.artifacts.edit(id, manifest.clone(), true).await?;
        if let Some(bytes) = payload {
            self.artifacts.put(id, MESSAGES_FILE, bytes.to_vec()).await?;
        }
        self.artifacts.commit(id).await
    }

    fn restage_or_surface(&self, err: &RelayError) -> Result<(), RelayError> {
        match self.recovery.handle(err, 1, 0) {
            RecoveryAction::Restage => Ok(()),
            _ => Err(err.clone()),
        }
    }

    /// 后台生成标题并保存；返回最终使用的标题
    pub fn spawn_title_generation(
        self: &Arc<Self>,
        backend: Arc<dyn CompletionBackend>,
        id: String,
        messages: Vec<Message>,
        model: String,
    ) -> JoinHandle<Result<String, RelayError>> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let title = match generate_title(backend.as_ref(), &messages, &model).await {
                Ok(title) => title,
                Err(e) => {
                    tracing::warn!(error = %e, "title generation failed, using first message");
                    fallback_title(&messages)
                }
            };
            store.update_title(&id, &title).await?;
            tracing::info!(id = %id, title = %title, "session titled");
            Ok(title)
        })
    }
}

async fn generate_title(
    backend: &dyn CompletionBackend,
    messages: &[Message],
    model: &str,
) -> Result<String, RelayError> {
    let transcript: String = messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
        .take(4)
        .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
        .collect();
    let request = CompletionRequest {
        messages: vec![Message::system(TITLE_PROMPT), Message::user(transcript)],
        tools: None,
        tool_choice: None,
        model: model.to_string(),
    };
    let reply = backend.complete(request, ResolveHint::Cached).await?;
    clean_title(&reply.content)
        .ok_or_else(|| RelayError::completion("empty title from completion service"))
}

fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().find(|l| !l.trim().is_empty())?;
    let trimmed = line
        .trim()
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim();
    let words: Vec<&str> = trimmed.split_whitespace().take(TITLE_MAX_WORDS).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// 首条用户消息截断为 48 个字符
pub fn fallback_title(messages: &[Message]) -> String {
    let first = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .unwrap_or_default();
    if first.is_empty() {
        return "New chat".to_string();
    }
    let mut title: String = first.chars().take(TITLE_FALLBACK_CHARS).collect();
    if first.chars().count() > TITLE_FALLBACK_CHARS {
        title = title.trim_end().to_string();
        title.push('…');
    }
    title
}
