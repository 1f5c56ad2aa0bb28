//! 对话服务：一轮对话的主机侧驱动
//!
//! 追加用户消息 → 保存（草稿升级 / 分叉）→ 执行桥跑引擎 → 追加结果或唯一一条失败消息
//! → 附上执行轨迹 → 再次保存 → 首轮之后后台生成标题。同一会话的轮次由 SessionSupervisor 串行化。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::bridge::{ExecutionBridge, LocalSandbox};
use crate::config::{AppConfig, ProgressSection};
use crate::conversation::{Binding, Message, Role, Session};
use crate::core::{RelayError, SessionSupervisor};
use crate::engine::ProgressEvent;
use crate::progress::{ProgressReporter, ProgressTrace};
use crate::service::{CompletionBackend, ServiceConnector, ServiceResolver};
use crate::session::SessionStore;
use crate::tools::ToolRegistry;

/// 一轮对话的结果
#[derive(Debug)]
pub struct TurnReport {
    /// 保存后的持久 id（两次保存都失败时为 None）
    pub session_id: Option<String>,
    pub reply: Option<String>,
    pub error: Option<RelayError>,
    pub trace: ProgressTrace,
    /// 本轮首次保存对会话 id 的影响
    pub binding: Binding,
    pub save_error: Option<RelayError>,
    /// 后台标题任务（仅首轮之后）
    pub title_task: Option<JoinHandle<Result<String, RelayError>>>,
}

pub struct ChatService {
    bridge: ExecutionBridge,
    store: Arc<SessionStore>,
    supervisor: SessionSupervisor,
    agent_id: String,
    model: String,
    progress: ProgressSection,
}

impl ChatService {
    pub fn new(bridge: ExecutionBridge, store: Arc<SessionStore>) -> Self {
        Self {
            bridge,
            store,
            supervisor: SessionSupervisor::new(),
            agent_id: "relay".to_string(),
            model: "gpt-4o-mini".to_string(),
            progress: ProgressSection::default(),
        }
    }

    /// 按配置组装：解析器 + 进程内沙箱 + 目录存储
    pub fn from_config(
        cfg: &AppConfig,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Self {
        let resolver = Arc::new(ServiceResolver::from_config(&cfg.service, connector));
        let sandbox = Arc::new(LocalSandbox::from_config(cfg, registry));
        let bridge = ExecutionBridge::new(sandbox, resolver).with_config(&cfg.bridge);
        let store = Arc::new(SessionStore::from_config(&cfg.store, cfg.app.identity.clone()));
        Self::new(bridge, store)
            .with_agent_id(cfg.app.agent_id.clone())
            .with_model(cfg.service.model.clone())
            .with_progress(cfg.progress.clone())
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_progress(mut self, progress: ProgressSection) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        self.bridge.host()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 新建草稿会话（属于当前身份）
    pub fn new_session(&self) -> Session {
        Session::draft(self.store.identity())
    }

    /// 取消当前进行中的轮次
    pub async fn cancel(&self) {
        self.supervisor.cancel_turn().await;
    }

    /// 发送一条用户消息并跑完一轮
    pub async fn send(
        &self,
        session: &mut Session,
        text: impl Into<String>,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> TurnReport {
        let permit = self.supervisor.begin_turn().await;
        session.push(Message::user(text));
        self.run_turn(session, permit.token(), events).await
    }

    /// 改写第 index 条用户消息，丢弃其后的消息并重新生成回复
    pub async fn resend_edited(
        &self,
        session: &mut Session,
        index: usize,
        text: impl Into<String>,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<TurnReport, RelayError> {
        let permit = self.supervisor.begin_turn().await;
        session.edit_and_truncate(index, text)?;
        Ok(self.run_turn(session, permit.token(), events).await)
    }

    async fn run_turn(
        &self,
        session: &mut Session,
        cancel: tokio_util::sync::CancellationToken,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> TurnReport {
        let mut save_error = None;
        let binding = match self.persist(session).await {
            Ok(binding) => binding,
            Err(e) => {
                tracing::warn!(error = %e, "saving user message failed, continuing");
                save_error = Some(e);
                Binding::Unchanged
            }
        };

        let reporter = ProgressReporter::new(self.progress.max_details);
        reporter.set_summary("Waiting for model");
        let heartbeat_stop = cancel.child_token();
        let heartbeat = reporter.spawn_heartbeat(
            Duration::from_millis(self.progress.heartbeat_ms.max(1)),
            heartbeat_stop.clone(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let collector = {
            let reporter = reporter.clone();
            tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    reporter.record(&ev);
                    if let Some(out) = &events {
                        let _ = out.send(ev);
                    }
                }
            })
        };

        let result = self
            .bridge
            .run(session.messages.clone(), cancel, Some(tx))
            .await;
        let _ = collector.await;
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let (reply, error) = match result {
            Ok(outcome) => {
                reporter.set_summary(format!("Done in {} model calls", outcome.completions));
                for msg in outcome.messages {
                    session.push(msg);
                }
                (Some(outcome.reply), None)
            }
            Err(failure) => {
                reporter.set_summary("Failed");
                for msg in failure.partial {
                    session.push(msg);
                }
                session.push(Message::failure(failure_text(&failure.error)));
                tracing::warn!(error = %failure.error, "turn failed");
                (None, Some(failure.error))
            }
        };

        let trace = reporter.snapshot();
        if let Some(last) = session.messages.last_mut() {
            last.trace = Some(trace.clone());
        }

        if let Err(e) = self.persist(session).await {
            tracing::error!(error = %e, "saving conversation failed");
            save_error = Some(e);
        }

        let title_task = self.maybe_spawn_title(session, error.is_none());
        TurnReport {
            session_id: session.durable_id().map(str::to_string),
            reply,
            error,
            trace,
            binding,
            save_error,
            title_task,
        }
    }

    async fn persist(&self, session: &mut Session) -> Result<Binding, RelayError> {
        let id = self
            .store
            .save(
                session.durable_id(),
                &session.messages,
                &self.agent_id,
                session.title.as_deref(),
            )
            .await?;
        let binding = session.bind(&id);
        match &binding {
            Binding::Promoted => tracing::info!(id = %id, "draft session promoted"),
            Binding::Forked { from } => tracing::info!(id = %id, from = %from, "session forked"),
            Binding::Unchanged => {}
        }
        if matches!(binding, Binding::Forked { .. }) {
            session.owner = self.store.identity().to_string();
        }
        Ok(binding)
    }

    fn maybe_spawn_title(
        &self,
        session: &Session,
        succeeded: bool,
    ) -> Option<JoinHandle<Result<String, RelayError>>> {
        let users = session.messages.iter().filter(|m| m.role == Role::User).count();
        if !succeeded || users != 1 || session.title.is_some() || !session.has_first_exchange() {
            return None;
        }
        let id = session.durable_id()?.to_string();
        let backend: Arc<dyn CompletionBackend> = self.bridge.host().clone();
        Some(self.store.spawn_title_generation(
            backend,
            id,
            session.messages.clone(),
            self.model.clone(),
        ))
    }
}

/// 失败时追加给用户看的唯一一条提示
fn failure_text(err: &RelayError) -> String {
    match err {
        RelayError::Cancelled => "Request cancelled.".to_string(),
        RelayError::CompletionTimeout { stage, .. } => {
            format!("The request timed out during {stage}. Please try again.")
        }
        RelayError::Resolution { .. } => {
            "No completion service is reachable right now. Please try again later.".to_string()
        }
        other => format!("Something went wrong: {other}"),
    }
}
