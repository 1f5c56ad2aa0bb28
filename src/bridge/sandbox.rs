//! 沙箱抽象与进程内实现
//!
//! 沙箱内的引擎不直接访问补全服务：每次补全都经事件流中的 Relay 请求交给主机，
//! 主机用自己的解析器完成后经 oneshot 回传。最终结果以响应标记行写到文本输出。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::marker::{chunk_text, MarkerPayload};
use crate::config::{AppConfig, EngineSection};
use crate::conversation::Message;
use crate::core::{FaultKind, RelayError, StageTracker};
use crate::engine::{run_engine, EngineFinish, EngineSession, ProgressEvent};
use crate::service::{AssistantReply, CompletionBackend, CompletionRequest, ResolveHint};
use crate::tools::{ToolExecutor, ToolRegistry, ToolSpecCache};

/// 沙箱内发往主机的补全请求
#[derive(Debug)]
pub struct RelayCall {
    pub request: CompletionRequest,
    pub hint: ResolveHint,
    pub reply: oneshot::Sender<Result<AssistantReply, RelayError>>,
}

/// 沙箱终止状态
#[derive(Clone, Debug, PartialEq)]
pub enum SandboxStatus {
    Completed,
    Failed { fault: FaultKind, message: String },
}

/// 沙箱事件流
#[derive(Debug)]
pub enum SandboxEvent {
    /// 文本输出（可能含响应标记，可能被拆块）
    Output(String),
    /// 诊断输出，主机侧只作为警告
    Diagnostic(String),
    Progress(ProgressEvent),
    Relay(RelayCall),
    Status(SandboxStatus),
}

/// 一次执行的输入
#[derive(Clone, Debug)]
pub struct SandboxRequest {
    pub history: Vec<Message>,
    pub stage: StageTracker,
    /// 主机解析器中的候选服务数
    pub candidates: usize,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// 开始执行，返回事件流
    async fn execute(
        &self,
        request: SandboxRequest,
    ) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, RelayError>;

    /// 中断当前执行
    async fn interrupt(&self);

    /// 销毁并重建沙箱状态（工具发现缓存随之丢弃）
    async fn reset(&self) -> Result<(), RelayError>;
}

/// 引擎侧的补全后端：把请求经事件流转交主机
struct RelayedBackend {
    tx: mpsc::UnboundedSender<SandboxEvent>,
    candidates: usize,
}

#[async_trait]
impl CompletionBackend for RelayedBackend {
    async fn complete(
        &self,
        request: CompletionRequest,
        hint: ResolveHint,
    ) -> Result<AssistantReply, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SandboxEvent::Relay(RelayCall {
                request,
                hint,
                reply: reply_tx,
            }))
            .map_err(|_| RelayError::sandbox(FaultKind::ProxyUnavailable, "host relay channel closed"))?;
        reply_rx
            .await
            .map_err(|_| RelayError::sandbox(FaultKind::ProxyUnavailable, "host relay dropped the call"))?
    }

    fn candidate_count(&self) -> usize {
        self.candidates
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 进程内沙箱：引擎跑在独立任务上，持有自己的工具发现缓存
pub struct LocalSandbox {
    registry: Arc<ToolRegistry>,
    engine: EngineSection,
    tool_timeout: Duration,
    model: String,
    system_prompt: Option<String>,
    chunk_size: usize,
    spec_cache: Mutex<Arc<ToolSpecCache>>,
    running: Mutex<Option<Running>>,
    resets: AtomicUsize,
}

impl LocalSandbox {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let engine = EngineSection::default();
        Self {
            registry,
            tool_timeout: Duration::from_secs(engine.tool_timeout_secs),
            engine,
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            chunk_size: 4096,
            spec_cache: Mutex::new(Arc::new(ToolSpecCache::new())),
            running: Mutex::new(None),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn from_config(cfg: &AppConfig, registry: Arc<ToolRegistry>) -> Self {
        Self::new(registry)
            .with_engine(cfg.engine.clone())
            .with_model(cfg.service.model.clone())
            .with_system_prompt(cfg.app.system_prompt.clone())
            .with_chunk_size(cfg.bridge.chunk_size)
    }

    pub fn with_engine(mut self, engine: EngineSection) -> Self {
        self.tool_timeout = Duration::from_secs(engine.tool_timeout_secs);
        self.engine = engine;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, template: impl Into<String>) -> Self {
        self.system_prompt = Some(template.into());
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// 已重建次数
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// 当前沙箱生命周期内的工具发现次数
    pub fn discoveries(&self) -> usize {
        lock(&self.spec_cache).builds()
    }

    fn stop_running(&self) {
        if let Some(running) = lock(&self.running).take() {
            running.token.cancel();
            running.handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn send_output(tx: &mpsc::UnboundedSender<SandboxEvent>, payload: &MarkerPayload, chunk_size: usize) {
    match payload.to_line() {
        Ok(line) => {
            for chunk in chunk_text(&line, chunk_size) {
                let _ = tx.send(SandboxEvent::Output(chunk));
            }
            let _ = tx.send(SandboxEvent::Status(SandboxStatus::Completed));
        }
        Err(e) => {
            let _ = tx.send(SandboxEvent::Status(SandboxStatus::Failed {
                fault: FaultKind::Engine,
                message: e.to_string(),
            }));
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn execute(
        &self,
        request: SandboxRequest,
    ) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, RelayError> {
        self.stop_running();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let backend = Arc::new(RelayedBackend {
            tx: tx.clone(),
            candidates: request.candidates,
        });
        let executor = ToolExecutor::new(self.registry.clone(), self.tool_timeout);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut session = EngineSession::new(backend, executor, token.clone())
            .with_config(&self.engine)
            .with_spec_cache(lock(&self.spec_cache).clone())
            .with_event_tx(event_tx)
            .with_stage(request.stage.clone())
            .with_model(self.model.clone());
        if let Some(template) = &self.system_prompt {
            session = session.with_system_prompt(template.clone());
        }

        let chunk_size = self.chunk_size;
        let history = request.history;
        let handle = tokio::spawn(async move {
            let forward_tx = tx.clone();
            let forward = tokio::spawn(async move {
                while let Some(ev) = event_rx.recv().await {
                    if forward_tx.send(SandboxEvent::Progress(ev)).is_err() {
                        break;
                    }
                }
            });
            let engine = tokio::spawn(async move {
                let result = run_engine(&session, history).await;
                drop(session);
                result
            });
            let joined = engine.await;
            // session 已释放，转发任务在排空事件后结束
            let _ = forward.await;
            match joined {
                Ok(Ok(outcome)) => {
                    if matches!(outcome.finish, EngineFinish::Fallback | EngineFinish::LimitReached) {
                        let _ = tx.send(SandboxEvent::Diagnostic(format!(
                            "engine finished with {:?} after {} completions",
                            outcome.finish, outcome.completions
                        )));
                    }
                    let _ = tx.send(SandboxEvent::Output("engine finished\n".to_string()));
                    send_output(&tx, &MarkerPayload::Ok { outcome }, chunk_size);
                }
                Ok(Err(failure)) => {
                    send_output(&tx, &MarkerPayload::Failed { failure }, chunk_size);
                }
                Err(e) => {
                    let message = if e.is_panic() {
                        "engine task panicked".to_string()
                    } else {
                        "engine task aborted".to_string()
                    };
                    let _ = tx.send(SandboxEvent::Status(SandboxStatus::Failed {
                        fault: FaultKind::Crashed,
                        message,
                    }));
                }
            }
        });

        *lock(&self.running) = Some(Running { token, handle });
        Ok(rx)
    }

    async fn interrupt(&self) {
        self.stop_running();
    }

    async fn reset(&self) -> Result<(), RelayError> {
        self.stop_running();
        *lock(&self.spec_cache) = Arc::new(ToolSpecCache::new());
        let n = self.resets.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(resets = n, "sandbox reset");
        Ok(())
    }
}
