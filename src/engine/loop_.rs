//! 工具调用主循环
//!
//! 补全 -> (有 tool_calls) 执行工具 -> 再补全，直到模型直接作答；
//! 超过软截止时间或轮数上限时强制收尾（tool_choice=none），收尾失败时用已成功的工具结果兜底。
//! 可选 event_tx：向主机推送 ProgressEvent。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::conversation::{Message, ToolCall};
use crate::core::{RecoveryAction, RecoveryEngine, RelayError, Stage, StageTracker};
use crate::engine::events::send_event;
use crate::engine::prompt::render_system_prompt;
use crate::engine::ProgressEvent;
use crate::service::{
    AssistantReply, CompletionBackend, CompletionRequest, ResolveHint, ToolChoice,
};
use crate::tools::executor::preview;
use crate::tools::{ToolExecutor, ToolOutcome, ToolSpec, ToolSpecCache, TurnCache};

/// 兜底答案中最多引用的工具结果数
const MAX_FALLBACK_OUTPUTS: usize = 5;
/// 兜底答案中每条工具结果的最大字符数
const FALLBACK_OUTPUT_CHARS: usize = 600;
/// 工具结果预览最大字符数（事件用）
const TOOL_PREVIEW_CHARS: usize = 160;

const SOFT_DEADLINE_INSTRUCTION: &str = "Time budget for this request is nearly used up. \
Do not call any more tools. Answer the user now using only the tool results gathered so far.";

const TURN_LIMIT_INSTRUCTION: &str = "The tool-call limit for this request has been reached. \
Do not call any more tools. Give your final answer now based on the results above.";

const LIMIT_REACHED_TEXT: &str = "I reached the tool-call limit for this request before I could \
finish. Please try a narrower question.";

/// 本轮结束方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFinish {
    /// 模型直接作答
    Answered,
    /// 强制收尾后模型作答
    Finalized,
    /// 由工具结果合成的兜底答案
    Fallback,
    /// 达到上限且没有可用结果
    LimitReached,
}

/// 一轮执行结果：最终回复与本轮新增的消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineOutcome {
    pub reply: String,
    pub messages: Vec<Message>,
    pub turns: usize,
    pub completions: usize,
    pub finish: EngineFinish,
}

/// 一轮执行失败：错误与失败前已追加的消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub error: RelayError,
    pub partial: Vec<Message>,
}

/// 引擎会话配置（补全后端、工具执行器与各项上限）
pub struct EngineSession {
    pub backend: Arc<dyn CompletionBackend>,
    pub executor: ToolExecutor,
    /// 工具规格缓存（沙箱生命周期内只构建一次）
    pub spec_cache: Arc<ToolSpecCache>,
    pub recovery: RecoveryEngine,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<UnboundedSender<ProgressEvent>>,
    pub stage: StageTracker,
    pub max_turns: usize,
    pub completion_timeout: Duration,
    pub soft_deadline: Duration,
    pub retry_backoff: Duration,
    pub model: String,
    pub system_prompt: Option<String>,
}

impl EngineSession {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        executor: ToolExecutor,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            backend,
            executor,
            spec_cache: Arc::new(ToolSpecCache::new()),
            recovery: RecoveryEngine::default(),
            cancel_token,
            event_tx: None,
            stage: StageTracker::new(),
            max_turns: 8,
            completion_timeout: Duration::from_secs(90),
            soft_deadline: Duration::from_secs(150),
            retry_backoff: Duration::from_millis(800),
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
        }
    }

    /// 按 [engine] 配置设置上限与重试策略
    pub fn with_config(mut self, cfg: &EngineSection) -> Self {
        self.recovery = RecoveryEngine::new(cfg.max_retries, cfg.retry_exhaustion);
        self.max_turns = cfg.max_turns;
        self.completion_timeout = cfg.completion_timeout();
        self.soft_deadline = cfg.soft_deadline();
        self.retry_backoff = Duration::from_millis(cfg.retry_backoff_ms);
        self
    }

    pub fn with_spec_cache(mut self, cache: Arc<ToolSpecCache>) -> Self {
        self.spec_cache = cache;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_stage(mut self, stage: StageTracker) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_soft_deadline(mut self, deadline: Duration) -> Self {
        self.soft_deadline = deadline;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// 系统提示词模板（支持 {tools} / {today}）
    pub fn with_system_prompt(mut self, template: impl Into<String>) -> Self {
        self.system_prompt = Some(template.into());
        self
    }

    fn emit(&self, ev: ProgressEvent) {
        send_event(self.event_tx.as_ref(), ev);
    }
}

/// 单轮内的可变状态
struct TurnState {
    appended: Vec<Message>,
    cache: TurnCache,
    /// 成功的工具结果（工具名, 输出），供兜底答案使用
    successes: Vec<(String, String)>,
    turns: usize,
    completions: usize,
}

impl TurnState {
    fn append(&mut self, session: &EngineSession, msg: Message) {
        session.emit(ProgressEvent::MessageAppended {
            message: msg.clone(),
        });
        self.appended.push(msg);
    }

    fn fail(self, error: RelayError) -> EngineFailure {
        EngineFailure {
            error,
            partial: self.appended,
        }
    }

    fn finish(mut self, session: &EngineSession, reply: String, finish: EngineFinish) -> EngineOutcome {
        self.append(session, Message::assistant(reply.clone()));
        EngineOutcome {
            reply,
            messages: self.appended,
            turns: self.turns,
            completions: self.completions,
            finish,
        }
    }
}

/// 执行一轮对话：history 为截至本轮（含本轮用户消息）的对话，返回本轮新增的消息
pub async fn run_engine(
    session: &EngineSession,
    history: Vec<Message>,
) -> Result<EngineOutcome, EngineFailure> {
    let started = Instant::now();
    let mut state = TurnState {
        appended: Vec::new(),
        cache: TurnCache::new(),
        successes: Vec::new(),
        turns: 0,
        completions: 0,
    };

    let registry = session.executor.registry();
    let (specs, cached) = session.spec_cache.get_or_build(registry);
    session.emit(ProgressEvent::ToolsDiscovered {
        names: specs.iter().map(|s| s.name.clone()).collect(),
        cached,
    });

    let mut base = Vec::with_capacity(history.len() + 1);
    if let Some(template) = &session.system_prompt {
        match render_system_prompt(template, &registry.tool_descriptions()) {
            Ok(prompt) => base.push(Message::system(prompt)),
            Err(e) => return Err(state.fail(e)),
        }
    }
    base.extend(history);

    // 注入的控制消息只发给模型，不进入返回的对话
    let mut control: Option<Message> = None;
    let mut finalize = false;

    loop {
        if session.cancel_token.is_cancelled() {
            return Err(state.fail(RelayError::Cancelled));
        }
        if !finalize && started.elapsed() >= session.soft_deadline {
            finalize = true;
            control = Some(Message::system(SOFT_DEADLINE_INSTRUCTION));
            session.emit(ProgressEvent::SoftDeadline {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "soft deadline reached");
        }
        if !finalize && state.turns >= session.max_turns {
            finalize = true;
            control = Some(Message::system(TURN_LIMIT_INSTRUCTION));
            let reason = format!("turn limit {} reached", session.max_turns);
            tracing::info!(turns = state.turns, "{reason}");
            session.emit(ProgressEvent::ForcedFinalize { reason });
        }

        let request = build_request(session, &base, &state.appended, control.as_ref(), &specs, finalize);
        session.stage.set(if finalize {
            Stage::Finalizing
        } else {
            Stage::Completion
        });
        let reply = match complete_with_retry(session, &mut state, request).await {
            Ok(reply) => reply,
            Err(RelayError::Cancelled) => return Err(state.fail(RelayError::Cancelled)),
            Err(e) if e.is_completion_side() && !state.successes.is_empty() => {
                tracing::warn!(error = %e, "completion failed, answering from tool results");
                let answer = fallback_answer(&state.successes);
                session.emit(ProgressEvent::Fallback {
                    tool_outputs: state.successes.len().min(MAX_FALLBACK_OUTPUTS),
                });
                return Ok(state.finish(session, answer, EngineFinish::Fallback));
            }
            Err(e) => return Err(state.fail(e)),
        };

        if finalize {
            if reply.tool_calls.is_empty() {
                tracing::debug!("finalized without tool calls");
            } else {
                tracing::warn!(
                    dropped = reply.tool_calls.len(),
                    "tool calls after finalization discarded"
                );
            }
            if !reply.content.trim().is_empty() {
                return Ok(state.finish(session, reply.content, EngineFinish::Finalized));
            }
            if state.successes.is_empty() {
                return Ok(state.finish(
                    session,
                    LIMIT_REACHED_TEXT.to_string(),
                    EngineFinish::LimitReached,
                ));
            }
            let answer = fallback_answer(&state.successes);
            session.emit(ProgressEvent::Fallback {
                tool_outputs: state.successes.len().min(MAX_FALLBACK_OUTPUTS),
            });
            return Ok(state.finish(session, answer, EngineFinish::Fallback));
        }

        if reply.tool_calls.is_empty() {
            return Ok(state.finish(session, reply.content, EngineFinish::Answered));
        }

        let calls = reply.tool_calls.clone();
        state.append(session, Message::assistant_with_calls(reply.content, calls.clone()));
        session.stage.set(Stage::Tools);
        for call in &calls {
            if session.cancel_token.is_cancelled() {
                return Err(state.fail(RelayError::Cancelled));
            }
            let output = run_tool_call(session, &mut state, call).await;
            state.append(session, Message::tool_result(call, output));
        }
        state.turns += 1;
    }
}

fn build_request(
    session: &EngineSession,
    base: &[Message],
    appended: &[Message],
    control: Option<&Message>,
    specs: &Arc<Vec<ToolSpec>>,
    finalize: bool,
) -> CompletionRequest {
    // 之前轮次的失败提示只给用户看，不作为历史发给模型
    let mut messages: Vec<Message> = base
        .iter()
        .chain(appended.iter())
        .filter(|m| !m.failed)
        .cloned()
        .collect();
    if let Some(msg) = control {
        messages.push(msg.clone());
    }
    // 没有工具时退化为不带工具的普通补全
    let (tools, tool_choice) = if specs.is_empty() {
        (None, None)
    } else {
        let choice = if finalize {
            ToolChoice::None
        } else {
            ToolChoice::Auto
        };
        (Some(specs.as_ref().clone()), Some(choice))
    };
    CompletionRequest {
        messages,
        tools,
        tool_choice,
        model: session.model.clone(),
    }
}

/// 带超时与重试的补全：首次失败刷新绑定，之后优先备用服务
async fn complete_with_retry(
    session: &EngineSession,
    state: &mut TurnState,
    request: CompletionRequest,
) -> Result<AssistantReply, RelayError> {
    let tool_choice = request
        .tool_choice
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| "none".to_string());
    let mut failures = 0usize;
    let mut hint = ResolveHint::Cached;
    loop {
        if session.cancel_token.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        session.emit(ProgressEvent::CompletionStarted {
            turn: state.turns,
            attempt: failures,
            tool_choice: tool_choice.clone(),
        });
        let call_started = Instant::now();
        state.completions += 1;
        let call = session.backend.complete(request.clone(), hint);
        let result = tokio::select! {
            _ = session.cancel_token.cancelled() => return Err(RelayError::Cancelled),
            r = tokio::time::timeout(session.completion_timeout, call) => r,
        };
        let elapsed_ms = call_started.elapsed().as_millis() as u64;
        let err = match result {
            Ok(Ok(reply)) => {
                session.emit(ProgressEvent::CompletionFinished {
                    turn: state.turns,
                    tool_calls: reply.tool_calls.len(),
                    elapsed_ms,
                });
                return Ok(reply);
            }
            Ok(Err(e)) => e,
            // 单次调用超时归入可重试的补全错误；CompletionTimeout 只留给执行桥的整轮上限
            Err(_) => RelayError::Completion {
                message: format!("completion call timed out after {elapsed_ms} ms"),
                timed_out: true,
            },
        };

        failures += 1;
        let prefer_alternate = match session
            .recovery
            .handle(&err, failures, session.backend.candidate_count())
        {
            RecoveryAction::RetrySame => {
                hint = ResolveHint::Refresh;
                false
            }
            RecoveryAction::RetryAlternate => {
                hint = ResolveHint::PreferAlternate;
                true
            }
            _ => {
                tracing::error!(error = %err, failures, "completion failed, giving up");
                return Err(err);
            }
        };
        tracing::warn!(error = %err, failures, prefer_alternate, "completion failed, retrying");
        session.emit(ProgressEvent::Retrying {
            attempt: failures,
            max_retries: session.recovery.max_retries(),
            prefer_alternate,
            reason: err.to_string(),
        });
        let backoff = session.retry_backoff * failures as u32;
        tokio::select! {
            _ = session.cancel_token.cancelled() => return Err(RelayError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// 执行单个工具调用，返回写入 ToolResult 的文本；错误一律转为文本结果
async fn run_tool_call(session: &EngineSession, state: &mut TurnState, call: &ToolCall) -> String {
    session.emit(ProgressEvent::ToolStarted {
        tool: call.name.clone(),
        call_id: call.id.clone(),
    });

    let parsed: Result<Value, RelayError> = if call.arguments.trim().is_empty() {
        Ok(Value::Object(Default::default()))
    } else {
        serde_json::from_str(&call.arguments).map_err(|e| RelayError::ToolArgument {
            tool: call.name.clone(),
            message: e.to_string(),
        })
    };

    let (outcome, cached) = match parsed {
        Err(e) => (to_error_outcome(session, &e), false),
        Ok(args) => match state.cache.get(&call.name, &args) {
            Some(hit) => (hit.clone(), true),
            None => {
                let outcome = match session.executor.execute(&call.name, args.clone()).await {
                    Ok(output) => ToolOutcome { output, ok: true },
                    Err(e) => to_error_outcome(session, &e),
                };
                state.cache.insert(&call.name, &args, outcome.clone());
                (outcome, false)
            }
        },
    };

    if outcome.ok && !cached {
        state.successes.push((call.name.clone(), outcome.output.clone()));
    }
    session.emit(ProgressEvent::ToolFinished {
        tool: call.name.clone(),
        call_id: call.id.clone(),
        ok: outcome.ok,
        cached,
        preview: preview(&outcome.output, TOOL_PREVIEW_CHARS),
    });
    outcome.output
}

fn to_error_outcome(session: &EngineSession, err: &RelayError) -> ToolOutcome {
    let output = match session.recovery.handle(err, 1, 0) {
        RecoveryAction::ToolResult(text) => text,
        _ => format!("Error: {err}"),
    };
    ToolOutcome { output, ok: false }
}

/// 由成功的工具结果合成兜底答案（最多 5 条，逐条截断）
pub fn fallback_answer(successes: &[(String, String)]) -> String {
    let mut answer = String::from(
        "I could not get a final answer from the model, but these are the results gathered so far:\n",
    );
    for (i, (tool, output)) in successes.iter().take(MAX_FALLBACK_OUTPUTS).enumerate() {
        answer.push_str(&format!(
            "\n{}. {tool}: {}",
            i + 1,
            preview(output, FALLBACK_OUTPUT_CHARS)
        ));
    }
    answer
}
