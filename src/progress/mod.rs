//! 进度汇报：心跳 + 执行事件 → 每条消息的执行轨迹
//!
//! 维护一条滚动摘要与只追加、有上限的明细列表；超出上限的明细只计数不再记录。
//! 轨迹仅供事后查看，不参与任何控制决策。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::ProgressEvent;

/// 明细中工具预览的最大字符数
const PREVIEW_CHARS: usize = 120;

/// 附加在消息上的执行轨迹快照
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressTrace {
    pub summary: String,
    pub details: Vec<String>,
    /// 因超过上限而未记录的明细条数
    #[serde(default)]
    pub dropped: usize,
}

#[derive(Debug)]
struct ReporterState {
    summary: String,
    details: Vec<String>,
    dropped: usize,
    ticks: u64,
}

/// 进度汇报器；可克隆，克隆体共享同一份状态
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    state: Arc<Mutex<ReporterState>>,
    max_details: usize,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(max_details: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReporterState {
                summary: "Starting".to_string(),
                details: Vec::new(),
                dropped: 0,
                ticks: 0,
            })),
            max_details,
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_summary(&self, summary: impl Into<String>) {
        self.lock().summary = summary.into();
    }

    pub fn push_detail(&self, line: impl Into<String>) {
        let mut state = self.lock();
        if state.details.len() < self.max_details {
            state.details.push(line.into());
        } else {
            state.dropped += 1;
        }
    }

    /// 心跳：只刷新摘要中的耗时，不写明细
    pub fn tick(&self) {
        let elapsed = self.started.elapsed().as_secs();
        let mut state = self.lock();
        state.ticks += 1;
        let base = state
            .summary
            .split(" (")
            .next()
            .unwrap_or_default()
            .to_string();
        state.summary = format!("{base} ({elapsed}s)");
    }

    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    /// 将执行事件整理为摘要 / 明细
    pub fn record(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ToolsDiscovered { names, cached } => {
                let origin = if *cached { "cached" } else { "discovered" };
                self.push_detail(format!("{} tools {origin}: {}", names.len(), names.join(", ")));
            }
            ProgressEvent::CompletionStarted {
                turn,
                attempt,
                tool_choice,
            } => {
                self.set_summary(format!("Waiting for model (turn {})", turn + 1));
                self.push_detail(format!(
                    "completion call turn={} attempt={} tool_choice={tool_choice}",
                    turn + 1,
                    attempt + 1
                ));
            }
            ProgressEvent::CompletionFinished {
                turn,
                tool_calls,
                elapsed_ms,
            } => {
                self.push_detail(format!(
                    "completion done turn={} tool_calls={tool_calls} in {elapsed_ms} ms",
                    turn + 1
                ));
            }
            ProgressEvent::Retrying {
                attempt,
                max_retries,
                prefer_alternate,
                reason,
            } => {
                let target = if *prefer_alternate {
                    " on alternate service"
                } else {
                    ""
                };
                self.set_summary("Retrying model call");
                self.push_detail(format!(
                    "retrying completion ({attempt}/{max_retries}){target}: {reason}"
                ));
            }
            ProgressEvent::ToolStarted { tool, .. } => {
                self.set_summary(format!("Running {tool}"));
                self.push_detail(format!("tool {tool} started"));
            }
            ProgressEvent::ToolFinished {
                tool,
                ok,
                cached,
                preview,
                ..
            } => {
                let status = match (ok, cached) {
                    (_, true) => "reused",
                    (true, false) => "ok",
                    (false, false) => "failed",
                };
                let preview: String = preview.chars().take(PREVIEW_CHARS).collect();
                self.push_detail(format!("tool {tool} {status}: {preview}"));
            }
            ProgressEvent::SoftDeadline { elapsed_ms } => {
                self.set_summary("Finalizing answer");
                self.push_detail(format!("soft deadline reached after {elapsed_ms} ms"));
            }
            ProgressEvent::ForcedFinalize { reason } => {
                self.set_summary("Finalizing answer");
                self.push_detail(format!("forced finalize: {reason}"));
            }
            ProgressEvent::Fallback { tool_outputs } => {
                self.push_detail(format!("fallback answer from {tool_outputs} tool outputs"));
            }
            ProgressEvent::MessageAppended { .. } => {}
            ProgressEvent::SandboxRetry {
                attempt,
                fault,
                message,
            } => {
                self.set_summary("Restarting sandbox");
                self.push_detail(format!("sandbox {fault} fault, retrying attempt {attempt}: {message}"));
            }
            ProgressEvent::Warning { text } => self.push_detail(format!("warning: {text}")),
            ProgressEvent::Error { text } => {
                self.set_summary("Failed");
                self.push_detail(format!("error: {text}"));
            }
        }
    }

    pub fn snapshot(&self) -> ProgressTrace {
        let state = self.lock();
        ProgressTrace {
            summary: state.summary.clone(),
            details: state.details.clone(),
            dropped: state.dropped,
        }
    }

    /// 启动心跳任务，token 取消后退出
    pub fn spawn_heartbeat(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => reporter.tick(),
                }
            }
        })
    }
}
