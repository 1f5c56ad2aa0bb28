//! 执行桥：在沙箱中跑一轮引擎
//!
//! 负责中继补全请求、解析响应标记、汇总进度事件；整轮受总超时约束（报告到达的阶段），
//! 瞬时沙箱故障（模板语法 / 超时 / 代理不可用）中断并重建后整轮重试，用户取消立即以 Cancelled 结束。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

use crate::bridge::marker::{MarkerPayload, MarkerScanner};
use crate::bridge::sandbox::{RelayCall, Sandbox, SandboxEvent, SandboxRequest, SandboxStatus};
use crate::config::BridgeSection;
use crate::conversation::{trim_dangling_calls, Message};
use crate::core::{FaultKind, RecoveryAction, RecoveryEngine, RelayError, Stage, StageTracker};
use crate::engine::events::send_event;
use crate::engine::{EngineFailure, EngineOutcome, ProgressEvent};
use crate::service::{CompletionBackend, ServiceResolver};

/// 单次尝试的结束方式
enum AttemptEnd {
    Finished(Result<EngineOutcome, EngineFailure>),
    Fault(RelayError, Vec<Message>),
    Cancelled(Vec<Message>),
    TimedOut(Vec<Message>),
}

pub struct ExecutionBridge {
    sandbox: Arc<dyn Sandbox>,
    host: Arc<ServiceResolver>,
    overall_timeout: Duration,
    max_attempts: usize,
}

impl ExecutionBridge {
    pub fn new(sandbox: Arc<dyn Sandbox>, host: Arc<ServiceResolver>) -> Self {
        Self {
            sandbox,
            host,
            overall_timeout: Duration::from_secs(300),
            max_attempts: 3,
        }
    }

    pub fn with_config(self, cfg: &BridgeSection) -> Self {
        self.with_overall_timeout(Duration::from_secs(cfg.overall_timeout_secs))
            .with_max_attempts(cfg.max_attempts)
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn host(&self) -> &Arc<ServiceResolver> {
        &self.host
    }

    /// 执行一轮；失败时 partial 中是已追加且 id 对应完整的消息
    pub async fn run(
        &self,
        history: Vec<Message>,
        cancel: CancellationToken,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<EngineOutcome, EngineFailure> {
        let started = Instant::now();
        let deadline = TokioInstant::now() + self.overall_timeout;
        let stage = StageTracker::new();
        let recovery = RecoveryEngine::new(self.max_attempts - 1, Default::default());

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            stage.set(Stage::Starting);
            let end = self
                .attempt(&history, &stage, deadline, &cancel, events.as_ref())
                .await;
            let (error, partial) = match end {
                AttemptEnd::Finished(Ok(outcome)) => return Ok(outcome),
                AttemptEnd::Finished(Err(failure)) => (failure.error, failure.partial),
                AttemptEnd::Fault(error, partial) => (error, partial),
                AttemptEnd::Cancelled(partial) => {
                    tracing::info!(attempt, "turn cancelled");
                    return Err(settle(RelayError::Cancelled, partial));
                }
                AttemptEnd::TimedOut(partial) => {
                    let error = RelayError::CompletionTimeout {
                        stage: stage.get(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    tracing::warn!(error = %error, "bridge round-trip timed out");
                    return Err(settle(error, partial));
                }
            };

            let (fault, message) = match &error {
                RelayError::Sandbox { fault, message } => (*fault, message.clone()),
                _ => return Err(settle(error, partial)),
            };
            match recovery.handle(&error, attempt, 0) {
                RecoveryAction::RestartSandbox => {
                    tracing::warn!(attempt, fault = %fault, message = %message, "transient sandbox fault, restarting");
                    send_event(
                        events.as_ref(),
                        ProgressEvent::SandboxRetry {
                            attempt,
                            fault,
                            message,
                        },
                    );
                    self.sandbox.interrupt().await;
                    if let Err(e) = self.sandbox.reset().await {
                        return Err(settle(e, partial));
                    }
                }
                _ => return Err(settle(error, partial)),
            }
        }
    }

    async fn attempt(
        &self,
        history: &[Message],
        stage: &StageTracker,
        deadline: TokioInstant,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<ProgressEvent>>,
    ) -> AttemptEnd {
        let request = SandboxRequest {
            history: history.to_vec(),
            stage: stage.clone(),
            candidates: self.host.candidate_count(),
        };
        let mut rx = match self.sandbox.execute(request).await {
            Ok(rx) => rx,
            Err(e) => return AttemptEnd::Fault(e, Vec::new()),
        };

        let mut scanner = MarkerScanner::new();
        let mut payload: Option<MarkerPayload> = None;
        let mut partial: Vec<Message> = Vec::new();
        let mut relays: Vec<JoinHandle<()>> = Vec::new();

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.sandbox.interrupt().await;
                    break AttemptEnd::Cancelled(partial);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.sandbox.interrupt().await;
                    break AttemptEnd::TimedOut(partial);
                }
                ev = rx.recv() => match ev {
                    Some(SandboxEvent::Output(chunk)) => {
                        if payload.is_none() {
                            match scanner.push(&chunk) {
                                Ok(found) => payload = found,
                                Err(e) => {
                                    self.sandbox.interrupt().await;
                                    break AttemptEnd::Fault(e, partial);
                                }
                            }
                        }
                    }
                    Some(SandboxEvent::Diagnostic(line)) => {
                        tracing::warn!(line = %line, "sandbox diagnostic");
                        send_event(events, ProgressEvent::Warning { text: line });
                    }
                    Some(SandboxEvent::Progress(ev)) => {
                        if let ProgressEvent::MessageAppended { message } = &ev {
                            partial.push(message.clone());
                        }
                        send_event(events, ev);
                    }
                    Some(SandboxEvent::Relay(call)) => {
                        relays.retain(|h| !h.is_finished());
                        relays.push(tokio::spawn(relay(self.host.clone(), stage.clone(), call)));
                    }
                    Some(SandboxEvent::Status(SandboxStatus::Completed)) | None => {
                        break match payload.take() {
                            Some(p) => AttemptEnd::Finished(p.into_result()),
                            None => AttemptEnd::Fault(
                                RelayError::sandbox(
                                    FaultKind::Engine,
                                    "sandbox finished without a response payload",
                                ),
                                partial,
                            ),
                        };
                    }
                    Some(SandboxEvent::Status(SandboxStatus::Failed { fault, message })) => {
                        send_event(events, ProgressEvent::Error { text: format!("sandbox {fault} fault: {message}") });
                        break AttemptEnd::Fault(RelayError::sandbox(fault, message), partial);
                    }
                },
            }
        };

        // 放弃仍在进行中的中继调用
        for handle in relays {
            handle.abort();
        }
        end
    }
}

/// 主机侧中继：解析（Resolution）后补全（Completion），结果回传沙箱
async fn relay(host: Arc<ServiceResolver>, stage: StageTracker, call: RelayCall) {
    stage.set(Stage::Resolution);
    let result = match host.resolve(call.hint).await {
        Ok(svc) => {
            stage.set(Stage::Completion);
            host.complete_on(&svc, &call.request).await
        }
        Err(e) => Err(e),
    };
    let _ = call.reply.send(result);
}

fn settle(error: RelayError, mut partial: Vec<Message>) -> EngineFailure {
    trim_dangling_calls(&mut partial);
    EngineFailure { error, partial }
}
