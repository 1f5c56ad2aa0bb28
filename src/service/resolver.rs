//! 服务解析器
//!
//! 按优先级遍历候选服务，成功的绑定缓存起来供后续补全复用；
//! 刷新时重新遍历 候选 × 次数，「优先备用」时轮转优先级，避免持续失败的主服务饿死备用服务。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use crate::config::ServiceSection;
use crate::core::RelayError;
use crate::service::alias::candidate_list;
use crate::service::wire;
use crate::service::{
    AssistantReply, CompletionBackend, CompletionRequest, CompletionService, ResolveHint,
    ServiceConnector,
};

pub struct ServiceResolver {
    candidates: RwLock<Vec<String>>,
    candidate_count: usize,
    connector: Arc<dyn ServiceConnector>,
    binding: RwLock<Option<Arc<dyn CompletionService>>>,
    attempts: usize,
    backoff: Duration,
    attempt_timeout: Duration,
    bound_tx: watch::Sender<Option<String>>,
    round_trips: AtomicU64,
}

impl ServiceResolver {
    pub fn new(candidates: Vec<String>, connector: Arc<dyn ServiceConnector>) -> Self {
        let (bound_tx, _) = watch::channel(None);
        Self {
            candidate_count: candidates.len(),
            candidates: RwLock::new(candidates),
            connector,
            binding: RwLock::new(None),
            attempts: 2,
            backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            bound_tx,
            round_trips: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &ServiceSection, connector: Arc<dyn ServiceConnector>) -> Self {
        Self::new(candidate_list(cfg), connector)
            .with_attempts(cfg.resolve_attempts)
            .with_backoff(Duration::from_millis(cfg.resolve_backoff_ms))
            .with_attempt_timeout(Duration::from_secs(cfg.resolve_timeout_secs))
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// 订阅当前绑定的候选标识
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.bound_tx.subscribe()
    }

    pub fn bound_id(&self) -> Option<String> {
        self.bound_tx.borrow().clone()
    }

    /// 已完成的补全往返次数
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub async fn candidates(&self) -> Vec<String> {
        self.candidates.read().await.clone()
    }

    /// 丢弃缓存的绑定（下次调用重新解析）
    pub async fn invalidate(&self) {
        self.binding.write().await.take();
    }

    pub async fn resolve(&self, hint: ResolveHint) -> Result<Arc<dyn CompletionService>, RelayError> {
        match hint {
            ResolveHint::Cached => {
                if let Some(svc) = self.binding.read().await.as_ref() {
                    return Ok(svc.clone());
                }
            }
            ResolveHint::Refresh => self.invalidate().await,
            ResolveHint::PreferAlternate => {
                self.invalidate().await;
                self.rotate().await;
            }
        }
        self.resolve_fresh().await
    }

    /// 最近绑定的候选移到末尾；没有绑定记录时整体左移一位
    async fn rotate(&self) {
        let last = self.bound_id();
        let mut candidates = self.candidates.write().await;
        if candidates.len() < 2 {
            return;
        }
        match last.and_then(|id| candidates.iter().position(|c| *c == id)) {
            Some(pos) => {
                let moved = candidates.remove(pos);
                candidates.push(moved);
            }
            None => candidates.rotate_left(1),
        }
        tracing::debug!(order = ?*candidates, "candidate priority rotated");
    }

    async fn resolve_fresh(&self) -> Result<Arc<dyn CompletionService>, RelayError> {
        let candidates = self.candidates.read().await.clone();
        if candidates.is_empty() {
            return Err(RelayError::Resolution {
                attempts: 0,
                last: "no service candidates configured".to_string(),
            });
        }

        let mut tried = 0usize;
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            for candidate in &candidates {
                tried += 1;
                let result =
                    tokio::time::timeout(self.attempt_timeout, self.connector.connect(candidate))
                        .await;
                match result {
                    Ok(Ok(svc)) => {
                        tracing::info!(candidate = %candidate, attempt, "service bound");
                        *self.binding.write().await = Some(svc.clone());
                        self.bound_tx.send_replace(Some(candidate.clone()));
                        return Ok(svc);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(candidate = %candidate, attempt, error = %e, "service unreachable");
                        last = format!("{candidate}: {e}");
                    }
                    Err(_) => {
                        tracing::warn!(candidate = %candidate, attempt, "service resolution timed out");
                        last = format!(
                            "{candidate}: timed out after {} ms",
                            self.attempt_timeout.as_millis()
                        );
                    }
                }
            }
            if attempt < self.attempts {
                let exp = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(6);
                tokio::time::sleep(self.backoff * 2u32.pow(exp)).await;
            }
        }
        Err(RelayError::Resolution {
            attempts: tried,
            last,
        })
    }

    /// 在指定绑定上完成一次补全（计入往返次数）；传输失败使绑定失效
    pub async fn complete_on(
        &self,
        svc: &Arc<dyn CompletionService>,
        request: &CompletionRequest,
    ) -> Result<AssistantReply, RelayError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        match svc.complete(request).await {
            Ok(payload) => wire::parse_reply(&payload),
            Err(e) => {
                tracing::warn!(service = %svc.id(), error = %e, "completion transport failed");
                self.invalidate().await;
                let timed_out = wire::is_timeout_phrase(&e);
                Err(RelayError::Completion {
                    message: e,
                    timed_out,
                })
            }
        }
    }
}

#[async_trait]
impl CompletionBackend for ServiceResolver {
    async fn complete(
        &self,
        request: CompletionRequest,
        hint: ResolveHint,
    ) -> Result<AssistantReply, RelayError> {
        let svc = self.resolve(hint).await?;
        self.complete_on(&svc, &request).await
    }

    fn candidate_count(&self) -> usize {
        self.candidate_count
    }
}
