//! 执行桥：沙箱抽象、响应标记协议与整轮执行（超时、重试、取消）

pub mod marker;
pub mod runner;
pub mod sandbox;

pub use marker::{chunk_text, MarkerPayload, MarkerScanner, RESPONSE_MARKER};
pub use runner::ExecutionBridge;
pub use sandbox::{
    LocalSandbox, RelayCall, Sandbox, SandboxEvent, SandboxRequest, SandboxStatus,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::conversation::{Message, Role};
    use crate::core::{FaultKind, RelayError, Stage};
    use crate::engine::ProgressEvent;
    use crate::service::mock::{ScriptedService, StaticConnector};
    use crate::service::wire::{text_payload, tool_calls_payload};
    use crate::service::ServiceResolver;
    use crate::tools::{EchoTool, FnTool, ToolRegistry};

    fn host(svc: Arc<ScriptedService>) -> Arc<ServiceResolver> {
        let connector = StaticConnector::new();
        connector.add(svc);
        Arc::new(
            ServiceResolver::new(vec!["svc".into()], Arc::new(connector))
                .with_backoff(Duration::from_millis(1)),
        )
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FnTool::<Value>::new("slow", "Sleeps for a while", |_args| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("late"))
        }));
        Arc::new(registry)
    }

    /// 前 failures 次执行直接报告瞬时故障，之后交给内部沙箱
    struct FlakySandbox {
        inner: LocalSandbox,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for FlakySandbox {
        async fn execute(
            &self,
            request: SandboxRequest,
        ) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, RelayError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(SandboxEvent::Diagnostic("DeprecationWarning: ignored".into()));
                let _ = tx.send(SandboxEvent::Status(SandboxStatus::Failed {
                    fault: FaultKind::ProxyUnavailable,
                    message: "proxy not ready".into(),
                }));
                return Ok(rx);
            }
            self.inner.execute(request).await
        }

        async fn interrupt(&self) {
            self.inner.interrupt().await;
        }

        async fn reset(&self) -> Result<(), RelayError> {
            self.inner.reset().await
        }
    }

    #[tokio::test]
    async fn test_local_sandbox_round_trip_and_discovery_cache() {
        let svc = Arc::new(
            ScriptedService::new(
                "svc",
                vec![tool_calls_payload(&[("c1", "echo", json!({"text": "hit"}))])],
            )
            .then(text_payload("first answer"))
            .then(text_payload("second answer")),
        );
        let resolver = host(svc);
        let sandbox = Arc::new(LocalSandbox::new(registry()).with_chunk_size(16));
        let bridge = ExecutionBridge::new(sandbox.clone(), resolver.clone());

        let outcome = bridge
            .run(vec![Message::user("go")], CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "first answer");
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(resolver.round_trips(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = bridge
            .run(vec![Message::user("again")], CancellationToken::new(), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome.reply, "second answer");
        assert_eq!(sandbox.discoveries(), 1);
        let mut cached = false;
        while let Ok(ev) = rx.try_recv() {
            if let ProgressEvent::ToolsDiscovered { cached: c, .. } = ev {
                cached = c;
            }
        }
        assert!(cached);
    }

    #[tokio::test]
    async fn test_transient_fault_restarts_sandbox() {
        let svc = Arc::new(ScriptedService::new("svc", vec![text_payload("recovered")]));
        let sandbox = Arc::new(FlakySandbox {
            inner: LocalSandbox::new(registry()),
            failures: AtomicUsize::new(1),
        });
        let bridge = ExecutionBridge::new(sandbox.clone(), host(svc));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = bridge
            .run(vec![Message::user("go")], CancellationToken::new(), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome.reply, "recovered");
        assert_eq!(sandbox.inner.resets(), 1);

        let mut retried = false;
        let mut warned = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                ProgressEvent::SandboxRetry { fault, .. } => {
                    retried = fault == FaultKind::ProxyUnavailable;
                }
                ProgressEvent::Warning { text } => warned = text.contains("DeprecationWarning"),
                _ => {}
            }
        }
        assert!(retried);
        assert!(warned);
    }

    #[tokio::test]
    async fn test_fault_retries_are_bounded() {
        let svc = Arc::new(ScriptedService::new("svc", vec![text_payload("never")]));
        let sandbox = Arc::new(FlakySandbox {
            inner: LocalSandbox::new(registry()),
            failures: AtomicUsize::new(5),
        });
        let bridge = ExecutionBridge::new(sandbox.clone(), host(svc)).with_max_attempts(3);

        let failure = bridge
            .run(vec![Message::user("go")], CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            RelayError::Sandbox {
                fault: FaultKind::ProxyUnavailable,
                ..
            }
        ));
        assert_eq!(sandbox.inner.resets(), 2);
    }

    #[tokio::test]
    async fn test_overall_timeout_reports_stage() {
        let svc = Arc::new(ScriptedService::new("svc", vec![]).with_stall(Duration::from_secs(10)));
        let bridge = ExecutionBridge::new(Arc::new(LocalSandbox::new(registry())), host(svc))
            .with_overall_timeout(Duration::from_millis(200));

        let failure = bridge
            .run(vec![Message::user("go")], CancellationToken::new(), None)
            .await
            .unwrap_err();
        match failure.error {
            RelayError::CompletionTimeout { stage, elapsed_ms } => {
                assert_eq!(stage, Stage::Completion);
                assert!(elapsed_ms >= 200);
                assert!(elapsed_ms < 5_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_consistent_partial_history() {
        let svc = Arc::new(
            ScriptedService::new(
                "svc",
                vec![tool_calls_payload(&[("c1", "echo", json!({"text": "kept"}))])],
            )
            .then(tool_calls_payload(&[("c2", "slow", json!({}))])),
        );
        let bridge = ExecutionBridge::new(Arc::new(LocalSandbox::new(registry())), host(svc));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let failure = bridge
            .run(vec![Message::user("go")], cancel, None)
            .await
            .unwrap_err();
        assert_eq!(failure.error, RelayError::Cancelled);
        // 未完成的第二组工具调用被剪掉
        assert_eq!(failure.partial.len(), 2);
        assert_eq!(failure.partial[0].role, Role::Assistant);
        assert_eq!(failure.partial[1].content, "kept");
    }
}
