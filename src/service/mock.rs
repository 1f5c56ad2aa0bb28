//! 脚本化补全服务（用于测试，无需网络）
//!
//! 每个服务按顺序弹出预设的负载；脚本耗尽后返回 error 负载。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::service::{CompletionRequest, CompletionService, ServiceConnector};

#[derive(Debug, Clone)]
enum Step {
    Payload(Value),
    Transport(String),
    Stall(Duration),
}

/// 按脚本回复的服务
pub struct ScriptedService {
    id: String,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedService {
    pub fn new(id: impl Into<String>, payloads: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            steps: Mutex::new(payloads.into_iter().map(Step::Payload).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, payload: Value) -> Self {
        self.push(Step::Payload(payload));
        self
    }

    /// 追加一次传输失败
    pub fn with_transport_failure(self, message: impl Into<String>) -> Self {
        self.push(Step::Transport(message.into()));
        self
    }

    /// 追加一次挂起：睡眠 duration 后返回超时错误负载
    pub fn with_stall(self, duration: Duration) -> Self {
        self.push(Step::Stall(duration));
        self
    }

    fn push(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    /// 收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Value, String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match step {
            Some(Step::Payload(payload)) => Ok(payload),
            Some(Step::Transport(message)) => Err(message),
            Some(Step::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(json!({ "error": "Request timed out" }))
            }
            None => Ok(json!({ "error": format!("script for {} exhausted", self.id) })),
        }
    }
}

/// 固定服务表的连接器；未登记或标记为不可达的候选连接失败
#[derive(Clone, Default)]
pub struct StaticConnector {
    services: Arc<Mutex<HashMap<String, Arc<ScriptedService>>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    connects: Arc<AtomicUsize>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service: ScriptedService) -> Self {
        self.add(Arc::new(service));
        self
    }

    pub fn add(&self, service: Arc<ScriptedService>) {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.id.clone(), service);
    }

    pub fn with_unreachable(self, candidate: impl Into<String>) -> Self {
        self.unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(candidate.into());
        self
    }

    /// 成功建立的连接数
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceConnector for StaticConnector {
    async fn connect(&self, candidate: &str) -> Result<Arc<dyn CompletionService>, String> {
        if self
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(candidate)
        {
            return Err("connection refused".to_string());
        }
        let service = self
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(candidate)
            .cloned()
            .ok_or_else(|| format!("service {candidate} not found"))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(service as Arc<dyn CompletionService>)
    }
}
