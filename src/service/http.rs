//! OpenAI 兼容的 HTTP 补全服务
//!
//! 连接时以 `GET {endpoint}/models` 探测可达性（5xx 与 404 视为不可达），
//! 补全走 `POST {endpoint}/chat/completions`。非 2xx 响应体原样包装成 {error} 负载交给上层判定。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::config::ServiceSection;
use crate::service::alias::candidate_endpoint;
use crate::service::wire::request_body;
use crate::service::{CompletionRequest, CompletionService, ServiceConnector};

pub struct HttpConnector {
    client: Client,
    server_url: String,
    api_key: Option<String>,
}

impl HttpConnector {
    pub fn new(cfg: &ServiceSection) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| e.to_string())?;
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            client,
            server_url: cfg.server_url.clone(),
            api_key,
        })
    }
}

fn is_reachable_status(status: StatusCode) -> bool {
    !(status.is_server_error() || status == StatusCode::NOT_FOUND)
}

#[async_trait]
impl ServiceConnector for HttpConnector {
    async fn connect(&self, candidate: &str) -> Result<Arc<dyn CompletionService>, String> {
        let endpoint = candidate_endpoint(candidate, &self.server_url);
        let mut check = self.client.get(format!("{endpoint}/models"));
        if let Some(key) = &self.api_key {
            check = check.bearer_auth(key);
        }
        let resp = check.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if !is_reachable_status(status) {
            return Err(format!("health check {endpoint}/models answered {status}"));
        }
        tracing::debug!(candidate = %candidate, endpoint = %endpoint, "service health check ok");
        Ok(Arc::new(HttpCompletionService {
            id: candidate.to_string(),
            endpoint,
            client: self.client.clone(),
            api_key: self.api_key.clone(),
        }) as Arc<dyn CompletionService>)
    }
}

pub struct HttpCompletionService {
    id: String,
    endpoint: String,
    client: Client,
    api_key: Option<String>,
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Value, String> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&request_body(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| e.to_string())?;
        Ok(payload_from_body(status, &text))
    }
}

/// 响应体转为负载：合法 JSON 原样返回（非 2xx 且缺少 error 时补上）；否则包装成 {error}
fn payload_from_body(status: StatusCode, text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if status.is_success() || value.get("error").is_some() => value,
        Ok(value) => json!({ "error": format!("HTTP {status}: {value}") }),
        Err(_) if status.is_success() => json!({ "error": format!("invalid JSON body: {text}") }),
        Err(_) => json!({ "error": format!("HTTP {status}: {text}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_status() {
        assert!(is_reachable_status(StatusCode::OK));
        assert!(is_reachable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_reachable_status(StatusCode::NOT_FOUND));
        assert!(!is_reachable_status(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_payload_from_body() {
        let ok = payload_from_body(StatusCode::OK, r#"{"choices": []}"#);
        assert!(ok.get("choices").is_some());

        let gateway = payload_from_body(StatusCode::GATEWAY_TIMEOUT, "upstream request timeout");
        assert!(gateway["error"].as_str().unwrap().contains("timeout"));

        let keeps = payload_from_body(StatusCode::BAD_REQUEST, r#"{"error": {"message": "bad"}}"#);
        assert_eq!(keeps["error"]["message"], "bad");
    }
}
