//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时，execute(tool_name, args) 在超时内调用工具并捕获 panic，
//! 超时、失败或 panic 统一转为 RelayError::ToolExecution；每次调用输出结构化审计日志（JSON）。
//! TurnCache 保证同一轮内相同工具 + 结构相同的参数只真正执行一次。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::RelayError;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并将结果映射为 RelayError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行指定工具，返回已转为文本的输出；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<String, RelayError> {
        let start = Instant::now();
        let args_preview = preview(&args.to_string(), 200);
        let Some(tool) = self.registry.get(tool_name) else {
            return Err(RelayError::ToolExecution {
                tool: tool_name.to_string(),
                message: format!("unknown tool '{tool_name}'"),
            });
        };
        let call = AssertUnwindSafe(tool.execute(args)).catch_unwind();
        let result = timeout(self.timeout, call).await;

        let outcome = match &result {
            Ok(Ok(Ok(_))) => "ok",
            Ok(Ok(Err(_))) => "error",
            Ok(Err(_)) => "panic",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let failed = |message: String| RelayError::ToolExecution {
            tool: tool_name.to_string(),
            message,
        };
        match result {
            Ok(Ok(Ok(value))) => Ok(coerce_to_text(value)),
            Ok(Ok(Err(e))) => Err(failed(e)),
            Ok(Err(panic)) => Err(failed(format!("panicked: {}", panic_message(&*panic)))),
            Err(_) => Err(failed(format!("timed out after {} ms", self.timeout.as_millis()))),
        }
    }
}

/// 工具返回值统一转为文本：字符串原样，其余序列化为 JSON
pub fn coerce_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 参数的规范化形式：对象键排序、无多余空白，用作缓存键
pub fn canonical_args(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// 一次工具调用的结果（已转为文本）
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub ok: bool,
}

/// 单轮工具结果缓存，键为 (工具名, 规范化参数)
#[derive(Debug, Default)]
pub struct TurnCache {
    entries: HashMap<(String, String), ToolOutcome>,
}

impl TurnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, args: &Value) -> Option<&ToolOutcome> {
        self.entries.get(&(name.to_string(), canonical_args(args)))
    }

    pub fn insert(&mut self, name: &str, args: &Value, outcome: ToolOutcome) {
        self.entries
            .insert((name.to_string(), canonical_args(args)), outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool};
    use serde::Deserialize;

    #[derive(Deserialize, schemars::JsonSchema)]
    struct Nothing {}

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FnTool::<Nothing>::sync("explode", "always panics", |_| {
            panic!("kaboom")
        }));
        registry.register(FnTool::<Nothing>::new("slow", "sleeps", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }));
        registry.register(FnTool::<Nothing>::sync("structured", "returns json", |_| {
            Ok(serde_json::json!({"total": 2}))
        }));
        ToolExecutor::new(Arc::new(registry), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_execute_ok_and_coerced() {
        let exec = executor();
        let out = exec.execute("echo", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        let out = exec.execute("structured", serde_json::json!({})).await.unwrap();
        assert_eq!(out, r#"{"total":2}"#);
    }

    #[tokio::test]
    async fn test_panic_and_timeout_become_errors() {
        let exec = executor();
        match exec.execute("explode", serde_json::json!({})).await {
            Err(RelayError::ToolExecution { message, .. }) => assert!(message.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }
        match exec.execute("slow", serde_json::json!({})).await {
            Err(RelayError::ToolExecution { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(exec.execute("nope", Value::Null).await.is_err());
    }

    #[test]
    fn test_canonical_args_ignore_key_order() {
        let a: Value = serde_json::from_str(r#"{"query":"mouse","limit":5,"opts":{"b":1,"a":[2,{"y":1,"x":0}]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"opts":{"a":[2,{"x":0,"y":1}],"b":1},"limit":5,"query":"mouse"}"#).unwrap();
        assert_eq!(canonical_args(&a), canonical_args(&b));
        assert_ne!(canonical_args(&a), canonical_args(&serde_json::json!({"query": "mouse"})));
    }

    #[test]
    fn test_turn_cache() {
        let mut cache = TurnCache::new();
        let args = serde_json::json!({"b": 1, "a": 2});
        cache.insert("t", &args, ToolOutcome { output: "x".into(), ok: true });
        assert!(cache.get("t", &serde_json::json!({"a": 2, "b": 1})).is_some());
        assert!(cache.get("other", &args).is_none());
        assert_eq!(cache.len(), 1);
    }
}
