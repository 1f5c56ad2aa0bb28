//! OpenAI 兼容的请求 / 响应格式
//!
//! 任何带 error 字段的负载、裸字符串负载或缺少 choices 的负载都视为补全失败；
//! 含超时字样的失败标记为 timed_out，便于日志区分。

use serde_json::{json, Value};

use crate::conversation::{Message, Role, ToolCall};
use crate::core::RelayError;
use crate::service::{AssistantReply, CompletionRequest};

const TIMEOUT_PHRASES: &[&str] = &["timed out", "timeout", "time out", "deadline exceeded"];

pub fn is_timeout_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    TIMEOUT_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if msg.has_tool_calls() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                Value::from(msg.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        role => json!({ "role": role.as_str(), "content": msg.content }),
    }
}

pub fn request_body(request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|spec| {
                json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        if let Some(choice) = request.tool_choice {
            body["tool_choice"] = Value::from(choice.as_str());
        }
    }
    body
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn failure(message: String) -> RelayError {
    let timed_out = is_timeout_phrase(&message);
    RelayError::Completion { message, timed_out }
}

/// 解析补全负载
pub fn parse_reply(payload: &Value) -> Result<AssistantReply, RelayError> {
    if let Value::String(text) = payload {
        return Err(failure(text.clone()));
    }
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        return Err(failure(error_text(error)));
    }
    let message = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| RelayError::completion("completion payload has no choices"))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| parse_tool_call(i, call))
                .collect()
        })
        .unwrap_or_default();
    Ok(AssistantReply {
        content,
        tool_calls,
    })
}

fn parse_tool_call(index: usize, call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

/// 测试与模拟服务使用的负载构造
pub fn text_payload(content: &str) -> Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

pub fn tool_calls_payload(calls: &[(&str, &str, Value)]) -> Value {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| {
            json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": args.to_string() },
            })
        })
        .collect();
    json!({ "choices": [{ "message": { "role": "assistant", "content": null, "tool_calls": calls } }] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ToolChoice;
    use crate::tools::ToolSpec;

    #[test]
    fn test_error_payloads_fail() {
        match parse_reply(&json!({"error": "Request timed out"})) {
            Err(RelayError::Completion { timed_out, .. }) => assert!(timed_out),
            other => panic!("unexpected {other:?}"),
        }
        match parse_reply(&json!({"error": {"message": "model overloaded"}})) {
            Err(RelayError::Completion { message, timed_out }) => {
                assert_eq!(message, "model overloaded");
                assert!(!timed_out);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_reply(&json!({"id": "x"})).is_err());
        assert!(parse_reply(&json!({"choices": []})).is_err());
        assert!(parse_reply(&json!("Error in proxy: deadline exceeded")).is_err());
    }

    #[test]
    fn test_tool_call_arguments_string_or_object() {
        let payload = json!({"choices": [{"message": {"content": null, "tool_calls": [
            {"id": "a", "function": {"name": "search_datasets", "arguments": "{\"query\":\"mouse\"}"}},
            {"function": {"name": "search_images", "arguments": {"query": "tumor"}}}
        ]}}]});
        let reply = parse_reply(&payload).unwrap();
        assert_eq!(reply.content, "");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].arguments, r#"{"query":"mouse"}"#);
        assert_eq!(reply.tool_calls[1].id, "call_1");
        assert_eq!(reply.tool_calls[1].arguments, r#"{"query":"tumor"}"#);
    }

    #[test]
    fn test_request_body_shape() {
        let call = ToolCall {
            id: "c1".into(),
            name: "echo".into(),
            arguments: "{}".into(),
        };
        let request = CompletionRequest {
            messages: vec![
                Message::system("sys"),
                Message::user("hi"),
                Message::assistant_with_calls("", vec![call.clone()]),
                Message::tool_result(&call, "out"),
            ],
            tools: Some(vec![ToolSpec {
                name: "echo".into(),
                description: "Echo".into(),
                parameters: json!({"type": "object", "properties": {}, "required": []}),
            }]),
            tool_choice: Some(ToolChoice::None),
            model: "m".into(),
        };
        let body = request_body(&request);
        assert_eq!(body["tool_choice"], "none");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["messages"][2]["content"], Value::Null);
        assert_eq!(body["messages"][2]["tool_calls"][0]["id"], "c1");
        assert_eq!(body["messages"][3]["tool_call_id"], "c1");

        let plain = CompletionRequest {
            tools: None,
            tool_choice: None,
            ..request
        };
        let body = request_body(&plain);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }
}
