//! 响应标记协议
//!
//! 沙箱输出一行 `__RELAY_RESPONSE__:` + JSON 负载；主机端容忍标记与负载被拆成任意多块到达，
//! 只取标记之后第一个完整的 JSON 值，其余输出忽略。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{FaultKind, RelayError};
use crate::engine::{EngineFailure, EngineOutcome};

pub const RESPONSE_MARKER: &str = "__RELAY_RESPONSE__:";

/// 标记之后的负载：引擎结果或引擎错误
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarkerPayload {
    Ok { outcome: EngineOutcome },
    Failed { failure: EngineFailure },
}

impl MarkerPayload {
    /// 编码为一行输出（含标记前缀）
    pub fn to_line(&self) -> Result<String, RelayError> {
        Ok(format!("{RESPONSE_MARKER}{}\n", serde_json::to_string(self)?))
    }

    pub fn into_result(self) -> Result<EngineOutcome, EngineFailure> {
        match self {
            MarkerPayload::Ok { outcome } => Ok(outcome),
            MarkerPayload::Failed { failure } => Err(failure),
        }
    }
}

/// 按字符边界把文本切成不超过 size 字节的块
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if !current.is_empty() && current.len() + c.len_utf8() > size {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// 增量扫描器：逐块喂入输出，找到标记后解析第一个完整 JSON 值
#[derive(Debug, Default)]
pub struct MarkerScanner {
    buffer: String,
    located: bool,
    done: bool,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// 喂入一块输出；返回 Ok(Some) 表示负载已完整
    pub fn push(&mut self, chunk: &str) -> Result<Option<MarkerPayload>, RelayError> {
        if self.done {
            return Ok(None);
        }
        self.buffer.push_str(chunk);
        if !self.located {
            match self.buffer.find(RESPONSE_MARKER) {
                Some(pos) => {
                    self.buffer.drain(..pos + RESPONSE_MARKER.len());
                    self.located = true;
                }
                None => {
                    // 只保留可能构成标记前缀的尾部
                    let keep = RESPONSE_MARKER.len() - 1;
                    if self.buffer.len() > keep {
                        let mut cut = self.buffer.len() - keep;
                        while !self.buffer.is_char_boundary(cut) {
                            cut += 1;
                        }
                        self.buffer.drain(..cut);
                    }
                    return Ok(None);
                }
            }
        }
        self.try_parse()
    }

    fn try_parse(&mut self) -> Result<Option<MarkerPayload>, RelayError> {
        let next = {
            let text = self.buffer.trim_start();
            if text.is_empty() {
                return Ok(None);
            }
            serde_json::Deserializer::from_str(text)
                .into_iter::<Value>()
                .next()
        };
        match next {
            Some(Ok(value)) => {
                self.done = true;
                self.buffer.clear();
                serde_json::from_value(value).map(Some).map_err(|e| {
                    RelayError::sandbox(FaultKind::Syntax, format!("unexpected response payload: {e}"))
                })
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.done = true;
                Err(RelayError::sandbox(
                    FaultKind::Syntax,
                    format!("malformed response payload: {e}"),
                ))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::engine::EngineFinish;

    fn payload() -> MarkerPayload {
        MarkerPayload::Ok {
            outcome: EngineOutcome {
                reply: "Found 5 datasets ✓".to_string(),
                messages: vec![Message::assistant("Found 5 datasets ✓")],
                turns: 1,
                completions: 2,
                finish: EngineFinish::Answered,
            },
        }
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let expected = payload();
        let line = expected.to_line().unwrap();
        let stream = format!("engine started\nnoise __RELAY_RESP {line}trailing output\n");
        let mut scanner = MarkerScanner::new();
        let mut found = None;
        for chunk in chunk_text(&stream, 7) {
            if let Some(p) = scanner.push(&chunk).unwrap() {
                found = Some(p);
            }
        }
        assert_eq!(found, Some(expected));
        assert!(scanner.is_done());
    }

    #[test]
    fn test_only_first_value_is_taken() {
        let mut scanner = MarkerScanner::new();
        let expected = payload();
        let first = expected.to_line().unwrap();
        let result = scanner.push(&format!("{first}{first}")).unwrap();
        assert_eq!(result, Some(expected));
        assert_eq!(scanner.push(&first).unwrap(), None);
    }

    #[test]
    fn test_malformed_payload_is_syntax_fault() {
        let mut scanner = MarkerScanner::new();
        match scanner.push("__RELAY_RESPONSE__: {\"status\": ]") {
            Err(RelayError::Sandbox { fault, .. }) => assert_eq!(fault, FaultKind::Syntax),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_chunk_text_respects_char_boundaries() {
        let chunks = chunk_text("ab✓cd", 3);
        assert_eq!(chunks.concat(), "ab✓cd");
        assert!(chunks.iter().all(|c| c.len() <= 3));
    }
}
