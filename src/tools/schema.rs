//! 工具 Schema：由参数结构体（schemars）推导 ToolSpec，并在沙箱生命周期内缓存
//!
//! 参数类型只保留 integer / number / boolean / string 四种，其它一律视为 string；
//! 带默认值（或 Option）的字段不进入 required。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::{Tool, ToolRegistry};

/// 发给补全服务的工具描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: normalize_parameters(&tool.parameters_schema()),
        }
    }
}

/// 由参数结构体推导规范化后的参数 schema
pub fn parameters_for<A: JsonSchema>() -> Value {
    let root = schema_for!(A);
    let raw = serde_json::to_value(&root).unwrap_or(Value::Null);
    normalize_parameters(&raw)
}

/// 将任意 JSON Schema 规范化为 {type: object, properties, required}
pub fn normalize_parameters(raw: &Value) -> Value {
    let mut properties = Map::new();
    if let Some(props) = raw.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let mut entry = Map::new();
            entry.insert("type".to_string(), Value::from(parameter_type(prop)));
            if let Some(desc) = prop.get("description") {
                entry.insert("description".to_string(), desc.clone());
            }
            if let Some(default) = prop.get("default") {
                entry.insert("default".to_string(), default.clone());
            }
            properties.insert(name.clone(), Value::Object(entry));
        }
    }
    let required: Vec<Value> = raw
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter(|n| n.as_str().is_some_and(|n| properties.contains_key(n)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn parameter_type(prop: &Value) -> &'static str {
    let declared: Vec<&str> = match prop.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    for t in declared {
        match t {
            "integer" => return "integer",
            "number" => return "number",
            "boolean" => return "boolean",
            "string" => return "string",
            _ => {}
        }
    }
    "string"
}

/// 工具发现缓存：每个沙箱生命周期只构建一次，沙箱重建时随之丢弃
#[derive(Debug, Default)]
pub struct ToolSpecCache {
    specs: OnceLock<Arc<Vec<ToolSpec>>>,
    builds: AtomicUsize,
}

impl ToolSpecCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 (specs, 是否命中缓存)
    pub fn get_or_build(&self, registry: &ToolRegistry) -> (Arc<Vec<ToolSpec>>, bool) {
        if let Some(specs) = self.specs.get() {
            return (specs.clone(), true);
        }
        let specs = self.specs.get_or_init(|| {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let built: Vec<ToolSpec> = registry
                .tools()
                .iter()
                .map(|tool| ToolSpec::from_tool(tool.as_ref()))
                .collect();
            tracing::debug!(count = built.len(), "tool specs built");
            Arc::new(built)
        });
        (specs.clone(), false)
    }

    /// 实际构建次数
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FnTool;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct SearchArgs {
        /// Full-text query
        query: String,
        #[serde(default = "default_limit")]
        limit: u32,
        exact: Option<bool>,
        ratio: f64,
        tags: Vec<String>,
    }

    fn default_limit() -> u32 {
        10
    }

    #[test]
    fn test_parameters_from_struct() {
        let schema = parameters_for::<SearchArgs>();
        let props = &schema["properties"];
        assert_eq!(props["query"]["type"], "string");
        assert_eq!(props["query"]["description"], "Full-text query");
        assert_eq!(props["limit"]["type"], "integer");
        assert_eq!(props["limit"]["default"], 10);
        assert_eq!(props["exact"]["type"], "boolean");
        assert_eq!(props["ratio"]["type"], "number");
        assert_eq!(props["tags"]["type"], "string");

        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"query"));
        assert!(required.contains(&"ratio"));
        assert!(!required.contains(&"limit"));
        assert!(!required.contains(&"exact"));
    }

    #[test]
    fn test_cache_builds_once() {
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::<SearchArgs>::sync("search", "Search", |_| Ok(Value::Null)));
        let cache = ToolSpecCache::new();
        let (first, cached) = cache.get_or_build(&registry);
        assert!(!cached);
        assert_eq!(first[0].name, "search");
        let (_, cached) = cache.get_or_build(&registry);
        assert!(cached);
        assert_eq!(cache.builds(), 1);
    }
}
