//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按注册顺序保存，
//! 工具发现只看注册表，不依赖任何全局状态。闭包可通过 FnTool 直接注册，参数 schema 由参数结构体推导。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tools::schema::parameters_for;

/// 工具 trait：名称、描述（供模型理解）、参数 schema、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应 tool_call.function.name）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；返回值由执行器统一转为文本
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表：按注册顺序保存 Arc<dyn Tool>，同名后注册者覆盖先注册者
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.tools[pos] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&pos| self.tools[pos].clone())
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, String> {
        let tool = self.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的工具段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|tool| (tool.name().to_string(), tool.description().to_string()))
            .collect()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

type BoxedFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// 以闭包注册的工具；A 为参数结构体，其 JsonSchema 即工具签名
pub struct FnTool<A> {
    name: String,
    description: String,
    schema: Value,
    func: BoxedFn,
    _args: PhantomData<fn(A)>,
}

fn decode_args<A: DeserializeOwned>(args: Value) -> Result<A, String> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

impl<A> FnTool<A>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
{
    /// 异步闭包
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let func = Arc::new(func);
        let boxed: BoxedFn = Arc::new(move |args: Value| -> BoxFuture<'static, Result<Value, String>> {
            let func = func.clone();
            Box::pin(async move {
                let parsed = decode_args::<A>(args)?;
                (*func)(parsed).await
            })
        });
        Self {
            name: name.into(),
            description: description.into(),
            schema: parameters_for::<A>(),
            func: boxed,
            _args: PhantomData,
        }
    }

    /// 同步闭包
    pub fn sync<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(A) -> Result<Value, String> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let boxed: BoxedFn = Arc::new(move |args: Value| -> BoxFuture<'static, Result<Value, String>> {
            let result = decode_args::<A>(args).and_then(|parsed| (*func)(parsed));
            Box::pin(std::future::ready(result))
        });
        Self {
            name: name.into(),
            description: description.into(),
            schema: parameters_for::<A>(),
            func: boxed,
            _args: PhantomData,
        }
    }
}

#[async_trait]
impl<A> Tool for FnTool<A>
where
    A: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        (self.func)(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        #[serde(default)]
        b: i64,
    }

    #[tokio::test]
    async fn test_sync_fn_tool() {
        let tool = FnTool::<AddArgs>::sync("add", "Add two integers", |args| {
            Ok(Value::from(args.a + args.b))
        });
        assert_eq!(tool.execute(serde_json::json!({"a": 2, "b": 3})).await, Ok(Value::from(5)));
        assert_eq!(tool.execute(serde_json::json!({"a": 2})).await, Ok(Value::from(2)));
        let err = tool.execute(serde_json::json!({"b": 1})).await.unwrap_err();
        assert!(err.starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_registry_keeps_order_and_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::<AddArgs>::sync("b_tool", "first", |_| Ok(Value::Null)));
        registry.register(FnTool::<AddArgs>::new("a_tool", "second", |args| async move {
            Ok(Value::from(args.a))
        }));
        registry.register(FnTool::<AddArgs>::sync("b_tool", "replaced", |_| Ok(Value::Null)));
        assert_eq!(registry.tool_names(), vec!["b_tool".to_string(), "a_tool".to_string()]);
        assert_eq!(registry.get("b_tool").unwrap().description(), "replaced");
        assert_eq!(
            registry.execute("a_tool", serde_json::json!({"a": 7})).await,
            Ok(Value::from(7))
        );
        assert!(registry.execute("missing", Value::Null).await.is_err());
    }
}
