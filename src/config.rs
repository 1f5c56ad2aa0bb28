//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__SERVICE__MODEL=gpt-4o`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryExhaustion;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub progress: ProgressSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：当前身份、Agent 标识与系统提示词模板
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 当前用户身份（会话所有者）
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// 系统提示词模板；支持 {tools} 与 {today}
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            agent_id: default_agent_id(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_identity() -> String {
    "anonymous".to_string()
}

fn default_agent_id() -> String {
    "bioimage-finder".to_string()
}

fn default_system_prompt() -> String {
    "You are the BioImage Finder. Today is {today}.\n\
     Use tools first whenever the user asks for archive results.\n\
     Prefer brief OR-style queries (for example \"mouse OR tumor\").\n\
     If any dataset query already returns the requested number of results, stop calling tools and answer.\n\
     Available tools:\n{tools}"
        .to_string()
}

/// [service] 段：候选补全服务、模型、解析重试
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// 候选服务（URL 或 workspace/default@app 别名），按优先级排列
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
    /// 展开别名时使用的服务器地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// 开发分支：设置后其派生的 dev 服务排在最前
    pub dev_branch: Option<String>,
    #[serde(default = "default_dev_prefix")]
    pub dev_prefix: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    /// 每个候选的解析尝试轮数
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: usize,
    #[serde(default = "default_resolve_backoff_ms")]
    pub resolve_backoff_ms: u64,
    /// 单次连接尝试超时（秒）
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            server_url: default_server_url(),
            workspace: default_workspace(),
            dev_branch: None,
            dev_prefix: default_dev_prefix(),
            model: default_model(),
            api_key: None,
            resolve_attempts: default_resolve_attempts(),
            resolve_backoff_ms: default_resolve_backoff_ms(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_candidates() -> Vec<String> {
    vec!["ri-scale/default@chat-proxy".into(), "ri-scale/default@chat-proxy-fallback".into()]
}

fn default_server_url() -> String {
    "https://hypha.aicell.io".to_string()
}

fn default_workspace() -> String {
    "ri-scale".to_string()
}

fn default_dev_prefix() -> String {
    "chat-proxy-dev".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_resolve_attempts() -> usize {
    2
}

fn default_resolve_backoff_ms() -> u64 {
    500
}

fn default_resolve_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// [engine] 段：工具调用循环的轮数、截止时间与重试
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 单次补全调用超时（秒）
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// 软截止时间（秒）：超过后要求模型立即作答
    #[serde(default = "default_soft_deadline_secs")]
    pub soft_deadline_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub retry_exhaustion: RetryExhaustion,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            completion_timeout_secs: default_completion_timeout_secs(),
            soft_deadline_secs: default_soft_deadline_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_exhaustion: RetryExhaustion::default(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_max_turns() -> usize {
    8
}

fn default_completion_timeout_secs() -> u64 {
    90
}

fn default_soft_deadline_secs() -> u64 {
    150
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    800
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [bridge] 段：整轮超时与沙箱重试次数
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// 整轮往返硬上限（秒）
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// 响应标记分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            overall_timeout_secs: default_overall_timeout_secs(),
            max_attempts: default_max_attempts(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_overall_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> usize {
    3
}

fn default_chunk_size() -> usize {
    4096
}

/// [store] 段：会话记录目录
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    /// 会话记录的父集合
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            collection: default_collection(),
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from("data/sessions")
}

fn default_collection() -> String {
    "chats".to_string()
}

/// [progress] 段：明细条数上限与心跳间隔
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSection {
    #[serde(default = "default_max_details")]
    pub max_details: usize,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            max_details: default_max_details(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

fn default_max_details() -> usize {
    40
}

fn default_heartbeat_ms() -> u64 {
    1000
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    #[serde(default)]
    pub archive: ArchiveSection,
}

/// [tools.archive] 段：图像档案检索接口
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSection {
    #[serde(default = "default_archive_base_url")]
    pub base_url: String,
    #[serde(default = "default_study_url")]
    pub study_url: String,
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            base_url: default_archive_base_url(),
            study_url: default_study_url(),
            timeout_secs: default_archive_timeout_secs(),
        }
    }
}

fn default_archive_base_url() -> String {
    "https://beta.bioimagearchive.org/search/search/fts".to_string()
}

fn default_study_url() -> String {
    "https://beta.bioimagearchive.org/bioimage-archive/study".to_string()
}

fn default_archive_timeout_secs() -> u64 {
    30
}

impl EngineSection {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn soft_deadline(&self) -> Duration {
        Duration::from_secs(self.soft_deadline_secs)
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert!(cfg.engine.max_turns > 0);
        assert!(cfg.engine.soft_deadline() > cfg.engine.completion_timeout());
        assert!(cfg.bridge.overall_timeout_secs > cfg.engine.soft_deadline_secs);
        assert_eq!(cfg.engine.retry_exhaustion, RetryExhaustion::RetrySame);
        assert_eq!(cfg.service.candidates.len(), 2);
    }

    #[test]
    fn test_load_from_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[engine]\nmax_turns = 3\nretry_exhaustion = \"fail_fast\"\n\n[service]\ncandidates = [\"http://localhost:9000/v1\"]\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.engine.max_turns, 3);
        assert_eq!(cfg.engine.retry_exhaustion, RetryExhaustion::FailFast);
        assert_eq!(cfg.service.candidates, vec!["http://localhost:9000/v1".to_string()]);
        assert_eq!(cfg.progress.max_details, 40);
    }
}
