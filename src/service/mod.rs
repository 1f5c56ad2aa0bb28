//! 补全服务：候选解析、HTTP 连接与 OpenAI 兼容格式

pub mod alias;
pub mod http;
pub mod mock;
pub mod resolver;
pub mod traits;
pub mod wire;

pub use alias::{build_service_alias, candidate_list, make_dev_app_id, slugify_branch_name};
pub use http::{HttpCompletionService, HttpConnector};
pub use resolver::ServiceResolver;
pub use traits::{
    AssistantReply, CompletionBackend, CompletionRequest, CompletionService, ResolveHint,
    ServiceConnector, ToolChoice,
};
