//! 工具箱：注册表、schema 推导、执行器与内置工具（echo、档案检索）

pub mod archive;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

use std::sync::Arc;

use crate::config::ToolsSection;

pub use archive::{register_archive_tools, ArchiveClient, ArchiveSearch, HttpArchiveClient};
pub use echo::EchoTool;
pub use executor::{canonical_args, coerce_to_text, ToolExecutor, ToolOutcome, TurnCache};
pub use registry::{FnTool, Tool, ToolRegistry};
pub use schema::{parameters_for, ToolSpec, ToolSpecCache};

/// 默认工具集：echo + 三个档案检索工具
pub fn default_registry(cfg: &ToolsSection) -> Result<ToolRegistry, String> {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let client = HttpArchiveClient::new(&cfg.archive)?;
    let search = Arc::new(ArchiveSearch::new(Arc::new(client), cfg.archive.study_url.clone()));
    register_archive_tools(&mut registry, search);
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_lists_builtin_tools() {
        let registry = default_registry(&ToolsSection::default()).unwrap();
        let names = registry.tool_names();
        assert_eq!(names[0], "echo");
        assert!(names.iter().any(|n| n == "search_datasets"));
        assert!(names.iter().any(|n| n == "search_images"));
        assert!(names.iter().any(|n| n == "explain_advanced_query_syntax"));
    }
}
