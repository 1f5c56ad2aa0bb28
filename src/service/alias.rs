//! 服务别名：开发分支 → dev 应用 id → `workspace/default@app` 别名，以及别名到 URL 的展开

use crate::config::ServiceSection;

/// 应用 id 最大长度
pub const MAX_APP_ID_LENGTH: usize = 63;

/// 分支名规范化：小写，`_` 与 `/` 变 `-`，其它非法字符变 `-`，合并连续 `-` 并去掉首尾；为空时返回 "branch"
pub fn slugify_branch_name(branch: &str) -> String {
    let mut slug = String::with_capacity(branch.len());
    for c in branch.trim().to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "branch".to_string()
    } else {
        slug.to_string()
    }
}

/// 由分支名派生 dev 应用 id：`prefix-slug`，总长不超过 63
pub fn make_dev_app_id(branch: &str, prefix: &str) -> String {
    let slug = slugify_branch_name(branch);
    let Some(budget) = MAX_APP_ID_LENGTH
        .checked_sub(prefix.len() + 1)
        .filter(|b| *b > 0)
    else {
        return prefix.chars().take(MAX_APP_ID_LENGTH).collect();
    };
    // slug 只含 ASCII，可按字节截断
    let trimmed = &slug[..slug.len().min(budget)];
    if trimmed.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}-{trimmed}")
    }
}

pub fn build_service_alias(workspace: &str, app_id: &str) -> String {
    format!("{workspace}/default@{app_id}")
}

/// 解析 `workspace/default@app`，返回 (workspace, app)
pub fn parse_service_alias(alias: &str) -> Option<(&str, &str)> {
    let (workspace, rest) = alias.split_once('/')?;
    let (_client, app) = rest.split_once('@')?;
    if workspace.is_empty() || app.is_empty() {
        return None;
    }
    Some((workspace, app))
}

/// 候选标识展开为 HTTP 端点：URL 原样；别名映射到 `{server}/{workspace}/apps/{app}`；
/// `workspace/service` 映射到 `{server}/{workspace}/services/{service}`
pub fn candidate_endpoint(candidate: &str, server_url: &str) -> String {
    let server = server_url.trim_end_matches('/');
    let candidate = candidate.trim();
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return candidate.trim_end_matches('/').to_string();
    }
    if let Some((workspace, app)) = parse_service_alias(candidate) {
        return format!("{server}/{workspace}/apps/{app}");
    }
    match candidate.split_once('/') {
        Some((workspace, service)) => format!("{server}/{workspace}/services/{service}"),
        None => format!("{server}/public/services/{candidate}"),
    }
}

/// 按配置得到有序候选列表：设置了开发分支时，其 dev 别名排在最前
pub fn candidate_list(cfg: &ServiceSection) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(branch) = cfg.dev_branch.as_deref().filter(|b| !b.trim().is_empty()) {
        let app_id = make_dev_app_id(branch, &cfg.dev_prefix);
        candidates.push(build_service_alias(&cfg.workspace, &app_id));
    }
    for candidate in &cfg.candidates {
        if !candidates.contains(candidate) {
            candidates.push(candidate.clone());
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_branch_name() {
        assert_eq!(slugify_branch_name("feature/chat proxy"), "feature-chat-proxy");
        assert_eq!(slugify_branch_name("___"), "branch");
        assert_eq!(slugify_branch_name("  Fix__Timeouts!!v2 "), "fix-timeouts-v2");
    }

    #[test]
    fn test_make_dev_app_id() {
        let app_id = make_dev_app_id(
            "feature/super-long-branch-name-with-more-and-more-characters",
            "chat-proxy-dev",
        );
        assert!(app_id.starts_with("chat-proxy-dev-"));
        assert!(app_id.len() <= MAX_APP_ID_LENGTH);
        assert_eq!(make_dev_app_id("main", "chat-proxy-dev"), "chat-proxy-dev-main");
        let long_prefix = "p".repeat(70);
        assert_eq!(make_dev_app_id("main", &long_prefix).len(), MAX_APP_ID_LENGTH);
    }

    #[test]
    fn test_alias_round_trip() {
        let alias = build_service_alias("ri-scale", "chat-proxy-dev-abc");
        assert_eq!(alias, "ri-scale/default@chat-proxy-dev-abc");
        assert_eq!(parse_service_alias(&alias), Some(("ri-scale", "chat-proxy-dev-abc")));
        assert_eq!(parse_service_alias("ri-scale/chat-proxy"), None);
    }

    #[test]
    fn test_candidate_endpoint() {
        let server = "https://hub.example/";
        assert_eq!(
            candidate_endpoint("ri-scale/default@chat-proxy", server),
            "https://hub.example/ri-scale/apps/chat-proxy"
        );
        assert_eq!(
            candidate_endpoint("ri-scale/chat-proxy", server),
            "https://hub.example/ri-scale/services/chat-proxy"
        );
        assert_eq!(
            candidate_endpoint("http://localhost:8000/v1/", server),
            "http://localhost:8000/v1"
        );
    }

    #[test]
    fn test_dev_branch_goes_first() {
        let cfg = ServiceSection {
            dev_branch: Some("feature/x".to_string()),
            ..ServiceSection::default()
        };
        let list = candidate_list(&cfg);
        assert_eq!(list[0], "ri-scale/default@chat-proxy-dev-feature-x");
        assert_eq!(list.len(), cfg.candidates.len() + 1);
    }
}
