//! 图像档案检索工具：search_datasets / search_images / explain_advanced_query_syntax
//!
//! 全文检索接口返回的命中结构不稳定（hits 可能是数组，也可能是 {hits, total}），这里统一抽取、
//! 按查询词重排并压缩为紧凑 JSON。数据集检索在主查询为空或相关性弱时，用拆分出的单词做补充查询并合并去重。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ArchiveSection;
use crate::tools::{FnTool, ToolRegistry};

/// 紧凑结果最多条数
const MAX_RESULTS: usize = 8;
/// 标题截断长度
const TITLE_CHARS: usize = 180;
/// 补充 / 兜底查询最多次数
const MAX_FALLBACK_QUERIES: usize = 4;
/// 达到该相关性分数视为强匹配
const STRONG_MATCH_SCORE: f64 = 6.0;

const STOPWORDS: &[&str] = &[
    "and", "or", "not", "the", "a", "an", "of", "for", "with", "in", "on", "to", "please", "give",
    "me", "find", "show", "get", "dataset", "datasets",
];

const QUERY_SYNTAX_GUIDE: &str = "Advanced search syntax:\n\
- Words are case-insensitive.\n\
- Default behavior is OR across terms.\n\
- Use AND / OR / NOT and parentheses for boolean logic.\n\
- Use quoted phrases for exact matching.\n\
- Wildcards: * for any sequence, ? for a single character.\n\
Examples:\n\
1) confocal fluorescence microscopy\n\
2) confocal AND fluorescence AND microscopy\n\
3) \"confocal fluorescence microscopy\"\n\
4) microscopy AND (fluorescence OR confocal)\n\
5) microscopy AND NOT (fluorescence OR confocal)\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchKind {
    Datasets,
    Images,
}

/// 档案检索接口
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// 该查询对应的请求 URL（写入结果供用户点击）
    fn search_url(&self, kind: SearchKind, query: &str) -> String;

    /// 返回接口原始 JSON
    async fn fetch(&self, kind: SearchKind, query: &str) -> Result<Value, String>;
}

/// 基于 reqwest 的检索客户端
pub struct HttpArchiveClient {
    client: Client,
    base_url: String,
}

impl HttpArchiveClient {
    pub fn new(cfg: &ArchiveSection) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, kind: SearchKind) -> String {
        match kind {
            SearchKind::Datasets => self.base_url.clone(),
            SearchKind::Images => format!("{}/image", self.base_url),
        }
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    fn search_url(&self, kind: SearchKind, query: &str) -> String {
        let endpoint = self.endpoint(kind);
        Url::parse_with_params(&endpoint, &[("query", query)])
            .map(String::from)
            .unwrap_or(endpoint)
    }

    async fn fetch(&self, kind: SearchKind, query: &str) -> Result<Value, String> {
        let url = self.search_url(kind, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("archive request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("archive returned HTTP {status} for {url}"));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| format!("archive returned invalid JSON: {e}"))
    }
}

/// 查询词：字母数字片段、小写、长度 ≥ 3、去停用词、去重（保序）
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if token.len() < 3 || STOPWORDS.contains(&token) {
            continue;
        }
        if !terms.iter().any(|t| t == token) {
            terms.push(token.to_string());
        }
    }
    terms
}

fn str_field<'a>(item: &'a Value, key: &str) -> &'a str {
    item.get(key).and_then(Value::as_str).unwrap_or("")
}

/// 查询词及其整词正则；每次查询编译一次，重排时复用
pub struct TermMatcher {
    term: String,
    word: Regex,
}

impl TermMatcher {
    pub fn compile(terms: &[String]) -> Vec<TermMatcher> {
        terms
            .iter()
            .filter_map(|term| {
                Regex::new(&format!(r"\b{}\b", regex::escape(term)))
                    .ok()
                    .map(|word| TermMatcher {
                        term: term.clone(),
                        word,
                    })
            })
            .collect()
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn matches_word(&self, text: &str) -> bool {
        self.word.is_match(text)
    }
}

/// 数据集相关性：标题 / 描述按整词或子串计分，命中数足够时加分，并叠加接口自身分数
pub fn relevance_score(item: &Value, terms: &[TermMatcher]) -> f64 {
    let title = str_field(item, "title").to_lowercase();
    let description = str_field(item, "description").to_lowercase();
    let accession = str_field(item, "accession").to_lowercase();

    let mut score = 0.0;
    let mut term_hits = 0usize;
    for term in terms {
        if term.matches_word(&title) {
            score += 6.0;
            term_hits += 1;
        } else if title.contains(term.term()) {
            score += 3.5;
            term_hits += 1;
        }

        if term.matches_word(&description) {
            score += 3.0;
            term_hits += 1;
        } else if description.contains(term.term()) {
            score += 1.0;
            term_hits += 1;
        }

        if accession.contains(term.term()) {
            score += 0.5;
        }
    }

    if !terms.is_empty() && term_hits >= terms.len().max(2) {
        score += 2.0;
    }
    if let Some(api) = item.get("score").and_then(Value::as_f64) {
        score += api.min(20.0) / 20.0;
    }
    score
}

/// 按相关性降序重排（同分保持原顺序）
pub fn rerank(items: Vec<Value>, query: &str) -> Vec<Value> {
    let terms = TermMatcher::compile(&query_terms(query));
    if terms.is_empty() {
        return items;
    }
    let mut ranked: Vec<(f64, Value)> = items
        .into_iter()
        .map(|item| (relevance_score(&item, &terms), item))
        .collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().map(|(_, item)| item).collect()
}

pub fn has_strong_match(items: &[Value], query: &str) -> bool {
    let terms = TermMatcher::compile(&query_terms(query));
    if terms.is_empty() {
        return true;
    }
    items
        .iter()
        .any(|item| relevance_score(item, &terms) >= STRONG_MATCH_SCORE)
}

fn result_key(entry: &Value, position: usize) -> String {
    for (prefix, key) in [("acc", "accession"), ("url", "url"), ("title", "title")] {
        let value = str_field(entry, key).trim();
        if !value.is_empty() {
            return format!("{prefix}:{}", value.to_lowercase());
        }
    }
    format!("obj:{position}")
}

/// 合并两组结果，按 accession / url / title 去重，先出现者优先
pub fn merge_unique(primary: &[Value], secondary: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (position, candidate) in primary.iter().chain(secondary.iter()).enumerate() {
        if seen.insert(result_key(candidate, position)) {
            merged.push(candidate.clone());
        }
    }
    merged
}

/// 兼容 {hits: [...]} 与 {hits: {hits: [...], total: {value}}} 两种结构
pub fn extract_hits_and_total(payload: &Value) -> (Vec<Value>, u64) {
    match payload.get("hits") {
        Some(Value::Array(hits)) => (hits.clone(), hits.len() as u64),
        Some(Value::Object(inner)) => {
            let hits = inner
                .get("hits")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let total = inner
                .get("total")
                .and_then(|t| t.get("value"))
                .and_then(Value::as_u64)
                .unwrap_or(hits.len() as u64);
            (hits, total)
        }
        _ => (Vec::new(), 0),
    }
}

fn first_nonempty(values: &[Option<&Value>]) -> Option<String> {
    values
        .iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_or_null(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => Value::String(s.clone()),
        _ => Value::Null,
    }
}

fn source_of(item: &Value) -> &Value {
    match item.get("_source") {
        Some(source @ Value::Object(_)) => source,
        _ => item,
    }
}

fn study_link(study_url: &str, accession: &Option<String>) -> Value {
    match accession {
        Some(acc) => Value::from(format!("{}/{acc}", study_url.trim_end_matches('/'))),
        None => Value::Null,
    }
}

pub fn dataset_from_hit(item: &Value, study_url: &str) -> Value {
    let source = source_of(item);
    let accession = first_nonempty(&[
        source.get("accession_id"),
        source.get("accession"),
        source.get("id"),
        item.get("_id"),
    ]);
    let accession_value = accession.clone().map(Value::from);
    let title = first_nonempty(&[
        source.get("title"),
        source.get("name"),
        source.get("dataset"),
        accession_value.as_ref(),
        source.get("uuid"),
        item.get("_id"),
    ])
    .unwrap_or_else(|| "Untitled".to_string());

    json!({
        "title": title,
        "accession": accession.clone().unwrap_or_default(),
        "url": study_link(study_url, &accession),
        "uuid": string_or_null(source.get("uuid")),
        "description": string_or_null(source.get("description")),
        "doi": string_or_null(source.get("doi")),
        "release_date": string_or_null(source.get("release_date")),
        "score": item.get("_score").cloned().unwrap_or(Value::Null),
    })
}

fn file_pattern_of(source: &Value) -> Option<String> {
    source
        .get("additional_metadata")?
        .as_array()?
        .iter()
        .filter(|entry| entry.get("name").and_then(Value::as_str) == Some("file_pattern"))
        .find_map(|entry| {
            entry
                .get("value")
                .filter(|v| v.is_object())
                .and_then(|v| v.get("file_pattern"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

pub fn image_from_hit(item: &Value, study_url: &str) -> Value {
    let source = source_of(item);
    let file_pattern = file_pattern_of(source);
    let acquisition_title = source
        .get("creation_process")
        .and_then(|p| p.get("acquisition_process"))
        .and_then(Value::as_array)
        .and_then(|steps| steps.first())
        .and_then(|step| step.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let accession = first_nonempty(&[
        source.get("accession_id"),
        source.get("accession"),
        source.get("study_accession"),
    ]);
    let image_id = first_nonempty(&[source.get("uuid"), item.get("_id")]).unwrap_or_default();
    let pattern_value = file_pattern.clone().map(Value::from);
    let acquisition_value = acquisition_title.clone().map(Value::from);
    let id_value = Value::from(image_id.clone());
    let title = first_nonempty(&[
        source.get("title"),
        source.get("name"),
        source.get("label"),
        pattern_value.as_ref(),
        acquisition_value.as_ref(),
        Some(&id_value),
    ])
    .unwrap_or_else(|| "Untitled".to_string());

    json!({
        "id": image_id,
        "accession": accession.clone().unwrap_or_default(),
        "title": title,
        "study_url": study_link(study_url, &accession),
        "dataset_uuid": string_or_null(source.get("submission_dataset_uuid")),
        "file_pattern": file_pattern,
        "acquisition_title": acquisition_title,
        "score": item.get("_score").cloned().unwrap_or(Value::Null),
    })
}

fn short_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn number_or_null(value: Option<&Value>) -> Value {
    match value {
        Some(v @ Value::Number(_)) => v.clone(),
        _ => Value::Null,
    }
}

fn compact_dataset(item: &Value) -> Value {
    json!({
        "title": short_text(item.get("title").and_then(Value::as_str).unwrap_or("Untitled"), TITLE_CHARS),
        "accession": str_field(item, "accession"),
        "url": string_or_null(item.get("url")),
        "doi": string_or_null(item.get("doi")),
        "release_date": string_or_null(item.get("release_date")),
        "score": number_or_null(item.get("score")),
    })
}

fn compact_image(item: &Value) -> Value {
    json!({
        "title": short_text(item.get("title").and_then(Value::as_str).unwrap_or("Untitled"), TITLE_CHARS),
        "id": str_field(item, "id"),
        "accession": str_field(item, "accession"),
        "study_url": string_or_null(item.get("study_url")),
        "file_pattern": string_or_null(item.get("file_pattern")),
        "score": number_or_null(item.get("score")),
    })
}

/// 整理为 {query, url, total, results}，结果最多 8 条；数据集先重排再截断
pub fn normalize_payload(
    kind: SearchKind,
    query: &str,
    limit: usize,
    results: Vec<Value>,
    total: Option<u64>,
    url: String,
) -> Value {
    let result_limit = limit.clamp(1, MAX_RESULTS);
    let ranked = match kind {
        SearchKind::Datasets => rerank(results, query),
        SearchKind::Images => results,
    };
    let compact: Vec<Value> = ranked
        .iter()
        .take(result_limit)
        .filter(|entry| entry.is_object())
        .map(|entry| match kind {
            SearchKind::Datasets => compact_dataset(entry),
            SearchKind::Images => compact_image(entry),
        })
        .collect();
    let total = total.unwrap_or(compact.len() as u64);
    json!({
        "query": query,
        "url": url,
        "total": total,
        "results": compact,
    })
}

/// 按 AND / OR 拆分出的原始片段（去括号引号）
pub fn fallback_terms(query: &str) -> Vec<String> {
    let splitter = match Regex::new(r"(?i)\bAND\b|\bOR\b") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut terms: Vec<String> = Vec::new();
    for part in splitter.split(query) {
        let candidate = part
            .trim()
            .trim_matches(|c: char| "\"'()[]{}".contains(c));
        if candidate.chars().count() < 2 {
            continue;
        }
        if matches!(candidate.to_lowercase().as_str(), "and" | "or" | "not") {
            continue;
        }
        if !terms.iter().any(|t| t == candidate) {
            terms.push(candidate.to_string());
        }
    }
    terms
}

/// 兜底候选：先拆分片段，再补充查询词
pub fn fallback_candidates(query: &str) -> Vec<String> {
    let mut candidates = fallback_terms(query);
    for term in query_terms(query) {
        if !candidates.contains(&term) {
            candidates.push(term);
        }
    }
    candidates
}

fn results_of(payload: &Value) -> Vec<Value> {
    payload
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// 档案检索：持有客户端与研究页 URL 前缀
pub struct ArchiveSearch {
    client: Arc<dyn ArchiveClient>,
    study_url: String,
}

impl ArchiveSearch {
    pub fn new(client: Arc<dyn ArchiveClient>, study_url: impl Into<String>) -> Self {
        Self {
            client,
            study_url: study_url.into(),
        }
    }

    async fn datasets_once(&self, query: &str, limit: usize) -> Result<Value, String> {
        let fetch_limit = (limit * 6).clamp(20, 60);
        let payload = self.client.fetch(SearchKind::Datasets, query).await?;
        let (hits, total) = extract_hits_and_total(&payload);
        let results: Vec<Value> = hits
            .iter()
            .take(fetch_limit)
            .filter(|hit| hit.is_object())
            .map(|hit| dataset_from_hit(hit, &self.study_url))
            .collect();
        let url = self.client.search_url(SearchKind::Datasets, query);
        Ok(normalize_payload(SearchKind::Datasets, query, limit, results, Some(total), url))
    }

    /// 数据集检索：主查询有结果但相关性弱时补充查询；主查询为空时用单词兜底并合并
    pub async fn search_datasets(&self, query: &str, limit: i64) -> Result<Value, String> {
        let limit = limit.max(1) as usize;
        let result_limit = limit.min(MAX_RESULTS);
        tracing::debug!(query, limit, "search_datasets primary query");
        let mut primary = self.datasets_once(query, limit).await?;

        if primary.get("total").and_then(Value::as_u64).unwrap_or(0) > 0 {
            let primary_list = results_of(&primary);
            if !has_strong_match(&primary_list, query) && query_terms(query).len() >= 2 {
                for term in fallback_candidates(query).into_iter().take(MAX_FALLBACK_QUERIES) {
                    tracing::debug!(query, term = %term, "search_datasets enrichment after weak relevance");
                    let enrichment = self.datasets_once(&term, limit).await?;
                    let merged = merge_unique(&primary_list, &results_of(&enrichment));
                    let mut reranked = rerank(merged, query);
                    reranked.truncate(result_limit);
                    let strong = has_strong_match(&reranked, query);
                    primary["results"] = Value::Array(reranked);
                    if strong {
                        primary["enriched_with_query"] = Value::from(term);
                        break;
                    }
                }
            }
            return Ok(primary);
        }

        let mut merged: Vec<Value> = Vec::new();
        let mut used: Vec<String> = Vec::new();
        for term in fallback_candidates(query).into_iter().take(MAX_FALLBACK_QUERIES) {
            tracing::debug!(query, term = %term, "search_datasets fallback after empty primary");
            let fallback = self.datasets_once(&term, limit).await?;
            let items = results_of(&fallback);
            if !items.is_empty() {
                merged = merge_unique(&merged, &items);
                used.push(term);
            }
        }
        if merged.is_empty() {
            tracing::debug!(query, "search_datasets no results");
            return Ok(primary);
        }
        let total = merged.len();
        let mut reranked = rerank(merged, query);
        reranked.truncate(result_limit);
        Ok(json!({
            "query": query,
            "url": self.client.search_url(SearchKind::Datasets, query),
            "total": total,
            "results": reranked,
            "fallback_from_query": query,
            "fallback_terms_used": used,
        }))
    }

    pub async fn search_images(&self, query: &str, limit: i64) -> Result<Value, String> {
        let limit = limit.max(1) as usize;
        let payload = self.client.fetch(SearchKind::Images, query).await?;
        let (hits, total) = extract_hits_and_total(&payload);
        let results: Vec<Value> = hits
            .iter()
            .take(limit)
            .filter(|hit| hit.is_object())
            .map(|hit| image_from_hit(hit, &self.study_url))
            .collect();
        let url = self.client.search_url(SearchKind::Images, query);
        Ok(normalize_payload(SearchKind::Images, query, limit, results, Some(total), url))
    }
}

/// search_datasets / search_images 的参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// Search text; supports AND / OR / NOT, quoted phrases and wildcards
    pub query: String,
    /// Maximum number of results to return
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// 注册三个档案检索工具
pub fn register_archive_tools(registry: &mut ToolRegistry, search: Arc<ArchiveSearch>) {
    let datasets = search.clone();
    registry.register(FnTool::<SearchArgs>::new(
        "search_datasets",
        "Search BioImage Archive datasets by full-text query. Returns the request URL, total count and top results.",
        move |args| {
            let search = datasets.clone();
            async move { search.search_datasets(&args.query, args.limit).await }
        },
    ));
    registry.register(FnTool::<SearchArgs>::new(
        "search_images",
        "Search the BioImage Archive image-level index by full-text query.",
        move |args| {
            let search = search.clone();
            async move { search.search_images(&args.query, args.limit).await }
        },
    ));
    registry.register(FnTool::<NoArgs>::sync(
        "explain_advanced_query_syntax",
        "Return a concise guide for advanced archive query syntax.",
        |_| Ok(Value::from(QUERY_SYNTAX_GUIDE)),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const STUDY: &str = "https://archive.test/study";

    /// 按查询返回预置结果，并记录调用
    struct ScriptedArchive {
        pages: HashMap<String, Value>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedArchive {
        fn new(pages: &[(&str, Value)]) -> Self {
            Self {
                pages: pages.iter().map(|(q, v)| (q.to_string(), v.clone())).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ArchiveClient for ScriptedArchive {
        fn search_url(&self, _kind: SearchKind, query: &str) -> String {
            format!("https://archive.test/fts?query={query}")
        }

        async fn fetch(&self, _kind: SearchKind, query: &str) -> Result<Value, String> {
            self.calls.lock().unwrap().push(query.to_string());
            Ok(self.pages.get(query).cloned().unwrap_or_else(|| json!({"hits": []})))
        }
    }

    fn hit(acc: &str, title: &str) -> Value {
        json!({"_id": acc, "_score": 5.0, "_source": {"accession_id": acc, "title": title}})
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(
            query_terms("Find me 5 mouse tumor datasets, please! Mouse OR tumor"),
            vec!["mouse".to_string(), "tumor".to_string()]
        );
        assert!(query_terms("a of me").is_empty());
    }

    #[test]
    fn test_relevance_prefers_title_word_match() {
        let terms = TermMatcher::compile(&query_terms("mouse tumor"));
        let strong = json!({"title": "Mouse tumor atlas", "description": "tumor cells in mouse"});
        let partial = json!({"title": "Mousetrap", "description": ""});
        let s1 = relevance_score(&strong, &terms);
        let s2 = relevance_score(&partial, &terms);
        // 6 + 6 + 3 + 3 + 2
        assert!((s1 - 20.0).abs() < 1e-9);
        assert!((s2 - 3.5).abs() < 1e-9);
        let ranked = rerank(vec![partial.clone(), strong.clone()], "mouse tumor");
        assert_eq!(ranked[0], strong);
        assert!(has_strong_match(&[strong], "mouse tumor"));
        assert!(!has_strong_match(&[partial], "mouse tumor"));
    }

    #[test]
    fn test_term_matchers_match_whole_words() {
        let matchers = TermMatcher::compile(&query_terms("c++ mouse tumour-cells"));
        let terms: Vec<&str> = matchers.iter().map(TermMatcher::term).collect();
        assert_eq!(terms, vec!["mouse", "tumour", "cells"]);
        assert!(matchers[0].matches_word("a mouse model"));
        assert!(!matchers[0].matches_word("mousetrap"));
        assert!(matchers[2].matches_word("cells."));
    }

    #[test]
    fn test_merge_unique_by_accession() {
        let a = json!({"accession": "S-BIAD1", "title": "A"});
        let a_dup = json!({"accession": "s-biad1 ", "title": "A again"});
        let b = json!({"url": "https://x/y", "title": "B"});
        let merged = merge_unique(&[a.clone(), b.clone()], &[a_dup]);
        assert_eq!(merged, vec![a, b]);
    }

    #[test]
    fn test_extract_hits_both_shapes() {
        let (hits, total) = extract_hits_and_total(&json!({"hits": [{"a": 1}, {"b": 2}]}));
        assert_eq!((hits.len(), total), (2, 2));
        let (hits, total) = extract_hits_and_total(&json!({"hits": {"hits": [{"a": 1}], "total": {"value": 42}}}));
        assert_eq!((hits.len(), total), (1, 42));
        let (hits, total) = extract_hits_and_total(&json!("nope"));
        assert_eq!((hits.len(), total), (0, 0));
    }

    #[test]
    fn test_dataset_and_image_from_hit() {
        let d = dataset_from_hit(&hit("S-BIAD9", "Liver"), STUDY);
        assert_eq!(d["accession"], "S-BIAD9");
        assert_eq!(d["url"], "https://archive.test/study/S-BIAD9");
        assert_eq!(d["score"], 5.0);

        let image = json!({
            "_id": "img-1",
            "_source": {
                "study_accession": "S-BIAD2",
                "additional_metadata": [{"name": "file_pattern", "value": {"file_pattern": "plate_{w}.tif"}}]
            }
        });
        let i = image_from_hit(&image, STUDY);
        assert_eq!(i["title"], "plate_{w}.tif");
        assert_eq!(i["id"], "img-1");
        assert_eq!(i["study_url"], "https://archive.test/study/S-BIAD2");
    }

    #[test]
    fn test_fallback_terms() {
        assert_eq!(
            fallback_terms("(mouse) OR \"tumor\" and x"),
            vec!["mouse".to_string(), "tumor".to_string()]
        );
        assert_eq!(
            fallback_candidates("mouse tumor OR cancer"),
            vec!["mouse tumor".to_string(), "cancer".to_string(), "mouse".to_string(), "tumor".to_string()]
        );
    }

    #[test]
    fn test_normalize_limits_and_truncates() {
        let long_title = "x".repeat(300);
        let results: Vec<Value> = (0..12).map(|i| json!({"title": long_title, "accession": format!("S-{i}")})).collect();
        let page = normalize_payload(SearchKind::Datasets, "", 20, results, None, "u".into());
        let compact = page["results"].as_array().unwrap();
        assert_eq!(compact.len(), 8);
        assert_eq!(page["total"], 8);
        assert_eq!(compact[0]["title"].as_str().unwrap().chars().count(), 180);
    }

    #[tokio::test]
    async fn test_empty_primary_falls_back_to_single_terms() {
        let client = Arc::new(ScriptedArchive::new(&[
            ("mouse", json!({"hits": [hit("S-1", "Mouse brain"), hit("S-2", "Mouse tumor model")]})),
            ("tumor", json!({"hits": {"hits": [hit("S-2", "Mouse tumor model"), hit("S-3", "Tumor slices")], "total": {"value": 2}}})),
        ]));
        let search = ArchiveSearch::new(client.clone(), STUDY);
        let page = search.search_datasets("mouse AND tumor", 5).await.unwrap();
        assert_eq!(page["total"], 3);
        assert_eq!(page["fallback_terms_used"], json!(["mouse", "tumor"]));
        assert_eq!(page["results"][0]["accession"], "S-2");
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec!["mouse AND tumor".to_string(), "mouse".to_string(), "tumor".to_string()]
        );
    }

    #[tokio::test]
    async fn test_weak_primary_is_enriched() {
        let client = Arc::new(ScriptedArchive::new(&[
            ("mouse tumor", json!({"hits": [hit("S-9", "Unrelated imaging")]})),
            ("mouse", json!({"hits": [hit("S-4", "Mouse tumor xenograft")]})),
        ]));
        let search = ArchiveSearch::new(client.clone(), STUDY);
        let page = search.search_datasets("mouse tumor", 5).await.unwrap();
        assert_eq!(page["enriched_with_query"], "mouse");
        assert_eq!(page["results"][0]["accession"], "S-4");
        assert_eq!(page["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_registered_tools() {
        let client = Arc::new(ScriptedArchive::new(&[]));
        let mut registry = ToolRegistry::new();
        register_archive_tools(&mut registry, Arc::new(ArchiveSearch::new(client, STUDY)));
        assert_eq!(
            registry.tool_names(),
            vec!["search_datasets", "search_images", "explain_advanced_query_syntax"]
        );
        let guide = registry
            .execute("explain_advanced_query_syntax", json!({}))
            .await
            .unwrap();
        assert!(guide.as_str().unwrap().contains("Wildcards"));
        let empty = registry
            .execute("search_images", json!({"query": "cells"}))
            .await
            .unwrap();
        assert_eq!(empty["total"], 0);
    }
}
