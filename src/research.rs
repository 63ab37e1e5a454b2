use std::collections::HashSet;
use std::time::Duration;

use futures_core::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::chat::{http_error, normalize_usage, read_json, read_u64};
use crate::credentials::ProviderKey;
use crate::error::ProviderError;
use crate::models::{ResearchBundle, ResearchDepth, SearchResult, TokenUsage};

const PERPLEXITY_BASE: &str = "https://api.perplexity.ai";

/// Results kept after dedup + ranking.
const MAX_RESULTS: usize = 10;

/// Additive query tiers: shallow takes the first 3, moderate the first 5,
/// deep all 9. Each tier is a superset of the one below.
const QUERY_TEMPLATES: [&str; 9] = [
    "{topic}",
    "what is {topic} and why does it matter",
    "latest developments in {topic}",
    "{topic} best practices and common mistakes",
    "{topic} statistics and market data",
    "expert opinions on {topic}",
    "{topic} case studies and real world examples",
    "how to get started with {topic} step by step",
    "future trends and predictions for {topic}",
];

impl ResearchDepth {
    pub fn query_count(self) -> usize {
        match self {
            ResearchDepth::Shallow => 3,
            ResearchDepth::Moderate => 5,
            ResearchDepth::Deep => 9,
        }
    }

    /// Search model tier: lighter for shallow, heavier for deep.
    pub fn model(self) -> &'static str {
        match self {
            ResearchDepth::Shallow => "sonar",
            ResearchDepth::Moderate => "sonar-pro",
            ResearchDepth::Deep => "sonar-reasoning-pro",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResearchDepth::Shallow => "shallow",
            ResearchDepth::Moderate => "moderate",
            ResearchDepth::Deep => "deep",
        }
    }
}

impl ResearchBundle {
    /// Full concatenated research content, as fed to the writer prompts.
    pub fn full_text(&self) -> String {
        self.results
            .iter()
            .map(|r| format!("Source: {} ({})\n{}", r.title, r.url, r.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Research seam. One call answers one query against a given model tier.
pub trait ResearchApi: Send + Sync {
    fn search<'a>(&'a self, query: &'a str, model: &'a str)
    -> BoxFuture<'a, Result<ResearchHit, ProviderError>>;
}

#[derive(Debug, Clone, Default)]
pub struct ResearchHit {
    pub results: Vec<SearchResult>,
    pub usage: TokenUsage,
}

pub struct PerplexityClient {
    http: reqwest::Client,
    key: Option<ProviderKey>,
}

impl PerplexityClient {
    pub fn new(key: Option<ProviderKey>, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plume/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| http_error("perplexity", e))?;
        Ok(Self { http, key })
    }
}

impl ResearchApi for PerplexityClient {
    fn search<'a>(
        &'a self,
        query: &'a str,
        model: &'a str,
    ) -> BoxFuture<'a, Result<ResearchHit, ProviderError>> {
        Box::pin(async move {
            let Some(ref key) = self.key else {
                return Err(ProviderError::Api {
                    provider: "perplexity".to_string(),
                    status: 401,
                    body: "no perplexity API key configured".to_string(),
                });
            };
            let base = key.base_url.as_deref().unwrap_or(PERPLEXITY_BASE);
            let url = format!("{}/chat/completions", base.trim_end_matches('/'));
            let body = json!({
                "model": model,
                "messages": [
                    {
                        "role": "system",
                        "content": "You are a research assistant. Answer with dense, factual, current information and cite your sources.",
                    },
                    {"role": "user", "content": query},
                ],
                "temperature": 0.2,
                "max_tokens": 1024,
            });

            let response = self
                .http
                .post(&url)
                .bearer_auth(&key.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| http_error("perplexity", e))?;
            let value = read_json("perplexity", response).await?;

            let answer = value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let citation = value
                .pointer("/citations/0")
                .and_then(Value::as_str)
                .or_else(|| value.pointer("/search_results/0/url").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            let usage = normalize_usage(TokenUsage {
                input: read_u64(&value, "/usage/prompt_tokens"),
                output: read_u64(&value, "/usage/completion_tokens"),
                total: read_u64(&value, "/usage/total_tokens"),
            });

            let mut results = Vec::new();
            if !answer.is_empty() {
                results.push(SearchResult {
                    title: query.to_string(),
                    content: answer,
                    url: citation,
                    relevance_score: 0.0,
                });
            }
            Ok(ResearchHit { results, usage })
        })
    }
}

/// Run the whole research stage. This function cannot fail: every per-query
/// error is absorbed with a warning and the worst case is an empty bundle.
pub async fn run_research(api: &dyn ResearchApi, topic: &str, depth: ResearchDepth) -> ResearchBundle {
    let queries = build_queries(topic, depth);
    let model = depth.model();
    info!(
        topic,
        depth = depth.as_str(),
        model,
        query_count = queries.len(),
        "research starting"
    );

    let mut gathered: Vec<SearchResult> = Vec::new();
    let mut usage = TokenUsage::default();

    for query in &queries {
        match api.search(query, model).await {
            Ok(hit) => {
                usage.add(&hit.usage);
                gathered.extend(hit.results);
            }
            Err(e) => {
                warn!(query = %query, error = %e, "research query failed, continuing");
            }
        }
    }

    let results = rank_results(gathered, topic);
    info!(results = results.len(), total_tokens = usage.total, "research finished");

    ResearchBundle {
        topic: topic.to_string(),
        model: model.to_string(),
        queries,
        results,
        usage,
    }
}

fn build_queries(topic: &str, depth: ResearchDepth) -> Vec<String> {
    QUERY_TEMPLATES
        .iter()
        .take(depth.query_count())
        .map(|t| t.replace("{topic}", topic))
        .collect()
}

/// Dedup by the first 100 chars of content (case-insensitive, first wins),
/// score by topic-term frequency, sort descending, keep the top 10.
fn rank_results(results: Vec<SearchResult>, topic: &str) -> Vec<SearchResult> {
    let topic_words: Vec<String> = topic
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() >= 3)
        .map(String::from)
        .collect();

    let mut seen = HashSet::new();
    let mut kept: Vec<SearchResult> = Vec::new();
    for mut r in results {
        let key: String = r.content.chars().take(100).collect::<String>().to_lowercase();
        if !seen.insert(key) {
            continue;
        }
        r.relevance_score = relevance(&topic_words, &r.title, &r.content);
        kept.push(r);
    }

    kept.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    kept.truncate(MAX_RESULTS);
    kept
}

/// Title matches weigh 2x, content matches 1x normalized by content length.
fn relevance(topic_words: &[String], title: &str, content: &str) -> f64 {
    let title_lc = title.to_lowercase();
    let content_lc = content.to_lowercase();
    let content_len = content_lc.split_whitespace().count().max(1) as f64;

    let mut score = 0.0;
    for word in topic_words {
        score += 2.0 * title_lc.matches(word.as_str()).count() as f64;
        score += content_lc.matches(word.as_str()).count() as f64 / content_len;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingResearch;

    impl ResearchApi for FailingResearch {
        fn search<'a>(
            &'a self,
            _query: &'a str,
            _model: &'a str,
        ) -> BoxFuture<'a, Result<ResearchHit, ProviderError>> {
            Box::pin(async {
                Err(ProviderError::Api {
                    provider: "perplexity".to_string(),
                    status: 500,
                    body: "search backend down".to_string(),
                })
            })
        }
    }

    struct CannedResearch {
        per_query: Vec<SearchResult>,
    }

    impl ResearchApi for CannedResearch {
        fn search<'a>(
            &'a self,
            _query: &'a str,
            _model: &'a str,
        ) -> BoxFuture<'a, Result<ResearchHit, ProviderError>> {
            Box::pin(async {
                Ok(ResearchHit {
                    results: self.per_query.clone(),
                    usage: TokenUsage {
                        input: 50,
                        output: 20,
                        total: 70,
                    },
                })
            })
        }
    }

    fn result(title: &str, content: &str) -> SearchResult {
        SearchResult {
            title: title.to_string(),
            content: content.to_string(),
            url: String::new(),
            relevance_score: 0.0,
        }
    }

    #[test]
    fn tiers_are_additive_supersets() {
        let shallow = build_queries("rust", ResearchDepth::Shallow);
        let moderate = build_queries("rust", ResearchDepth::Moderate);
        let deep = build_queries("rust", ResearchDepth::Deep);

        assert_eq!(shallow.len(), 3);
        assert_eq!(moderate.len(), 5);
        assert_eq!(deep.len(), 9);
        assert_eq!(&moderate[..3], &shallow[..]);
        assert_eq!(&deep[..5], &moderate[..]);
        assert!(shallow.iter().all(|q| q.contains("rust")));
    }

    #[test]
    fn depth_maps_to_model_tier() {
        assert_eq!(ResearchDepth::Shallow.model(), "sonar");
        assert_eq!(ResearchDepth::Moderate.model(), "sonar-pro");
        assert_eq!(ResearchDepth::Deep.model(), "sonar-reasoning-pro");
    }

    #[tokio::test]
    async fn every_query_failing_yields_empty_bundle_with_zero_usage() {
        let bundle = run_research(&FailingResearch, "composting", ResearchDepth::Deep).await;
        assert!(bundle.results.is_empty());
        assert_eq!(bundle.usage, TokenUsage::default());
        assert_eq!(bundle.queries.len(), 9);
    }

    #[tokio::test]
    async fn usage_accumulates_across_queries() {
        let api = CannedResearch {
            per_query: vec![result("composting basics", "compost is decomposed organic matter")],
        };
        let bundle = run_research(&api, "composting", ResearchDepth::Shallow).await;
        assert_eq!(bundle.usage.total, 3 * 70);
        // identical content across queries dedups to one result
        assert_eq!(bundle.results.len(), 1);
    }

    #[test]
    fn dedup_is_case_insensitive_on_content_prefix() {
        let results = vec![
            result("a", "The SAME opening one hundred characters of content"),
            result("b", "the same opening one hundred characters of content"),
            result("c", "completely different content body"),
        ];
        let ranked = rank_results(results, "anything");
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(|r| r.title == "a"));
        assert!(!ranked.iter().any(|r| r.title == "b"));
    }

    #[test]
    fn title_matches_outrank_content_matches() {
        let results = vec![
            result("unrelated heading", "composting composting composting filler words here"),
            result("composting guide", "filler words entirely"),
        ];
        let ranked = rank_results(results, "composting");
        assert_eq!(ranked[0].title, "composting guide");
        assert!(ranked[0].relevance_score > ranked[1].relevance_score);
    }

    #[test]
    fn at_most_ten_results_survive() {
        let results: Vec<SearchResult> = (0..25)
            .map(|i| result(&format!("title {i}"), &format!("unique content body number {i}")))
            .collect();
        assert_eq!(rank_results(results, "topic").len(), 10);
    }

    #[test]
    fn full_text_concatenates_all_results() {
        let mut bundle = ResearchBundle::empty("t");
        bundle.results = vec![
            result("first", "alpha"),
            result("second", "beta"),
        ];
        let text = bundle.full_text();
        assert!(text.contains("first"));
        assert!(text.contains("alpha"));
        assert!(text.contains("beta"));
    }
}
