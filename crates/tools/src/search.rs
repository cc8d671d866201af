//! Web search tools: `web_search`, `deep_research`, `fact_check`.
//!
//! The search backend itself is an external collaborator behind
//! [`SearchProvider`]; the tools own result formatting, the fetch +
//! distill map-reduce of deep research, and the forensic fact-check loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use ghost_domain::chat::{ChatPayload, Message, ToolDefinition};
use ghost_domain::Result;
use ghost_router::{PoolKind, Upstream};
use serde_json::Value;

use crate::{require_str, Tool};

/// Domains filtered from deep-research link selection: they mostly serve
/// captchas to anonymized traffic.
const JUNK_DOMAINS: &[&str] = &[
    "forums.att.com",
    "reddit.com",
    "quora.com",
    "facebook.com",
    "twitter.com",
];

/// Pages fetched per deep-research run.
const RESEARCH_PAGES: usize = 4;
/// Characters of page text fed to the fact extractor.
const EXTRACT_INPUT_CAP: usize = 15_000;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// The search/crawl backend interface. Implementations handle their own
/// anonymization and retry policy (Tor rotation between attempts).
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>>;

    /// Fetch one page and return its readable text.
    async fn fetch_page(&self, url: &str) -> Result<String>;
}

fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "ERROR: the search returned ZERO results. This usually means the query was too \
                specific or the engine is blocking the request. TRY A BROADER QUERY."
            .into();
    }
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "### {}. {}\n{}\n[Source: {}]",
                i + 1,
                hit.title,
                hit.snippet,
                hit.url
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// web_search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WebSearchTool {
    pub provider: Arc<dyn SearchProvider>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the internet (Anonymous via Tor).".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let query = match require_str(&args, "query") {
            Ok(q) => q,
            Err(e) => return e,
        };
        tracing::info!(query, "web search");
        match self.provider.search(query, 5).await {
            Ok(hits) => format_hits(&hits),
            Err(e) => format!("Error: Search failed: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// deep_research
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeepResearchTool {
    pub provider: Arc<dyn SearchProvider>,
    pub upstream: Arc<dyn Upstream>,
    pub model: String,
}

impl DeepResearchTool {
    /// Fetch one source and distill the facts relevant to the query on a
    /// worker node. Falls back to a raw-text preview when the worker is
    /// unavailable.
    async fn process_url(&self, query: &str, url: &str) -> String {
        tracing::info!(url, "parsing research source");
        let text = match self.provider.fetch_page(url).await {
            Ok(t) => t,
            Err(e) => return format!("### SOURCE: {url}\nError reading source: {e}\n"),
        };

        let input_end = text
            .char_indices()
            .take_while(|(i, _)| *i < EXTRACT_INPUT_CAP)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let prompt = format!(
            "Extract ONLY the hard facts explicitly relevant to this query: '{query}'. Ignore \
             all other boilerplate. If no relevant info is found, state that.\n\nSource text:\n{}",
            &text[..input_end]
        );
        let mut payload = ChatPayload::new(self.model.clone(), vec![Message::user(prompt)]);
        payload.temperature = Some(0.0);
        payload.max_tokens = Some(500);

        let preview = match self.upstream.chat(payload, PoolKind::Worker, None).await {
            Ok(body) => {
                let content = Message::from_completion(&body).text().trim().to_string();
                if content.is_empty() {
                    preview_of(&text)
                } else {
                    format!("[EDGE EXTRACTED FACTS]:\n{content}")
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "fact distillation failed, using raw preview");
                preview_of(&text)
            }
        };
        format!("### SOURCE: {url}\n{preview}\n[...truncated...]\n")
    }

    pub async fn research(&self, query: &str) -> String {
        tracing::info!(query, "deep research");
        let hits = match self.provider.search(query, 10).await {
            Ok(h) => h,
            Err(e) => return format!("CRITICAL ERROR: Deep Research search phase failed: {e}"),
        };

        let mut urls: Vec<String> = hits
            .iter()
            .filter(|h| {
                let url = h.url.to_lowercase();
                !JUNK_DOMAINS.iter().any(|junk| url.contains(junk))
            })
            .map(|h| h.url.clone())
            .collect();
        if urls.is_empty() {
            urls = hits.first().map(|h| vec![h.url.clone()]).unwrap_or_default();
        }
        urls.truncate(RESEARCH_PAGES);

        if urls.is_empty() {
            return "ERROR: No search results found. The internet might be blocking your \
                    request. Try a different query."
                .into();
        }

        let sections = join_all(urls.iter().map(|url| self.process_url(query, url))).await;
        format!(
            "--- DEEP RESEARCH RESULT ---\n{}\n\nSYSTEM INSTRUCTION: Analyze the text above.",
            sections.join("\n\n")
        )
    }
}

fn preview_of(text: &str) -> String {
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < 3000)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    text[..end].to_string()
}

#[async_trait]
impl Tool for DeepResearchTool {
    fn name(&self) -> &'static str {
        "deep_research"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "deep_research".into(),
            description: "Performs deep analysis by searching multiple sources and synthesizing \
                          a report."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        match require_str(&args, "query") {
            Ok(query) => self.research(query).await,
            Err(e) => e,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fact_check
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FactCheckTool {
    pub research: Arc<DeepResearchTool>,
    pub upstream: Arc<dyn Upstream>,
    pub model: String,
}

#[async_trait]
impl Tool for FactCheckTool {
    fn name(&self) -> &'static str {
        "fact_check"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fact_check".into(),
            description: "Verify a claim using deep research and external sources.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let claim = match require_str(&args, "query") {
            Ok(q) => q.to_string(),
            Err(e) => return e,
        };
        tracing::info!(claim = %claim, "fact check");

        // Restricted inner loop: the verifier model may only call
        // deep_research, and only once.
        let mut messages = vec![
            Message::system(
                "### ROLE: DEEP FORENSIC VERIFIER\nVerify this claim with deep_research.",
            ),
            Message::user(claim.clone()),
        ];
        let mut payload = ChatPayload::new(self.model.clone(), messages.clone())
            .with_tools(&[self.research.definition()]);
        payload.temperature = Some(0.1);

        let plan = match self.upstream.chat(payload, PoolKind::Main, None).await {
            Ok(body) => Message::from_completion(&body),
            Err(e) => return format!("Error: Fact check failed: {e}"),
        };

        if let Some(call) = plan.tool_calls.first() {
            let query = serde_json::from_str::<Value>(&call.function.arguments)
                .ok()
                .and_then(|v| v.get("query").and_then(|q| q.as_str()).map(String::from))
                .unwrap_or_else(|| claim.clone());

            let evidence = self.research.research(&query).await;
            let call_id = call.id.clone();
            let call_name = call.function.name.clone();
            messages.push(plan);
            messages.push(Message::tool_result(call_id, call_name, evidence));

            let mut verify = ChatPayload::new(self.model.clone(), messages);
            verify.temperature = Some(0.1);
            return match self.upstream.chat(verify, PoolKind::Main, None).await {
                Ok(body) => format!(
                    "FACT CHECK COMPLETE:\n{}",
                    Message::from_completion(&body).text()
                ),
                Err(e) => format!("Error: Fact check verification failed: {e}"),
            };
        }

        let verdict = plan.text();
        if verdict.is_empty() {
            "FACT CHECK COMPLETE:\nFact verified.".into()
        } else {
            format!("FACT CHECK COMPLETE:\n{verdict}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numbered_results() {
        let hits = vec![
            SearchHit {
                title: "A".into(),
                url: "http://a".into(),
                snippet: "alpha".into(),
            },
            SearchHit {
                title: "B".into(),
                url: "http://b".into(),
                snippet: "beta".into(),
            },
        ];
        let out = format_hits(&hits);
        assert!(out.starts_with("### 1. A"));
        assert!(out.contains("### 2. B"));
        assert!(out.contains("[Source: http://b]"));
    }

    #[test]
    fn empty_results_explain_themselves() {
        let out = format_hits(&[]);
        assert!(out.contains("ZERO results"));
    }
}
