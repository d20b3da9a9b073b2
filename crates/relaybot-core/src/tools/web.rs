//! Web search tool: DuckDuckGo HTML results, parsed with `scraper`.
//!
//! HTML parsing is CPU-bound and `scraper::Html` is not `Send`, so it runs
//! on the blocking pool and never stalls sibling tool calls.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{int_arg, ParamType, Tool, ToolError, ToolParameter};

const SEARCH_URL: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_LIMIT: u64 = 5;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; relaybot/0.1)";

pub struct WebSearchTool {
    client: Client,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(client: Client, max_results: u32) -> Self {
        Self {
            client,
            max_results: max_results.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SearchHit {
    title: String,
    snippet: String,
    url: String,
    position: usize,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using DuckDuckGo for real-time information and current events"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required(
                "query",
                ParamType::String,
                "Search query (e.g., 'latest AI news', 'weather in Seoul today')",
            ),
            ToolParameter::optional(
                "limit",
                ParamType::Number,
                "Maximum number of results to return (default: 5)",
            ),
        ]
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<Value, ToolError> {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return Err(ToolError::InvalidArguments("'query' must be a string".into()));
        };
        let limit = int_arg(&args, "limit")
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, u64::from(self.max_results)) as usize;

        debug!(query, limit, "Performing web search");

        let html = match self.fetch(query).await {
            Ok(html) => html,
            Err(e) => {
                warn!(query, error = %e, "Web search failed");
                return Ok(json!({
                    "success": false,
                    "query": query,
                    "error": e,
                    "results": [],
                    "timestamp": Utc::now().to_rfc3339(),
                }));
            }
        };

        let hits = tokio::task::spawn_blocking(move || parse_results(&html, limit))
            .await
            .map_err(|e| ToolError::Execution(format!("result parsing aborted: {}", e)))?;

        Ok(json!({
            "success": true,
            "query": query,
            "total_results": hits.len(),
            "results": hits,
            "timestamp": Utc::now().to_rfc3339(),
            "source": "DuckDuckGo",
        }))
    }
}

impl WebSearchTool {
    async fn fetch(&self, query: &str) -> Result<String, String> {
        let response = self
            .client
            .get(SEARCH_URL)
            .header("User-Agent", USER_AGENT)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Search request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("Search API error ({})", response.status()));
        }
        response
            .text()
            .await
            .map_err(|e| format!("Error reading search results: {}", e))
    }
}

fn parse_results(html: &str, limit: usize) -> Vec<SearchHit> {
    use scraper::{Html, Selector};

    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut hits = Vec::new();

    for result in document.select(&result_sel) {
        if hits.len() >= limit {
            break;
        }
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(resolve_link) else {
            continue;
        };
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|s| collapse_whitespace(s.text()))
            .unwrap_or_default();

        hits.push(SearchHit {
            title: collapse_whitespace(link.text()),
            snippet,
            url,
            position: hits.len() + 1,
        });
    }

    hits
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts.flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// DuckDuckGo wraps targets as `//duckduckgo.com/l/?uddg=<encoded>`; unwrap them.
fn resolve_link(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;

    if url.host_str().is_some_and(|h| h.ends_with("duckduckgo.com")) && url.path().starts_with("/l/") {
        return url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    if url.host_str().is_some_and(|h| h.ends_with("duckduckgo.com")) {
        // Ads and internal navigation.
        return None;
    }
    Some(url.into())
}
