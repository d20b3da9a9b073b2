//! Offline search tool returning deterministic mock results.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{int_arg, ParamType, Tool, ToolError, ToolParameter};

const DEFAULT_LIMIT: u64 = 3;
const MAX_LIMIT: u64 = 5;

pub struct SearchTool;

fn mock_results(query: &str) -> Vec<Value> {
    let slug = query.trim().replace(' ', "-");
    [
        (
            format!("Result 1: {} - Introduction and Overview", query),
            format!("This is a comprehensive guide about {}. Learn the basics and advanced concepts...", query),
            "guide",
            "2024-01-15",
        ),
        (
            format!("Result 2: Best Practices for {}", query),
            format!("Discover the best practices and tips for {}. Expert recommendations and examples...", query),
            "best-practices",
            "2024-01-10",
        ),
        (
            format!("Result 3: {} Tutorial for Beginners", query),
            format!("Step-by-step tutorial on {} for beginners. Start your journey today...", query),
            "tutorial",
            "2024-01-05",
        ),
        (
            format!("Result 4: Advanced {} Techniques", query),
            format!("Take your {} skills to the next level with these advanced techniques...", query),
            "advanced",
            "2024-01-01",
        ),
        (
            format!("Result 5: {} FAQ and Common Issues", query),
            format!(
                "Find answers to frequently asked questions about {} and solutions to common problems...",
                query
            ),
            "faq",
            "2023-12-28",
        ),
    ]
    .into_iter()
    .map(|(title, snippet, suffix, date)| {
        json!({
            "title": title,
            "snippet": snippet,
            "url": format!("https://example.com/{}-{}", slug, suffix),
            "date": date,
        })
    })
    .collect()
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the web for information on any topic"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required(
                "query",
                ParamType::String,
                "Search query (e.g., 'Rust programming', 'latest AI news')",
            ),
            ToolParameter::optional(
                "limit",
                ParamType::Number,
                "Maximum number of results to return (default: 3)",
            ),
        ]
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<Value, ToolError> {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return Err(ToolError::InvalidArguments("'query' must be a string".into()));
        };
        let limit = int_arg(&args, "limit").unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT) as usize;

        let results: Vec<Value> = mock_results(query).into_iter().take(limit).collect();
        Ok(json!({
            "success": true,
            "query": query,
            "total_results": results.len(),
            "results": results,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_and_capped_limits() {
        let mut args = HashMap::new();
        args.insert("query".to_string(), json!("rust async"));
        let value = SearchTool.execute(args.clone()).await.unwrap();
        assert_eq!(value["total_results"], 3);
        assert_eq!(value["results"][0]["url"], "https://example.com/rust-async-guide");

        args.insert("limit".to_string(), json!(50));
        let value = SearchTool.execute(args).await.unwrap();
        assert_eq!(value["results"].as_array().unwrap().len(), 5);
    }
}
