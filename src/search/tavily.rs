//! Tavily 搜索客户端
//!
//! POST {endpoint} 携带 api_key / query / max_results；结果按 URL 去重，
//! 片段若是 HTML 则用 html2text 提取可读文本。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::search::{SearchError, SearchHit, WebSearch};

const MAX_SNIPPET_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

pub struct TavilySearch {
    client: Client,
    endpoint: String,
    api_key: String,
    max_results: usize,
}

impl TavilySearch {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        max_results: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, SearchError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SearchError::Provider(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            max_results,
        })
    }
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || (s.contains('<') && (s.contains("</") || s.contains("<br") || s.contains("<p>")))
}

pub(crate) fn clean_snippet(raw: &str) -> String {
    let text = if looks_like_html(raw) {
        match html2text::from_read(raw.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => raw.to_string(),
        }
    } else {
        raw.to_string()
    };
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() > MAX_SNIPPET_CHARS {
        text.chars().take(MAX_SNIPPET_CHARS).collect::<String>() + "..."
    } else {
        text
    }
}

fn into_hits(results: Vec<TavilyResult>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(r.url.clone()))
        .map(|r| SearchHit {
            title: r.title.trim().to_string(),
            snippet: clean_snippet(&r.content),
            url: r.url,
        })
        .collect()
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        tracing::debug!(query, max_results = self.max_results, "tavily search");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": self.max_results,
                "include_raw_content": false,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let error = SearchError::from_status(status.as_u16(), &body);
            tracing::warn!(query, status = status.as_u16(), error = %error, "tavily search failed");
            return Err(error);
        }

        let body: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(into_hits(body.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_deduplicated_by_url_in_order() {
        let results = vec![
            TavilyResult {
                title: " A ".into(),
                url: "https://a".into(),
                content: "first".into(),
            },
            TavilyResult {
                title: "B".into(),
                url: "https://b".into(),
                content: "second".into(),
            },
            TavilyResult {
                title: "A again".into(),
                url: "https://a".into(),
                content: "dup".into(),
            },
        ];
        let hits = into_hits(results);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "A");
        assert_eq!(hits[1].url, "https://b");
    }

    #[test]
    fn test_clean_snippet_strips_html_and_whitespace() {
        let cleaned = clean_snippet("<p>Low   precision</p><p>inference</p>");
        assert!(!cleaned.contains('<'));
        assert!(cleaned.contains("Low precision"));
        assert_eq!(clean_snippet("plain\n\n text"), "plain text");
    }

    #[test]
    fn test_client_keeps_configured_endpoint() {
        let search = TavilySearch::new(
            "https://api.tavily.com/search",
            "tvly-test",
            5,
            Some(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!(search.endpoint, "https://api.tavily.com/search");
        assert_eq!(search.max_results, 5);
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let body: TavilyResponse =
            serde_json::from_str(r#"{"results": [{"url": "https://x"}]}"#).unwrap();
        assert_eq!(body.results.len(), 1);
        let empty: TavilyResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.results.is_empty());
    }
}
