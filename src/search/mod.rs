//! Web 搜索协作方：search(query) -> 有序 (title, snippet, url) 序列，有限，可能为空

pub mod tavily;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::StageError;

pub use tavily::TavilySearch;

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search rate limited: {0}")]
    RateLimited(String),

    #[error("search timed out: {0}")]
    Timeout(String),

    #[error("search network error: {0}")]
    Network(String),

    #[error("search authentication failed: {0}")]
    Auth(String),

    #[error("search provider error: {0}")]
    Provider(String),

    #[error("malformed search response: {0}")]
    Decode(String),
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::RateLimited(_) | SearchError::Timeout(_) | SearchError::Network(_)
        )
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("status {status}: {}", body.chars().take(200).collect::<String>());
        match status {
            401 | 403 => SearchError::Auth(detail),
            408 => SearchError::Timeout(detail),
            429 => SearchError::RateLimited(detail),
            500..=599 => SearchError::Network(detail),
            _ => SearchError::Provider(detail),
        }
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SearchError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            SearchError::Network(e.to_string())
        } else if e.is_decode() {
            SearchError::Decode(e.to_string())
        } else {
            SearchError::Provider(e.to_string())
        }
    }
}

impl From<SearchError> for StageError {
    fn from(e: SearchError) -> Self {
        if e.is_retryable() {
            StageError::Retryable(e.to_string())
        } else {
            StageError::Fatal(e.to_string())
        }
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}
