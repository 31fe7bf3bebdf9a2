//! 检索层：向量索引协作方与重排协作方
//!
//! VectorIndex::query(vector, top_k) 返回 (document_id, similarity, metadata)，按相似度降序、
//! 同分按文档 ID 字典序；Reranker 用更贵的相关性模型对候选重新排序。

pub mod index;
pub mod qdrant;
pub mod rerank;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::StageError;
use crate::llm::LlmError;

pub use index::{IndexedDocument, InMemoryIndex};
pub use qdrant::QdrantIndex;
pub use rerank::LlmReranker;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    #[error("vector index timed out: {0}")]
    Timeout(String),

    #[error("vector index rejected credentials: {0}")]
    Auth(String),

    #[error("vector index request failed: {0}")]
    Request(String),

    #[error("malformed vector index response: {0}")]
    Decode(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Unavailable(_) | IndexError::Timeout(_))
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("status {status}: {}", body.chars().take(200).collect::<String>());
        match status {
            401 | 403 => IndexError::Auth(detail),
            408 => IndexError::Timeout(detail),
            429 | 500..=599 => IndexError::Unavailable(detail),
            _ => IndexError::Request(detail),
        }
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            IndexError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            IndexError::Unavailable(e.to_string())
        } else if e.is_decode() {
            IndexError::Decode(e.to_string())
        } else {
            IndexError::Request(e.to_string())
        }
    }
}

impl From<IndexError> for StageError {
    fn from(e: IndexError) -> Self {
        if e.is_retryable() {
            StageError::Retryable(e.to_string())
        } else {
            StageError::Fatal(e.to_string())
        }
    }
}

/// 索引命中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub document_id: String,
    pub similarity: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// 相似度降序，同分按文档 ID 升序
pub fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.document_id.cmp(&b.document_id))
}

/// 检索到的文献，创建后不再修改相似度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub document_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub similarity: f64,
    /// 检索排序中的名次（从 1 开始）
    pub original_rank: usize,
    /// 重排 / 截断后的名次（从 1 开始）
    pub final_rank: usize,
    #[serde(default)]
    pub rerank_score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Reference {
    pub fn from_hit(hit: IndexHit, rank: usize) -> Self {
        let text = |key: &str| {
            hit.metadata
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let title = text("title");
        Self {
            title: if title.is_empty() {
                "Unknown Title".to_string()
            } else {
                title
            },
            abstract_text: text("abstract"),
            document_id: hit.document_id,
            similarity: hit.similarity,
            original_rank: rank,
            final_rank: rank,
            rerank_score: None,
            metadata: hit.metadata,
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>, IndexError>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// 返回按相关性重排后的候选，rerank_score 已填写
    async fn rerank(&self, query: &str, candidates: Vec<Reference>) -> Result<Vec<Reference>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(id: &str, similarity: f64) -> IndexHit {
        IndexHit {
            document_id: id.to_string(),
            similarity,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_hits_sorted_desc_with_id_tie_break() {
        let mut hits = vec![hit("b", 0.5), hit("c", 0.9), hit("a", 0.5)];
        hits.sort_by(compare_hits);
        let ids: Vec<_> = hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_reference_from_hit_reads_metadata() {
        let mut metadata = Map::new();
        metadata.insert("title".into(), json!("Low-bit inference"));
        metadata.insert("abstract".into(), json!("We quantize."));
        let reference = Reference::from_hit(
            IndexHit {
                document_id: "2401.00001".into(),
                similarity: 0.7,
                metadata,
            },
            3,
        );
        assert_eq!(reference.title, "Low-bit inference");
        assert_eq!(reference.abstract_text, "We quantize.");
        assert_eq!(reference.original_rank, 3);

        let untitled = Reference::from_hit(hit("x", 0.1), 1);
        assert_eq!(untitled.title, "Unknown Title");
    }

    #[test]
    fn test_index_error_classification() {
        assert!(IndexError::from_status(503, "").is_retryable());
        assert!(!IndexError::from_status(404, "no collection").is_retryable());
        let e: StageError = IndexError::Timeout("5s".into()).into();
        assert!(e.is_retryable());
    }
}
