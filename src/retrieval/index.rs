//! 内存向量索引：每篇文档可有多个向量（标题、摘要分段等），相似度取 max-sim

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::retrieval::{compare_hits, IndexError, IndexHit, VectorIndex};

#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub id: String,
    pub vectors: Vec<Vec<f32>>,
    pub metadata: Map<String, Value>,
}

impl IndexedDocument {
    pub fn new(id: impl Into<String>, vectors: Vec<Vec<f32>>) -> Self {
        Self {
            id: id.into(),
            vectors,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    documents: Vec<IndexedDocument>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, document: IndexedDocument) {
        self.documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl FromIterator<IndexedDocument> for InMemoryIndex {
    fn from_iter<I: IntoIterator<Item = IndexedDocument>>(iter: I) -> Self {
        Self {
            documents: iter.into_iter().collect(),
        }
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}

/// 文档所有向量与查询向量的最大相似度；没有向量的文档为 None
pub(crate) fn max_sim(query: &[f32], vectors: &[Vec<f32>]) -> Option<f64> {
    vectors
        .iter()
        .map(|v| cosine_similarity(query, v))
        .max_by(|a, b| a.total_cmp(b))
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let mut hits: Vec<IndexHit> = self
            .documents
            .iter()
            .filter_map(|doc| {
                max_sim(vector, &doc.vectors).map(|similarity| IndexHit {
                    document_id: doc.id.clone(),
                    similarity,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(top_k);
        Ok(hits)
    }
}
