//! Qdrant HTTP 索引：POST /collections/{collection}/points/query

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::retrieval::{compare_hits, IndexError, IndexHit, VectorIndex};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f64,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

impl ScoredPoint {
    /// 文档 ID 优先取 payload.id（arXiv 编号），否则用点 ID
    fn into_hit(self) -> IndexHit {
        let mut metadata = self.payload.unwrap_or_default();
        let document_id = match metadata.get("id") {
            Some(Value::String(s)) => s.clone(),
            _ => match &self.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        metadata.insert("point_id".to_string(), self.id);
        IndexHit {
            document_id,
            similarity: self.score,
            metadata,
        }
    }
}

pub struct QdrantIndex {
    client: Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
}

impl QdrantIndex {
    pub fn new(
        base_url: &str,
        collection: &str,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, IndexError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| IndexError::Request(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
        })
    }

    fn query_url(&self) -> String {
        format!("{}/collections/{}/points/query", self.base_url, self.collection)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let mut request = self.client.post(self.query_url()).json(&json!({
            "query": vector,
            "limit": top_k,
            "with_payload": true,
            "with_vector": false,
        }));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let error = IndexError::from_status(status.as_u16(), &body);
            tracing::warn!(
                collection = %self.collection,
                status = status.as_u16(),
                error = %error,
                "qdrant query failed"
            );
            return Err(error);
        }

        let body: QueryResponse = resp
            .json()
            .await
            .map_err(|e| IndexError::Decode(e.to_string()))?;
        let mut hits: Vec<IndexHit> = body.result.points.into_iter().map(ScoredPoint::into_hit).collect();
        hits.sort_by(compare_hits);
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_response() {
        let body = r#"{
            "result": {"points": [
                {"id": 7, "score": 0.42, "payload": {"id": "2401.00001", "title": "A"}},
                {"id": "5c56c793-69f3-4fbf-87e6-c4bf54c28c26", "score": 0.91}
            ]},
            "status": "ok",
            "time": 0.002
        }"#;
        let parsed: QueryResponse = serde_json::from_str(body).unwrap();
        let hits: Vec<IndexHit> = parsed.result.points.into_iter().map(ScoredPoint::into_hit).collect();
        assert_eq!(hits[0].document_id, "2401.00001");
        assert_eq!(hits[0].metadata["point_id"], json!(7));
        assert_eq!(hits[1].document_id, "5c56c793-69f3-4fbf-87e6-c4bf54c28c26");
    }

    #[test]
    fn test_query_url() {
        let index = QdrantIndex::new(
            "http://localhost:6333/",
            "arxiv_papers",
            None,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(
            index.query_url(),
            "http://localhost:6333/collections/arxiv_papers/points/query"
        );
    }
}
