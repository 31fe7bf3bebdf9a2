//! LLM 重排：OpenAI 兼容的重排模型返回与候选等长的 JSON 浮点数组

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::traits::extract_json;
use crate::llm::{LlmClient, LlmError, Message};
use crate::retrieval::{Reference, Reranker};

pub struct LlmReranker {
    llm: Arc<dyn LlmClient>,
}

impl LlmReranker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

fn document_text(reference: &Reference) -> String {
    format!(
        "Title: {}\nAbstract: {}",
        reference.title, reference.abstract_text
    )
}

/// 解析分数数组；长度必须与候选数一致，分数截断到 [0, 1]
pub(crate) fn parse_scores(reply: &str, expected: usize) -> Result<Vec<f64>, LlmError> {
    let json = extract_json(reply)
        .ok_or_else(|| LlmError::Schema("reranker reply carried no JSON array".to_string()))?;
    let scores: Vec<f64> =
        serde_json::from_str(json).map_err(|e| LlmError::Schema(format!("reranker scores: {e}")))?;
    if scores.len() != expected {
        return Err(LlmError::Schema(format!(
            "reranker returned {} scores for {} documents",
            scores.len(),
            expected
        )));
    }
    Ok(scores.into_iter().map(|s| s.clamp(0.0, 1.0)).collect())
}

/// 按重排分数降序（稳定排序，同分保持检索名次）
pub(crate) fn apply_scores(mut candidates: Vec<Reference>, scores: Vec<f64>) -> Vec<Reference> {
    for (reference, score) in candidates.iter_mut().zip(scores) {
        reference.rerank_score = Some(score);
    }
    candidates.sort_by(|a, b| {
        b.rerank_score
            .unwrap_or(0.0)
            .total_cmp(&a.rerank_score.unwrap_or(0.0))
            .then_with(|| a.original_rank.cmp(&b.original_rank))
    });
    candidates
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(&self, query: &str, candidates: Vec<Reference>) -> Result<Vec<Reference>, LlmError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let documents: Vec<String> = candidates.iter().map(document_text).collect();
        let messages = [
            Message::system(
                "You are a reranking model. Rate the relevance of each document to the query \
                 between 0 and 1. Return the scores as a JSON array of floats, one per document, in order.",
            ),
            Message::user(format!(
                "Query: {query}\n\nDocuments:\n{}\n\nReturn relevance scores:",
                documents
                    .iter()
                    .enumerate()
                    .map(|(i, d)| format!("[{}] {}", i + 1, d))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            )),
        ];
        let reply = self.llm.complete(&messages).await?;
        let scores = parse_scores(&reply, candidates.len())?;
        tracing::debug!(candidates = candidates.len(), "reranked");
        Ok(apply_scores(candidates, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::Map;

    fn reference(id: &str, rank: usize) -> Reference {
        Reference {
            document_id: id.to_string(),
            title: id.to_uppercase(),
            abstract_text: String::new(),
            similarity: 1.0 - rank as f64 * 0.1,
            original_rank: rank,
            final_rank: rank,
            rerank_score: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_length_mismatch_is_schema_error() {
        let err = parse_scores("[0.1, 0.2]", 3).unwrap_err();
        assert!(matches!(err, LlmError::Schema(_)));
        assert!(parse_scores("no scores", 1).is_err());
        assert_eq!(parse_scores("[1.5, -0.2]", 2).unwrap(), vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_keeps_similarity() {
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok("[0.2, 0.9, 0.2]".to_string())]));
        let reranker = LlmReranker::new(llm);
        let out = reranker
            .rerank("idea", vec![reference("a", 1), reference("b", 2), reference("c", 3)])
            .await
            .unwrap();
        let ids: Vec<_> = out.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(out[0].rerank_score, Some(0.9));
        assert!((out[0].similarity - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_the_model() {
        let llm = Arc::new(MockLlmClient::new());
        let reranker = LlmReranker::new(llm.clone());
        assert!(reranker.rerank("idea", vec![]).await.unwrap().is_empty());
        assert_eq!(llm.calls(), 0);
    }
}
