//! 外部协作方的组装：有凭证时接真实服务，否则退回离线实现

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{AppConfig, Credentials};
use crate::llm::{Embedder, LlmClient, MockEmbedder, OpenAiClient, OpenAiEmbedder};
use crate::research::markdown::{FsMarkdownWriter, MarkdownWriter};
use crate::research::offline::{offline_index, offline_llm, OfflineSearch};
use crate::research::review::FeedbackChannel;
use crate::retrieval::{IndexError, LlmReranker, QdrantIndex, Reranker, VectorIndex};
use crate::search::{SearchError, TavilySearch, WebSearch};

/// 真实协作方客户端构建失败
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("web search client: {0}")]
    Search(#[from] SearchError),

    #[error("vector index client: {0}")]
    Index(#[from] IndexError),
}

/// 校验循环的评审方式
#[derive(Clone)]
pub enum Review {
    Automated,
    Human(Arc<dyn FeedbackChannel>),
}

#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn WebSearch>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub writer: Arc<dyn MarkdownWriter>,
    pub review: Review,
}

impl Collaborators {
    /// 全部使用离线实现
    pub fn offline(review: Review) -> Self {
        let embedder = MockEmbedder::default();
        let index = offline_index(&embedder);
        Self {
            llm: Arc::new(offline_llm()),
            search: Arc::new(OfflineSearch),
            embedder: Arc::new(embedder),
            index: Arc::new(index),
            reranker: None,
            writer: Arc::new(FsMarkdownWriter),
            review,
        }
    }

    pub fn from_config(
        cfg: &AppConfig,
        creds: &Credentials,
        review: Review,
    ) -> Result<Self, CollaboratorError> {
        let timeout = (cfg.executor.call_timeout_secs > 0)
            .then(|| Duration::from_secs(cfg.executor.call_timeout_secs));
        let llm = create_llm(cfg, creds);

        let search: Arc<dyn WebSearch> = match &creds.tavily_api_key {
            Some(key) => {
                tracing::info!(endpoint = %cfg.search.endpoint, "Using Tavily web search");
                Arc::new(TavilySearch::new(
                    &cfg.search.endpoint,
                    key,
                    cfg.search.max_results,
                    timeout,
                )?)
            }
            None => {
                tracing::warn!("TAVILY_API_KEY not set, using offline search results");
                Arc::new(OfflineSearch)
            }
        };

        // 向量库与嵌入模型必须同源，否则维度对不上
        let (embedder, index): (Arc<dyn Embedder>, Arc<dyn VectorIndex>) =
            match &creds.embedding_api_key {
                Some(key) => {
                    tracing::info!(
                        model = %cfg.embedding.model,
                        index = %cfg.rag.index_url,
                        collection = %cfg.rag.collection,
                        "Using remote embedding model and Qdrant index"
                    );
                    (
                        Arc::new(OpenAiEmbedder::new(
                            cfg.embedding.base_url.as_deref(),
                            &cfg.embedding.model,
                            key,
                            cfg.embedding.dimensions,
                        )),
                        Arc::new(QdrantIndex::new(
                            &cfg.rag.index_url,
                            &cfg.rag.collection,
                            creds.qdrant_api_key.clone(),
                            timeout,
                        )?),
                    )
                }
                None => {
                    tracing::warn!("No embedding API key set, using offline embedder and index");
                    let embedder = MockEmbedder::default();
                    let index = offline_index(&embedder);
                    (Arc::new(embedder), Arc::new(index))
                }
            };

        let reranker: Option<Arc<dyn Reranker>> = cfg.rag.reranking.enabled.then(|| {
            tracing::info!(model = %cfg.rag.reranking.model, "Reranking enabled");
            let key = creds.openai_api_key.clone().unwrap_or_default();
            let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                Some(&cfg.rag.reranking.base_url),
                &cfg.rag.reranking.model,
                &key,
                0.0,
            ));
            Arc::new(LlmReranker::new(client)) as Arc<dyn Reranker>
        });

        Ok(Self {
            llm,
            search,
            embedder,
            index,
            reranker,
            writer: Arc::new(FsMarkdownWriter),
            review,
        })
    }
}

/// 按 provider 与 API Key 选择 LLM 后端
pub fn create_llm(cfg: &AppConfig, creds: &Credentials) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    match (&creds.openai_api_key, provider.as_str()) {
        (Some(key), "openai") => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                key,
                cfg.llm.temperature,
            ))
        }
        (_, "mock") => {
            tracing::info!("Using offline mock LLM");
            Arc::new(offline_llm())
        }
        _ => {
            tracing::warn!(provider = %provider, "No API key set or provider unknown, using offline mock LLM");
            Arc::new(offline_llm())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_credentials_everything_is_offline() {
        let collaborators = Collaborators::from_config(
            &AppConfig::default(),
            &Credentials::default(),
            Review::Automated,
        )
        .unwrap();
        assert!(collaborators.reranker.is_none());
        assert!(matches!(collaborators.review, Review::Automated));
    }

    #[test]
    fn test_reranker_follows_config() {
        let mut cfg = AppConfig::default();
        cfg.rag.reranking.enabled = true;
        let collaborators =
            Collaborators::from_config(&cfg, &Credentials::default(), Review::Automated).unwrap();
        assert!(collaborators.reranker.is_some());
    }

    #[test]
    fn test_remote_clients_built_with_credentials() {
        let creds = Credentials {
            tavily_api_key: Some("tvly-test".into()),
            embedding_api_key: Some("sk-test".into()),
            ..Credentials::default()
        };
        let collaborators =
            Collaborators::from_config(&AppConfig::default(), &creds, Review::Automated);
        assert!(collaborators.is_ok());
    }
}
