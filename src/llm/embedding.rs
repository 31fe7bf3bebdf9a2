//! 嵌入 API：把想法文本编码为向量，调用 OpenAI 兼容的 /embeddings 端点

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::openai::{classify_openai_error, openai_config};
use crate::llm::traits::LlmError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// 将文本编码为向量
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    /// 期望维度；返回向量长度不符时报错
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, dimensions: Option<usize>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| classify_openai_error("embeddings", e))?;
        let vector = response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| LlmError::Api("embeddings response carried no vectors".to_string()))?;
        check_dimensions(vector, self.dimensions)
    }
}

pub(crate) fn check_dimensions(vector: Vec<f32>, expected: Option<usize>) -> Result<Vec<f32>, LlmError> {
    match expected {
        Some(dim) if vector.len() != dim => Err(LlmError::Schema(format!(
            "embedding has {} dimensions, expected {dim}",
            vector.len()
        ))),
        _ => Ok(vector),
    }
}
