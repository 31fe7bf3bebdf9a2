//! LLM 层：对话与嵌入客户端抽象及实现（OpenAI 兼容 / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{Embedder, OpenAiEmbedder};
pub use mock::{MockEmbedder, MockLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{complete_structured, LlmClient, LlmError, Message, Role};
