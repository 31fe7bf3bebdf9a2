//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete。结构化输出由 complete_structured 完成：
//! 把 schemars 生成的 JSON Schema 拼入 prompt，解析失败时带着错误信息重新生成，
//! 超过 schema_retries 次仍不合法则返回 LlmError::Schema（归类为 Fatal）。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// LLM 调用错误；限流、超时、网络抖动可重试，其余致命
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider error: {0}")]
    Api(String),

    #[error("response does not match schema: {0}")]
    Schema(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Timeout(_) | LlmError::Network(_)
        )
    }

    /// 按 HTTP 状态码归类：401/403 鉴权，429 限流，5xx 视为瞬时故障
    pub fn from_status(status: u16, provider: &str, body: &str) -> Self {
        let detail = format!("{provider} returned {status}: {}", truncate(body, 200));
        match status {
            401 | 403 => LlmError::Auth(detail),
            408 => LlmError::Timeout(detail),
            429 => LlmError::RateLimited(detail),
            500..=599 => LlmError::Network(detail),
            _ => LlmError::Api(detail),
        }
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        if e.is_retryable() {
            StageError::Retryable(e.to_string())
        } else {
            StageError::Fatal(e.to_string())
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回首条回复文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 类型 T 的 JSON Schema，拼入 prompt 用
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

static FENCED_JSON_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 从回复中取出 JSON：优先 ```json 代码块，否则取第一个 { 或 [ 到最后一个 } 或 ]
pub fn extract_json(text: &str) -> Option<&str> {
    let fenced = FENCED_JSON_RE
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok())
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim());
    if let Some(body) = fenced.filter(|b| !b.is_empty()) {
        return Some(body);
    }
    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    (end >= start).then(|| &text[start..=end])
}

/// 结构化完成：要求模型按 T 的 Schema 输出 JSON，解析失败时带错误重试
pub async fn complete_structured<T>(
    llm: &dyn LlmClient,
    messages: &[Message],
    schema_retries: u32,
) -> Result<T, LlmError>
where
    T: DeserializeOwned + JsonSchema,
{
    let mut conversation = messages.to_vec();
    conversation.push(Message::system(format!(
        "Reply with a single JSON value that validates against this JSON Schema, and nothing else:\n{}",
        schema_json::<T>()
    )));

    let mut last_error = String::new();
    for attempt in 0..=schema_retries {
        let reply = llm.complete(&conversation).await?;
        let parsed = extract_json(&reply)
            .ok_or_else(|| "no JSON found in reply".to_string())
            .and_then(|json| serde_json::from_str::<T>(json).map_err(|e| e.to_string()));
        match parsed {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "structured output rejected");
                last_error = e;
                conversation.push(Message::assistant(reply));
                conversation.push(Message::user(format!(
                    "Your previous reply was not valid: {last_error}. Reply again with JSON only."
                )));
            }
        }
    }
    Err(LlmError::Schema(format!(
        "gave up after {} attempt(s): {}",
        schema_retries + 1,
        last_error
    )))
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
