//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再读命令行指定的文件，最后用环境变量 `SCOUT__*` 覆盖
//! （双下划线表示嵌套，如 `SCOUT__RAG__TOP_K=30`）。凭证不进配置文件，只从环境变量读取。

use std::path::PathBuf;

use serde::Deserialize;

use crate::flow::ExhaustedPolicy;
use crate::novelty::ScoringFunction;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub search: SearchSection,
    pub rag: RagSection,
    pub idea: IdeaSection,
    pub plan: PlanSection,
    pub executor: ExecutorSection,
}

/// [app] 段：默认流程、产物目录、是否交互
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// idea-generation / rag / planning / full-pipeline / complete-assistant / qa
    #[serde(default = "default_flow")]
    pub flow: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 交互模式下由人工在终端评审；否则使用 LLM 评审
    #[serde(default = "default_true")]
    pub interactive: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            flow: default_flow(),
            output_dir: default_output_dir(),
            interactive: true,
        }
    }
}

fn default_flow() -> String {
    "complete-assistant".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_true() -> bool {
    true
}

/// [llm] 段：后端选择与结构化输出重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock；openai 未配置 API Key 时退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 结构化输出校验失败后的重新生成次数
    #[serde(default = "default_schema_retries")]
    pub schema_retries: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            schema_retries: default_schema_retries(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_schema_retries() -> u32 {
    2
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 期望的向量维度；设置后对返回结果做校验
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            base_url: None,
            dimensions: None,
        }
    }
}

fn default_embedding_model() -> String {
    "Qwen/Qwen3-Embedding-8B".to_string()
}

/// [search] 段：Web 搜索端点、每个查询的结果数、生成的查询数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_num_queries")]
    pub num_queries: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            max_results: default_max_results(),
            num_queries: default_num_queries(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_max_results() -> usize {
    5
}

fn default_num_queries() -> usize {
    3
}

/// [rag] 段：向量库、检索与重排参数、新颖度打分函数
#[derive(Debug, Clone, Deserialize)]
pub struct RagSection {
    #[serde(default = "default_index_url")]
    pub index_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub reranking: RerankSection,
    #[serde(default)]
    pub scoring: ScoringFunction,
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            collection: default_collection(),
            top_k: default_top_k(),
            top_n: default_top_n(),
            reranking: RerankSection::default(),
            scoring: ScoringFunction::default(),
        }
    }
}

impl RagSection {
    /// top_k 必须为正，top_n 不得超过 top_k
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.top_k == 0 {
            return Err(config::ConfigError::Message(
                "rag.top_k must be greater than 0".to_string(),
            ));
        }
        if self.top_n > self.top_k {
            return Err(config::ConfigError::Message(format!(
                "rag.top_n ({}) must not exceed rag.top_k ({})",
                self.top_n, self.top_k
            )));
        }
        Ok(())
    }
}

fn default_index_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "arxiv_papers".to_string()
}

fn default_top_k() -> usize {
    50
}

fn default_top_n() -> usize {
    10
}

/// [rag.reranking] 段：默认关闭
#[derive(Debug, Clone, Deserialize)]
pub struct RerankSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_base_url")]
    pub base_url: String,
}

impl Default for RerankSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_rerank_model(),
            base_url: default_rerank_base_url(),
        }
    }
}

fn default_rerank_model() -> String {
    "Qwen/Qwen3-Reranker-0.6B".to_string()
}

fn default_rerank_base_url() -> String {
    "http://localhost:8080/v1".to_string()
}

/// [idea] 段：想法校验循环
#[derive(Debug, Clone, Deserialize)]
pub struct IdeaSection {
    #[serde(default = "default_cycles")]
    pub max_cycles: u32,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
}

impl Default for IdeaSection {
    fn default() -> Self {
        Self {
            max_cycles: default_cycles(),
            on_exhausted: ExhaustedPolicy::default(),
        }
    }
}

fn default_cycles() -> u32 {
    3
}

/// [plan] 段：计划细化循环与计划请求
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSection {
    #[serde(default = "default_cycles")]
    pub max_times: u32,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    #[serde(default = "default_project_type")]
    pub project_type: String,
    #[serde(default = "default_timeline")]
    pub timeline: String,
    #[serde(default = "default_audience")]
    pub target_audience: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Default for PlanSection {
    fn default() -> Self {
        Self {
            max_times: default_cycles(),
            on_exhausted: ExhaustedPolicy::default(),
            project_type: default_project_type(),
            timeline: default_timeline(),
            target_audience: default_audience(),
            constraints: Vec::new(),
        }
    }
}

fn default_project_type() -> String {
    "general_research".to_string()
}

fn default_timeline() -> String {
    "3_months".to_string()
}

fn default_audience() -> String {
    "academic".to_string()
}

/// [executor] 段：并发上限、重试预算、退避与单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 0 表示不限时
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_call_timeout_secs() -> u64 {
    60
}

/// 从环境变量读取的凭证
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub openai_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub embedding_api_key: Option<String>,
    pub qdrant_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let openai_api_key = var("OPENAI_API_KEY");
        Self {
            embedding_api_key: var("EMBEDDING_API_KEY").or_else(|| openai_api_key.clone()),
            openai_api_key,
            tavily_api_key: var("TAVILY_API_KEY"),
            qdrant_api_key: var("QDRANT_API_KEY"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.rag.validate()?;
    Ok(cfg)
}
