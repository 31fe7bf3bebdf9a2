//! Scout - Rust 科研助手
//!
//! 把一个研究问题变成经过新颖性评估的研究计划。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 订阅器初始化
//! - **core**: 错误分类与重试策略
//! - **flow**: 流程编排（共享上下文、Stage、Fan-Out/Fan-In、校验循环、Flow 图与运行器）
//! - **llm**: LLM 与嵌入客户端抽象及实现（OpenAI 兼容 / Mock）
//! - **search**: Web 搜索协作方（Tavily）
//! - **retrieval**: 向量检索（内存 / Qdrant）与重排
//! - **novelty**: 新颖度引擎
//! - **research**: 想法生成、规划与具名流程

pub mod config;
pub mod core;
pub mod flow;
pub mod llm;
pub mod novelty;
pub mod observability;
pub mod research;
pub mod retrieval;
pub mod search;
