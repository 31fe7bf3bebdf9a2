//! 新颖度引擎：嵌入 → 检索 → 重排 / 截断 → 单篇打分 → 聚合 → 文字评估
//!
//! 每一步都是独立 Stage，由 RAG 流程按顺序连接。打分使用检索阶段的相似度，
//! 重排只决定哪 top_n 篇参与打分，不改变它们的分数。
//! 文字评估只补充说明与置信度，不改动确定性的 aggregate。

pub mod scoring;
pub mod stages;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::Stage;
use crate::llm::{Embedder, LlmClient};
use crate::retrieval::{Reranker, VectorIndex};

pub use scoring::{aggregate, ScoringFunction};
pub use stages::{
    AggregateNovelty, AssessNovelty, EmbedIdea, RetrieveReferences, ScoreReferences,
    SelectReferences,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceScore {
    pub document_id: String,
    pub similarity: f64,
    pub novelty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyScore {
    pub idea_id: Uuid,
    pub per_reference: Vec<ReferenceScore>,
    pub aggregate: f64,
    /// 没有检索到任何文献时为 true
    pub low_confidence: bool,
    /// 参与打分的文献 ID
    pub contributing: Vec<String>,
    pub total_retrieved: usize,
    pub reranking_enabled: bool,
}

impl NoveltyScore {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Novelty {:.2} across {} reference(s) ({} retrieved{})",
            self.aggregate,
            self.per_reference.len(),
            self.total_retrieved,
            if self.reranking_enabled { ", reranked" } else { "" }
        );
        if self.low_confidence {
            out.push_str("; low confidence: no similar work found");
        }
        out
    }
}

/// LLM 对最相似文献给出的文字评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyAssessment {
    pub summary: String,
    /// [0, 1]
    pub confidence: f64,
    /// false 时 summary 为数值摘要或固定说明
    pub llm_generated: bool,
}

/// 新颖度引擎的协作方与参数
pub struct NoveltyEngine {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    /// None 表示关闭重排，直接取检索结果前 top_n
    pub reranker: Option<Arc<dyn Reranker>>,
    pub top_k: usize,
    pub top_n: usize,
    pub scoring: ScoringFunction,
    /// None 时文字评估退回数值摘要
    pub assessor: Option<Arc<dyn LlmClient>>,
}

impl NoveltyEngine {
    /// 按执行顺序排列的六个 Stage
    pub fn stages(&self) -> Vec<Arc<dyn Stage>> {
        vec![
            Arc::new(EmbedIdea::new(self.embedder.clone())),
            Arc::new(RetrieveReferences::new(self.index.clone(), self.top_k)),
            Arc::new(SelectReferences::new(self.reranker.clone(), self.top_n)),
            Arc::new(ScoreReferences::new(self.scoring)),
            Arc::new(AggregateNovelty::new(self.reranker.is_some())),
            Arc::new(AssessNovelty::new(self.assessor.clone())),
        ]
    }
}
