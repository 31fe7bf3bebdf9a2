//! Context 字段目录
//!
//! 所有流程共用同一份字段名；每个字段只由一个节点（或包裹它的循环 / 序列）写入。

use crate::flow::{Field, LoopFields};
use crate::novelty::{NoveltyAssessment, NoveltyScore, ReferenceScore};
use crate::research::types::{
    FinalPlan, PlanDraft, QueryResults, QuerySummary, ResearchIdea, SearchQuery,
};
use crate::retrieval::Reference;

pub const QUESTION: Field<String> = Field::new("question");

// 想法生成
pub const SEARCH_QUERIES: Field<Vec<SearchQuery>> = Field::new("search_queries");
pub const QUERY: Field<SearchQuery> = Field::new("query");
pub const RESULT_SET: Field<QueryResults> = Field::new("result_set");
pub const RESULT_SETS: Field<Vec<QueryResults>> = Field::new("result_sets");
pub const SUMMARY: Field<QuerySummary> = Field::new("summary");
pub const SUMMARIES: Field<Vec<QuerySummary>> = Field::new("summaries");
pub const IDEA_DRAFT: Field<ResearchIdea> = Field::new("idea_draft");
pub const IDEA_LOOP: LoopFields = LoopFields {
    verdict: Field::new("idea_verdict"),
    feedback: Field::new("idea_feedback"),
    cycles: Field::new("idea_cycles"),
    status: Field::new("idea_status"),
};
/// 定稿的研究想法，之后不再修改
pub const RESEARCH_IDEA: Field<ResearchIdea> = Field::new("research_idea");

// 新颖度评估
pub const IDEA_EMBEDDING: Field<Vec<f32>> = Field::new("idea_embedding");
pub const RETRIEVED: Field<Vec<Reference>> = Field::new("retrieved");
pub const REFERENCES: Field<Vec<Reference>> = Field::new("references");
pub const REFERENCE_SCORES: Field<Vec<ReferenceScore>> = Field::new("reference_scores");
pub const NOVELTY: Field<NoveltyScore> = Field::new("novelty");
pub const ASSESSMENT_SUMMARY: Field<NoveltyAssessment> = Field::new("assessment_summary");

// 规划
pub const PLAN_DRAFT: Field<PlanDraft> = Field::new("plan_draft");
pub const PLAN_LOOP: LoopFields = LoopFields {
    verdict: Field::new("plan_verdict"),
    feedback: Field::new("plan_feedback"),
    cycles: Field::new("plan_cycles"),
    status: Field::new("plan_status"),
};
pub const FINAL_PLAN: Field<FinalPlan> = Field::new("final_plan");
pub const PLAN_PATH: Field<String> = Field::new("plan_path");

// 单轮问答
pub const ANSWER: Field<String> = Field::new("answer");
