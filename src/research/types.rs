//! 研究助手领域模型：搜索查询、摘要、研究想法、规划请求与计划

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PlanSection;
use crate::flow::FeedbackEntry;
use crate::search::SearchHit;

/// 模型生成的搜索查询及理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchQuery {
    pub query: String,
    pub rationale: String,
}

/// 查询生成的结构化输出
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryPlan {
    pub queries: Vec<SearchQuery>,
}

/// 单个查询的搜索结果（一次性获取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResults {
    pub query: SearchQuery,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub query: String,
    pub summary: String,
    /// 参与摘要的来源 URL
    #[serde(default)]
    pub sources: Vec<String>,
}

/// 想法生成的结构化输出
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedIdea {
    /// 简短标题
    pub title: String,
    /// 一句话描述
    pub description: String,
    /// 为什么值得研究
    pub rationale: String,
}

/// 想法来源：由哪些查询与摘要得出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub queries: Vec<String>,
    pub summaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchIdea {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub provenance: Provenance,
    /// 第几次修订（首稿为 0）
    #[serde(default)]
    pub revision: u32,
}

impl ResearchIdea {
    pub fn new(idea: GeneratedIdea, provenance: Provenance, revision: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: idea.title,
            description: idea.description,
            rationale: idea.rationale,
            provenance,
            revision,
        }
    }

    /// 用于嵌入与重排的文本
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.description).trim().to_string()
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n\n{}", self.title, self.description);
        if !self.rationale.is_empty() {
            out.push_str(&format!("\n\nRationale: {}", self.rationale));
        }
        out
    }
}

/// 规划输入，来自配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub project_type: String,
    pub timeline: String,
    pub target_audience: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl From<&PlanSection> for PlanRequest {
    fn from(section: &PlanSection) -> Self {
        Self {
            project_type: section.project_type.clone(),
            timeline: section.timeline.clone(),
            target_audience: section.target_audience.clone(),
            constraints: section.constraints.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlanPhase {
    pub number: u32,
    pub title: String,
    pub duration: String,
    pub tasks: Vec<String>,
    pub deliverables: Vec<String>,
}

/// 计划正文（结构化输出）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResearchPlan {
    pub title: String,
    pub executive_summary: String,
    pub objective: String,
    pub timeline: String,
    pub methodology: String,
    pub phases: Vec<PlanPhase>,
    pub risks: Vec<String>,
    pub resources: Vec<String>,
    pub success_metrics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub plan: ResearchPlan,
    pub revision: u32,
}

impl PlanDraft {
    pub fn render(&self) -> String {
        let plan = &self.plan;
        let mut out = format!(
            "{} (revision {})\n\n{}\n\nObjective: {}\nTimeline: {}\n",
            plan.title, self.revision, plan.executive_summary, plan.objective, plan.timeline
        );
        for phase in &plan.phases {
            out.push_str(&format!(
                "\nPhase {}: {} ({})\n",
                phase.number, phase.title, phase.duration
            ));
            for task in &phase.tasks {
                out.push_str(&format!("  - {task}\n"));
            }
        }
        if !plan.risks.is_empty() {
            out.push_str(&format!("\nRisks: {}\n", plan.risks.join("; ")));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub generated_at: DateTime<Utc>,
    pub idea_id: Uuid,
    pub idea_title: String,
    pub novelty_summary: String,
    pub aggregate_novelty: f64,
    pub low_confidence: bool,
    pub approved: bool,
    pub cycles: u32,
    /// "Plan approved after N validation cycle(s)." 之类的结论行
    pub outcome: String,
    pub request: PlanRequest,
}

/// 定稿计划：交给 Markdown 持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPlan {
    pub plan: ResearchPlan,
    pub revision: u32,
    pub feedback: Vec<FeedbackEntry>,
    pub metadata: PlanMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idea_text_and_render() {
        let idea = ResearchIdea::new(
            GeneratedIdea {
                title: "Frugal inference".into(),
                description: "Reduce GPU power draw via approximate low-precision inference".into(),
                rationale: String::new(),
            },
            Provenance::default(),
            0,
        );
        assert_eq!(
            idea.text(),
            "Frugal inference Reduce GPU power draw via approximate low-precision inference"
        );
        assert!(!idea.render().contains("Rationale"));
    }

    #[test]
    fn test_plan_request_from_config() {
        let section = PlanSection::default();
        let request = PlanRequest::from(&section);
        assert_eq!(request.project_type, "general_research");
        assert_eq!(request.timeline, "3_months");
    }
}
