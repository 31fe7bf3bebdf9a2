//! 规划流程：计划生成（校验循环内）→ 定稿附元数据 → Markdown 持久化

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::core::StageError;
use crate::flow::{Context, LoopStatus, Outcome, Outputs, Stage};
use crate::llm::{complete_structured, LlmClient};
use crate::research::fields::{
    ASSESSMENT_SUMMARY, FINAL_PLAN, NOVELTY, PLAN_DRAFT, PLAN_LOOP, PLAN_PATH, REFERENCES,
    RESEARCH_IDEA,
};
use crate::research::markdown::{self, MarkdownWriter};
use crate::research::prompts;
use crate::research::types::{FinalPlan, PlanDraft, PlanMetadata, PlanRequest, ResearchPlan};

pub struct GeneratePlan {
    llm: Arc<dyn LlmClient>,
    request: PlanRequest,
    schema_retries: u32,
}

impl GeneratePlan {
    pub fn new(llm: Arc<dyn LlmClient>, request: PlanRequest, schema_retries: u32) -> Self {
        Self {
            llm,
            request,
            schema_retries,
        }
    }

    async fn generate(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let idea = ctx.get(RESEARCH_IDEA)?;
        let novelty = ctx.get(NOVELTY)?;
        let assessment = ctx.get(ASSESSMENT_SUMMARY)?;
        let references = ctx.get(REFERENCES)?;
        let feedback = ctx.get_opt(PLAN_LOOP.feedback)?.unwrap_or_default();

        let messages = prompts::plan_generation(
            &idea,
            &novelty,
            &assessment,
            &references,
            &self.request,
            &feedback,
        );
        let plan: ResearchPlan =
            complete_structured(self.llm.as_ref(), &messages, self.schema_retries).await?;
        if plan.phases.is_empty() {
            return Err(StageError::fatal("generated plan has no phases"));
        }
        let draft = PlanDraft {
            plan,
            revision: feedback.len() as u32,
        };
        tracing::info!(
            title = %draft.plan.title,
            phases = draft.plan.phases.len(),
            revision = draft.revision,
            "plan drafted"
        );
        Ok(Outputs::new().with(PLAN_DRAFT, &draft)?)
    }
}

#[async_trait]
impl Stage for GeneratePlan {
    fn name(&self) -> &str {
        "generate_plan"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![
            RESEARCH_IDEA.name(),
            NOVELTY.name(),
            ASSESSMENT_SUMMARY.name(),
            REFERENCES.name(),
            PLAN_LOOP.feedback.name(),
        ]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![PLAN_DRAFT.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.generate(ctx).await.into()
    }
}

pub fn outcome_line(status: LoopStatus, cycles: u32) -> String {
    match status {
        LoopStatus::Approved => format!("Plan approved after {cycles} validation cycle(s)."),
        LoopStatus::Exhausted => {
            format!("Plan completed after {cycles} refinement cycles (maximum reached).")
        }
    }
}

/// 计划定稿：附上时间戳、来源想法与新颖度摘要
pub struct FinalizePlan {
    request: PlanRequest,
}

impl FinalizePlan {
    pub fn new(request: PlanRequest) -> Self {
        Self { request }
    }

    fn finalize(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let draft = ctx.get(PLAN_DRAFT)?;
        let feedback = ctx.get_opt(PLAN_LOOP.feedback)?.unwrap_or_default();
        let cycles = ctx.get(PLAN_LOOP.cycles)?;
        let status = ctx.get(PLAN_LOOP.status)?;
        let idea = ctx.get(RESEARCH_IDEA)?;
        let novelty = ctx.get(NOVELTY)?;

        let metadata = PlanMetadata {
            generated_at: Utc::now(),
            idea_id: idea.id,
            idea_title: idea.title,
            novelty_summary: novelty.summary(),
            aggregate_novelty: novelty.aggregate,
            low_confidence: novelty.low_confidence,
            approved: status == LoopStatus::Approved,
            cycles,
            outcome: outcome_line(status, cycles),
            request: self.request.clone(),
        };
        tracing::info!(outcome = %metadata.outcome, "plan finalized");
        let final_plan = FinalPlan {
            plan: draft.plan,
            revision: draft.revision,
            feedback,
            metadata,
        };
        Ok(Outputs::new().with(FINAL_PLAN, &final_plan)?)
    }
}

#[async_trait]
impl Stage for FinalizePlan {
    fn name(&self) -> &str {
        "finalize_plan"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![
            PLAN_DRAFT.name(),
            PLAN_LOOP.feedback.name(),
            PLAN_LOOP.cycles.name(),
            PLAN_LOOP.status.name(),
            RESEARCH_IDEA.name(),
            NOVELTY.name(),
        ]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![FINAL_PLAN.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.finalize(ctx).into()
    }
}

/// 渲染定稿计划并交给持久化协作方
pub struct PersistPlan {
    writer: Arc<dyn MarkdownWriter>,
    output_dir: PathBuf,
}

impl PersistPlan {
    pub fn new(writer: Arc<dyn MarkdownWriter>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            output_dir: output_dir.into(),
        }
    }

    async fn persist(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let final_plan = ctx.get(FINAL_PLAN)?;
        let idea = ctx.get(RESEARCH_IDEA)?;
        let novelty = ctx.get(NOVELTY)?;
        let assessment = ctx.get(ASSESSMENT_SUMMARY)?;
        let references = ctx.get(REFERENCES)?;

        let content = markdown::render(&final_plan, &idea, &novelty, &assessment, &references);
        let path = self
            .output_dir
            .join(markdown::plan_file_name(&final_plan.plan.title));
        self.writer.write_markdown(&path, &content).await?;
        tracing::info!(path = %path.display(), bytes = content.len(), "plan written");
        Ok(Outputs::new().with(PLAN_PATH, &path.display().to_string())?)
    }
}

#[async_trait]
impl Stage for PersistPlan {
    fn name(&self) -> &str {
        "persist_plan"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![
            FINAL_PLAN.name(),
            RESEARCH_IDEA.name(),
            NOVELTY.name(),
            ASSESSMENT_SUMMARY.name(),
            REFERENCES.name(),
        ]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![PLAN_PATH.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.persist(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_lines() {
        assert_eq!(
            outcome_line(LoopStatus::Approved, 2),
            "Plan approved after 2 validation cycle(s)."
        );
        assert_eq!(
            outcome_line(LoopStatus::Exhausted, 3),
            "Plan completed after 3 refinement cycles (maximum reached)."
        );
    }
}
