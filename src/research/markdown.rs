//! 计划的 Markdown 渲染与持久化

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::StageError;
use crate::novelty::{NoveltyAssessment, NoveltyScore};
use crate::research::types::{FinalPlan, ResearchIdea};
use crate::retrieval::Reference;

const MAX_TITLE_CHARS: usize = 50;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<PersistError> for StageError {
    fn from(e: PersistError) -> Self {
        StageError::Fatal(e.to_string())
    }
}

/// 持久化协作方：write_markdown(path, content)
#[async_trait]
pub trait MarkdownWriter: Send + Sync {
    async fn write_markdown(&self, path: &Path, content: &str) -> Result<(), PersistError>;
}

/// 写本地文件，目录不存在时先创建
#[derive(Debug, Default)]
pub struct FsMarkdownWriter;

#[async_trait]
impl MarkdownWriter for FsMarkdownWriter {
    async fn write_markdown(&self, path: &Path, content: &str) -> Result<(), PersistError> {
        let io_err = |source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, content).await.map_err(io_err)
    }
}

/// 文件名：只保留字母数字、空格与下划线，空格换成下划线，最多 50 个字符
pub fn plan_file_name(title: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .collect();
    let safe: String = safe
        .trim_end()
        .replace(' ', "_")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let safe = if safe.is_empty() { "untitled".to_string() } else { safe };
    format!("{safe}_research_plan.md")
}

fn humanize(value: &str) -> String {
    value
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn bullet_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {heading}\n");
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
    out.push('\n');
}

pub fn render(
    final_plan: &FinalPlan,
    idea: &ResearchIdea,
    novelty: &NoveltyScore,
    assessment: &NoveltyAssessment,
    references: &[Reference],
) -> String {
    let plan = &final_plan.plan;
    let meta = &final_plan.metadata;
    let mut out = String::new();

    let _ = writeln!(out, "# {}", plan.title);
    let _ = writeln!(
        out,
        "*Generated on {}*\n",
        meta.generated_at.format("%B %d, %Y %H:%M UTC")
    );
    let _ = writeln!(out, "> {}\n", meta.outcome);

    let _ = writeln!(out, "## Executive Summary\n\n{}\n", plan.executive_summary);

    out.push_str("## Project Overview\n\n| Attribute | Value |\n|---|---|\n");
    let _ = writeln!(out, "| Project Type | {} |", humanize(&meta.request.project_type));
    let _ = writeln!(out, "| Timeline | {} |", humanize(&meta.request.timeline));
    let _ = writeln!(out, "| Target Audience | {} |", humanize(&meta.request.target_audience));
    let _ = writeln!(out, "| Phases | {} |", plan.phases.len());
    let _ = writeln!(out, "| Revision | {} |\n", final_plan.revision);
    if !meta.request.constraints.is_empty() {
        let _ = writeln!(out, "Constraints: {}\n", meta.request.constraints.join("; "));
    }

    let _ = writeln!(out, "## Research Idea\n\n**{}**\n\n{}\n", idea.title, idea.description);
    if !idea.rationale.is_empty() {
        let _ = writeln!(out, "{}\n", idea.rationale);
    }

    let _ = writeln!(out, "## Novelty Assessment\n\n{}\n", novelty.summary());
    let _ = writeln!(
        out,
        "{}\n\n*Confidence: {:.2}*\n",
        assessment.summary, assessment.confidence
    );
    if !references.is_empty() {
        out.push_str("| Rank | Paper | Similarity | Novelty |\n|---|---|---|---|\n");
        for reference in references {
            let score = novelty
                .per_reference
                .iter()
                .find(|s| s.document_id == reference.document_id)
                .map(|s| format!("{:.2}", s.novelty))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "| {} | {} ({}) | {:.2} | {} |",
                reference.final_rank, reference.title, reference.document_id, reference.similarity, score
            );
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Objective\n\n{}\n", plan.objective);
    let _ = writeln!(out, "## Timeline\n\n{}\n", plan.timeline);
    let _ = writeln!(out, "## Methodology\n\n{}\n", plan.methodology);

    out.push_str("## Phases\n\n");
    for phase in &plan.phases {
        let _ = writeln!(out, "### Phase {}: {}\n", phase.number, phase.title);
        let _ = writeln!(out, "**Duration**: {}\n", phase.duration);
        if !phase.tasks.is_empty() {
            out.push_str("**Tasks**\n\n");
            for task in &phase.tasks {
                let _ = writeln!(out, "- {task}");
            }
            out.push('\n');
        }
        if !phase.deliverables.is_empty() {
            out.push_str("**Deliverables**\n\n");
            for deliverable in &phase.deliverables {
                let _ = writeln!(out, "- {deliverable}");
            }
            out.push('\n');
        }
    }

    bullet_list(&mut out, "Risks", &plan.risks);
    bullet_list(&mut out, "Resources", &plan.resources);
    bullet_list(&mut out, "Success Metrics", &plan.success_metrics);

    if !final_plan.feedback.is_empty() {
        out.push_str("## Review History\n\n");
        for entry in &final_plan.feedback {
            let verdict = if entry.approved { "approved" } else { "revise" };
            let _ = write!(out, "- Cycle {} ({verdict})", entry.cycle);
            if !entry.feedback.is_empty() {
                let _ = write!(out, ": {}", entry.feedback);
            }
            out.push('\n');
        }
        out.push('\n');
    }

    let _ = writeln!(out, "---\n*Source idea: {} | {}*", meta.idea_id, meta.novelty_summary);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FeedbackEntry, ValidationVerdict};
    use crate::novelty::ReferenceScore;
    use crate::research::types::{
        GeneratedIdea, PlanMetadata, PlanPhase, PlanRequest, Provenance, ResearchPlan,
    };
    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    #[test]
    fn test_plan_file_name() {
        assert_eq!(
            plan_file_name("Low-Power GPU Inference: A Plan!"),
            "LowPower_GPU_Inference_A_Plan_research_plan.md"
        );
        let long = "a".repeat(80);
        assert_eq!(plan_file_name(&long), format!("{}_research_plan.md", "a".repeat(50)));
        assert_eq!(plan_file_name("???"), "untitled_research_plan.md");
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("general_research"), "General Research");
        assert_eq!(humanize("3_months"), "3 Months");
    }

    fn fixture() -> (FinalPlan, ResearchIdea, NoveltyScore, NoveltyAssessment, Vec<Reference>) {
        let idea = ResearchIdea::new(
            GeneratedIdea {
                title: "Frugal inference".into(),
                description: "Reduce GPU power draw via approximate low-precision inference.".into(),
                rationale: String::new(),
            },
            Provenance::default(),
            1,
        );
        let novelty = NoveltyScore {
            idea_id: idea.id,
            per_reference: vec![ReferenceScore {
                document_id: "2401.1".into(),
                similarity: 0.6,
                novelty: 0.4,
            }],
            aggregate: 0.4,
            low_confidence: false,
            contributing: vec!["2401.1".into()],
            total_retrieved: 5,
            reranking_enabled: false,
        };
        let references = vec![Reference {
            document_id: "2401.1".into(),
            title: "Quantized kernels".into(),
            abstract_text: String::new(),
            similarity: 0.6,
            original_rank: 1,
            final_rank: 1,
            rerank_score: None,
            metadata: Map::new(),
        }];
        let plan = FinalPlan {
            plan: ResearchPlan {
                title: "Frugal Inference Plan".into(),
                executive_summary: "Summary.".into(),
                objective: "Objective.".into(),
                timeline: "12 weeks".into(),
                methodology: "Measure.".into(),
                phases: vec![PlanPhase {
                    number: 1,
                    title: "Baseline".into(),
                    duration: "2 weeks".into(),
                    tasks: vec!["Profile power".into()],
                    deliverables: vec!["Report".into()],
                }],
                risks: vec!["Accuracy loss".into()],
                resources: vec![],
                success_metrics: vec!["-20% power".into()],
            },
            revision: 1,
            feedback: vec![FeedbackEntry::from_verdict(
                1,
                &ValidationVerdict::rejected("add a baseline"),
            )],
            metadata: PlanMetadata {
                generated_at: Utc::now(),
                idea_id: Uuid::nil(),
                idea_title: "Frugal inference".into(),
                novelty_summary: novelty.summary(),
                aggregate_novelty: 0.4,
                low_confidence: false,
                approved: true,
                cycles: 2,
                outcome: "Plan approved after 2 validation cycle(s).".into(),
                request: PlanRequest {
                    project_type: "general_research".into(),
                    timeline: "3_months".into(),
                    target_audience: "academic".into(),
                    constraints: vec![],
                },
            },
        };
        let assessment = NoveltyAssessment {
            summary: "Quantized kernels fix one precision; the idea adapts it at run time.".into(),
            confidence: 0.75,
            llm_generated: true,
        };
        (plan, idea, novelty, assessment, references)
    }

    #[test]
    fn test_render_contains_structure() {
        let (plan, idea, novelty, assessment, references) = fixture();
        let md = render(&plan, &idea, &novelty, &assessment, &references);
        assert!(md.starts_with("# Frugal Inference Plan\n"));
        assert!(md.contains("> Plan approved after 2 validation cycle(s)."));
        assert!(md.contains("### Phase 1: Baseline"));
        assert!(md.contains("| 1 | Quantized kernels (2401.1) | 0.60 | 0.40 |"));
        assert!(md.contains("- Cycle 1 (revise): add a baseline"));
        assert!(!md.contains("## Resources"));
        assert!(md.contains(
            "Quantized kernels fix one precision; the idea adapts it at run time.\n\n*Confidence: 0.75*"
        ));
    }

    #[tokio::test]
    async fn test_fs_writer_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plan.md");
        FsMarkdownWriter.write_markdown(&path, "# hi\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# hi\n");
    }
}
