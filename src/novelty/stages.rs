use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::core::StageError;
use crate::flow::{Context, Outcome, Outputs, Stage};
use crate::llm::{Embedder, LlmClient};
use crate::novelty::scoring::{aggregate, ScoringFunction};
use crate::novelty::{NoveltyAssessment, NoveltyScore, ReferenceScore};
use crate::research::fields::{
    ASSESSMENT_SUMMARY, IDEA_EMBEDDING, NOVELTY, REFERENCES, REFERENCE_SCORES, RESEARCH_IDEA,
    RETRIEVED,
};
use crate::research::prompts;
use crate::retrieval::{compare_hits, Reference, Reranker, VectorIndex};

/// 想法文本 → 向量；空文本是契约违背
pub struct EmbedIdea {
    embedder: Arc<dyn Embedder>,
}

impl EmbedIdea {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    async fn embed(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let idea = ctx.get(RESEARCH_IDEA)?;
        let text = idea.text();
        if text.is_empty() {
            return Err(StageError::fatal(format!("idea {} has no text to embed", idea.id)));
        }
        let vector = self.embedder.embed(&text).await?;
        if vector.is_empty() {
            return Err(StageError::fatal("embedder returned an empty vector"));
        }
        tracing::debug!(idea = %idea.id, dimensions = vector.len(), "idea embedded");
        Ok(Outputs::new().with(IDEA_EMBEDDING, &vector)?)
    }
}

#[async_trait]
impl Stage for EmbedIdea {
    fn name(&self) -> &str {
        "embed_idea"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![RESEARCH_IDEA.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![IDEA_EMBEDDING.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.embed(ctx).await.into()
    }
}

/// 向量索引取 top_k 近邻；索引不可用时返回 Retryable，由执行器重试后升级为 Fatal
pub struct RetrieveReferences {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl RetrieveReferences {
    pub fn new(index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self { index, top_k }
    }

    async fn retrieve(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let vector = ctx.get(IDEA_EMBEDDING)?;
        let mut hits = self.index.query(&vector, self.top_k).await?;
        hits.sort_by(compare_hits);
        hits.truncate(self.top_k);
        let references: Vec<Reference> = hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| Reference::from_hit(hit, i + 1))
            .collect();
        tracing::info!(top_k = self.top_k, retrieved = references.len(), "references retrieved");
        Ok(Outputs::new().with(RETRIEVED, &references)?)
    }
}

#[async_trait]
impl Stage for RetrieveReferences {
    fn name(&self) -> &str {
        "retrieve_references"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![IDEA_EMBEDDING.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![RETRIEVED.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.retrieve(ctx).await.into()
    }
}

/// 重排（可选）并截断到 top_n；相似度保持检索时的值。
/// 重排失败不影响主流程：记警告，按检索顺序取前 top_n。
pub struct SelectReferences {
    reranker: Option<Arc<dyn Reranker>>,
    top_n: usize,
}

impl SelectReferences {
    pub fn new(reranker: Option<Arc<dyn Reranker>>, top_n: usize) -> Self {
        Self { reranker, top_n }
    }

    async fn select(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let retrieved = ctx.get(RETRIEVED)?;
        let mut warning = None;
        let ordered = match &self.reranker {
            Some(reranker) if !retrieved.is_empty() => {
                let idea = ctx.get(RESEARCH_IDEA)?;
                match reranker.rerank(&idea.text(), retrieved.clone()).await {
                    Ok(reranked) => reranked,
                    Err(e) => {
                        tracing::warn!(error = %e, "reranking failed, keeping retrieval order");
                        warning = Some(format!("reranking failed ({e}); kept retrieval order"));
                        retrieved
                    }
                }
            }
            _ => retrieved,
        };
        let selected: Vec<Reference> = ordered
            .into_iter()
            .take(self.top_n)
            .enumerate()
            .map(|(i, mut reference)| {
                reference.final_rank = i + 1;
                reference
            })
            .collect();
        let outputs = Outputs::new().with(REFERENCES, &selected)?;
        Ok(match warning {
            Some(warning) => outputs.warn(warning),
            None => outputs,
        })
    }
}

#[async_trait]
impl Stage for SelectReferences {
    fn name(&self) -> &str {
        "select_references"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![RESEARCH_IDEA.name(), RETRIEVED.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![REFERENCES.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.select(ctx).await.into()
    }
}

pub struct ScoreReferences {
    scoring: ScoringFunction,
}

impl ScoreReferences {
    pub fn new(scoring: ScoringFunction) -> Self {
        Self { scoring }
    }

    fn score(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let references = ctx.get(REFERENCES)?;
        let scores: Vec<ReferenceScore> = references
            .iter()
            .map(|r| ReferenceScore {
                document_id: r.document_id.clone(),
                similarity: r.similarity,
                novelty: self.scoring.novelty(r.similarity),
            })
            .collect();
        Ok(Outputs::new().with(REFERENCE_SCORES, &scores)?)
    }
}

#[async_trait]
impl Stage for ScoreReferences {
    fn name(&self) -> &str {
        "score_references"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![REFERENCES.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![REFERENCE_SCORES.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.score(ctx).into()
    }
}

pub struct AggregateNovelty {
    reranking_enabled: bool,
}

impl AggregateNovelty {
    pub fn new(reranking_enabled: bool) -> Self {
        Self { reranking_enabled }
    }

    fn aggregate(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let idea = ctx.get(RESEARCH_IDEA)?;
        let retrieved = ctx.get(RETRIEVED)?;
        let per_reference = ctx.get(REFERENCE_SCORES)?;
        let values: Vec<f64> = per_reference.iter().map(|s| s.novelty).collect();
        let (aggregate, low_confidence) = aggregate(&values);
        let score = NoveltyScore {
            idea_id: idea.id,
            contributing: per_reference.iter().map(|s| s.document_id.clone()).collect(),
            per_reference,
            aggregate,
            low_confidence,
            total_retrieved: retrieved.len(),
            reranking_enabled: self.reranking_enabled,
        };
        tracing::info!(
            idea = %idea.id,
            aggregate = score.aggregate,
            references = score.per_reference.len(),
            low_confidence,
            "novelty assessed"
        );
        let outputs = Outputs::new().with(NOVELTY, &score)?;
        Ok(if low_confidence {
            outputs.warn("no similar references retrieved; novelty 1.0 is low-confidence")
        } else {
            outputs
        })
    }
}

#[async_trait]
impl Stage for AggregateNovelty {
    fn name(&self) -> &str {
        "aggregate_novelty"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![RESEARCH_IDEA.name(), RETRIEVED.name(), REFERENCE_SCORES.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![NOVELTY.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.aggregate(ctx).into()
    }
}

const NO_REFERENCES_SUMMARY: &str =
    "No similar papers found in the index, which suggests high novelty for this research idea.";
const NO_REFERENCES_CONFIDENCE: f64 = 0.8;
const DEFAULT_LLM_CONFIDENCE: f64 = 0.7;
const FALLBACK_CONFIDENCE: f64 = 0.6;

static CONFIDENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 拆出 "CONFIDENCE: x" 行；其余文字为评估正文，正文为空视为无效回复
pub(crate) fn parse_assessment(reply: &str) -> Option<(String, f64)> {
    let re = CONFIDENCE_RE
        .get_or_init(|| Regex::new(r"(?i)^\s*\**confidence\**\s*:\s*\**\s*([0-9]*\.?[0-9]+)").ok())
        .as_ref()?;
    let mut confidence = DEFAULT_LLM_CONFIDENCE;
    let mut body = Vec::new();
    for line in reply.lines() {
        match re.captures(line).and_then(|c| c[1].parse::<f64>().ok()) {
            Some(value) => confidence = value.clamp(0.0, 1.0),
            None => body.push(line),
        }
    }
    let summary = body.join("\n").trim().to_string();
    (!summary.is_empty()).then_some((summary, confidence))
}

/// 对最相似文献做文字评估，写入 assessment_summary。
/// 没有参考文献时给固定说明；LLM 缺席或失败时退回数值摘要。
pub struct AssessNovelty {
    llm: Option<Arc<dyn LlmClient>>,
}

impl AssessNovelty {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    fn numeric(novelty: &NoveltyScore) -> NoveltyAssessment {
        NoveltyAssessment {
            summary: novelty.summary(),
            confidence: FALLBACK_CONFIDENCE,
            llm_generated: false,
        }
    }

    async fn assess(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let novelty = ctx.get(NOVELTY)?;
        let references = ctx.get(REFERENCES)?;

        if references.is_empty() {
            let assessment = NoveltyAssessment {
                summary: NO_REFERENCES_SUMMARY.to_string(),
                confidence: NO_REFERENCES_CONFIDENCE,
                llm_generated: false,
            };
            return Ok(Outputs::new().with(ASSESSMENT_SUMMARY, &assessment)?);
        }
        let Some(llm) = &self.llm else {
            return Ok(Outputs::new().with(ASSESSMENT_SUMMARY, &Self::numeric(&novelty))?);
        };

        let idea = ctx.get(RESEARCH_IDEA)?;
        let messages = prompts::novelty_assessment(&idea, &novelty, &references);
        let (assessment, warning) = match llm.complete(&messages).await {
            Ok(reply) => match parse_assessment(&reply) {
                Some((summary, confidence)) => (
                    NoveltyAssessment {
                        summary,
                        confidence,
                        llm_generated: true,
                    },
                    None,
                ),
                None => (
                    Self::numeric(&novelty),
                    Some("novelty assessment reply was empty; using numeric summary".to_string()),
                ),
            },
            Err(e) => {
                tracing::warn!(error = %e, "novelty assessment failed, using numeric summary");
                (
                    Self::numeric(&novelty),
                    Some(format!("novelty assessment failed ({e}); using numeric summary")),
                )
            }
        };
        tracing::info!(
            idea = %idea.id,
            confidence = assessment.confidence,
            llm_generated = assessment.llm_generated,
            "novelty narrative written"
        );
        let outputs = Outputs::new().with(ASSESSMENT_SUMMARY, &assessment)?;
        Ok(match warning {
            Some(warning) => outputs.warn(warning),
            None => outputs,
        })
    }
}

#[async_trait]
impl Stage for AssessNovelty {
    fn name(&self) -> &str {
        "assess_novelty"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![RESEARCH_IDEA.name(), REFERENCES.name(), NOVELTY.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![ASSESSMENT_SUMMARY.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.assess(ctx).await.into()
    }
}
