//! 想法生成：查询生成 → 并行搜索 → 并行摘要 → 想法合成，外层由校验循环包裹
//!
//! 生成者每轮读取完整的反馈日志；第 N 次修订的 revision 即此前收到的评审条数。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{RetryPolicy, StageError};
use crate::flow::{Context, FanOut, Outcome, Outputs, Sequence, Stage};
use crate::llm::{complete_structured, LlmClient};
use crate::research::fields::{
    IDEA_DRAFT, IDEA_LOOP, QUERY, QUESTION, RESEARCH_IDEA, RESULT_SET, RESULT_SETS, SEARCH_QUERIES,
    SUMMARIES, SUMMARY,
};
use crate::research::prompts;
use crate::research::types::{
    GeneratedIdea, Provenance, QueryPlan, QueryResults, QuerySummary, ResearchIdea,
};
use crate::search::WebSearch;

pub const NO_RESULTS_SUMMARY: &str = "No search results found for this query.";
pub const NO_CONTENT_SUMMARY: &str = "No usable content found in search results.";
/// 每个查询只摘要前几条结果
const SUMMARIZE_TOP: usize = 3;

pub struct GenerateQueries {
    llm: Arc<dyn LlmClient>,
    num_queries: usize,
    schema_retries: u32,
}

impl GenerateQueries {
    pub fn new(llm: Arc<dyn LlmClient>, num_queries: usize, schema_retries: u32) -> Self {
        Self {
            llm,
            num_queries: num_queries.max(1),
            schema_retries,
        }
    }

    async fn generate(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let question = ctx.get(QUESTION)?;
        let feedback = ctx.get_opt(IDEA_LOOP.feedback)?.unwrap_or_default();
        let messages = prompts::query_generation(&question, self.num_queries, &feedback);
        let plan: QueryPlan =
            complete_structured(self.llm.as_ref(), &messages, self.schema_retries).await?;
        let mut queries: Vec<_> = plan
            .queries
            .into_iter()
            .filter(|q| !q.query.trim().is_empty())
            .collect();
        queries.truncate(self.num_queries);
        if queries.is_empty() {
            return Err(StageError::fatal("query generation returned no usable queries"));
        }
        tracing::info!(
            queries = queries.len(),
            with_feedback = !feedback.is_empty(),
            "search queries generated"
        );
        Ok(Outputs::new().with(SEARCH_QUERIES, &queries)?)
    }
}

#[async_trait]
impl Stage for GenerateQueries {
    fn name(&self) -> &str {
        "generate_queries"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![QUESTION.name(), IDEA_LOOP.feedback.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![SEARCH_QUERIES.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.generate(ctx).await.into()
    }
}

/// 单个查询的搜索（fan-out 分支）
pub struct SearchQueryStage {
    search: Arc<dyn WebSearch>,
}

impl SearchQueryStage {
    pub fn new(search: Arc<dyn WebSearch>) -> Self {
        Self { search }
    }

    async fn search(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let query = ctx.get(QUERY)?;
        let hits = self.search.search(&query.query).await?;
        tracing::debug!(query = %query.query, hits = hits.len(), "search completed");
        Ok(Outputs::new().with(RESULT_SET, &QueryResults { query, hits })?)
    }
}

#[async_trait]
impl Stage for SearchQueryStage {
    fn name(&self) -> &str {
        "search_query"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![QUERY.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![RESULT_SET.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.search(ctx).await.into()
    }
}

/// 单个结果集的摘要（fan-out 分支）；没有结果时不调用模型
pub struct SummarizeResults {
    llm: Arc<dyn LlmClient>,
}

impl SummarizeResults {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn summarize(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let results = ctx.get(RESULT_SET)?;
        let sources: Vec<String> = results
            .hits
            .iter()
            .take(SUMMARIZE_TOP)
            .map(|h| h.url.clone())
            .collect();
        let summary = if results.hits.is_empty() {
            NO_RESULTS_SUMMARY.to_string()
        } else if results
            .hits
            .iter()
            .take(SUMMARIZE_TOP)
            .all(|h| h.snippet.trim().is_empty())
        {
            NO_CONTENT_SUMMARY.to_string()
        } else {
            let messages = prompts::summarization(&results, SUMMARIZE_TOP);
            self.llm.complete(&messages).await?.trim().to_string()
        };
        Ok(Outputs::new().with(
            SUMMARY,
            &QuerySummary {
                query: results.query.query,
                summary,
                sources,
            },
        )?)
    }
}

#[async_trait]
impl Stage for SummarizeResults {
    fn name(&self) -> &str {
        "summarize_results"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![RESULT_SET.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![SUMMARY.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.summarize(ctx).await.into()
    }
}

pub struct GenerateIdea {
    llm: Arc<dyn LlmClient>,
    schema_retries: u32,
}

impl GenerateIdea {
    pub fn new(llm: Arc<dyn LlmClient>, schema_retries: u32) -> Self {
        Self { llm, schema_retries }
    }

    async fn generate(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let question = ctx.get(QUESTION)?;
        let queries = ctx.get(SEARCH_QUERIES)?;
        let summaries = ctx.get(SUMMARIES)?;
        let feedback = ctx.get_opt(IDEA_LOOP.feedback)?.unwrap_or_default();

        let messages = prompts::idea_generation(&question, &summaries, &feedback);
        let generated: GeneratedIdea =
            complete_structured(self.llm.as_ref(), &messages, self.schema_retries).await?;
        if generated.description.trim().is_empty() {
            return Err(StageError::fatal("idea generation returned an empty description"));
        }
        let provenance = Provenance {
            queries: queries.into_iter().map(|q| q.query).collect(),
            summaries: summaries.into_iter().map(|s| s.summary).collect(),
        };
        let idea = ResearchIdea::new(generated, provenance, feedback.len() as u32);
        tracing::info!(idea = %idea.id, revision = idea.revision, title = %idea.title, "research idea drafted");
        Ok(Outputs::new().with(IDEA_DRAFT, &idea)?)
    }
}

#[async_trait]
impl Stage for GenerateIdea {
    fn name(&self) -> &str {
        "generate_idea"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![
            QUESTION.name(),
            SEARCH_QUERIES.name(),
            SUMMARIES.name(),
            IDEA_LOOP.feedback.name(),
        ]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![IDEA_DRAFT.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.generate(ctx).await.into()
    }
}

/// 循环结束后冻结想法
pub struct FinalizeIdea;

impl FinalizeIdea {
    fn finalize(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let idea = ctx.get(IDEA_DRAFT)?;
        let cycles = ctx.get(IDEA_LOOP.cycles)?;
        let status = ctx.get(IDEA_LOOP.status)?;
        tracing::info!(idea = %idea.id, cycles, status = ?status, "research idea finalized");
        Ok(Outputs::new().with(RESEARCH_IDEA, &idea)?)
    }
}

#[async_trait]
impl Stage for FinalizeIdea {
    fn name(&self) -> &str {
        "finalize_idea"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![
            IDEA_DRAFT.name(),
            IDEA_LOOP.cycles.name(),
            IDEA_LOOP.status.name(),
        ]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![RESEARCH_IDEA.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.finalize(ctx).into()
    }
}

/// 一轮想法生成：查询 → 并行搜索 → 并行摘要 → 合成
pub fn idea_producer(
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn WebSearch>,
    num_queries: usize,
    schema_retries: u32,
    max_concurrency: usize,
    policy: RetryPolicy,
) -> Sequence {
    Sequence::new("ideate", policy.clone())
        .then(GenerateQueries::new(llm.clone(), num_queries, schema_retries))
        .then(
            FanOut::over(
                "search_all",
                SearchQueryStage::new(search),
                SEARCH_QUERIES,
                QUERY,
                RESULT_SET,
                RESULT_SETS,
            )
            .max_concurrency(max_concurrency)
            .retry(policy.clone()),
        )
        .then(
            FanOut::over(
                "summarize_all",
                SummarizeResults::new(llm.clone()),
                RESULT_SETS,
                RESULT_SET,
                SUMMARY,
                SUMMARIES,
            )
            .max_concurrency(max_concurrency)
            .retry(policy),
        )
        .then(GenerateIdea::new(llm, schema_retries))
}
