//! 五个具名流程：想法生成、RAG 新颖度评估、规划、full-pipeline、complete-assistant，外加单轮问答
//!
//! 每个流程都是一张经过静态校验的 FlowGraph；组合流程用 FlowChain 把前一张图的终态字段带入下一张图。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::core::{FlowError, GraphError, RetryPolicy, StageError};
use crate::flow::{
    Context, ExhaustedPolicy, FlowBuilder, FlowChain, FlowGraph, FlowRunner, LoopStatus, Outcome,
    Outputs, Route, RunReport, Stage, ValidationLoop,
};
use crate::llm::{LlmClient, Message};
use crate::novelty::NoveltyEngine;
use crate::research::collaborators::{Collaborators, Review};
use crate::research::fields::{
    ANSWER, ASSESSMENT_SUMMARY, IDEA_DRAFT, IDEA_LOOP, NOVELTY, PLAN_DRAFT, PLAN_LOOP, QUESTION,
    REFERENCES, RESEARCH_IDEA,
};
use crate::research::idea::{idea_producer, FinalizeIdea};
use crate::research::plan::{FinalizePlan, GeneratePlan, PersistPlan};
use crate::research::prompts;
use crate::research::review::{HumanCritic, LlmCritic};
use crate::research::types::PlanRequest;

/// 流程选择器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    IdeaGeneration,
    Rag,
    Planning,
    /// 想法生成 + 新颖度评估
    FullPipeline,
    /// 想法生成 → 新颖度评估 → 规划
    CompleteAssistant,
    /// 单次 LLM 调用回答问题
    Qa,
}

impl FlowKind {
    pub const ALL: [FlowKind; 6] = [
        FlowKind::IdeaGeneration,
        FlowKind::Rag,
        FlowKind::Planning,
        FlowKind::FullPipeline,
        FlowKind::CompleteAssistant,
        FlowKind::Qa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::IdeaGeneration => "idea-generation",
            FlowKind::Rag => "rag",
            FlowKind::Planning => "planning",
            FlowKind::FullPipeline => "full-pipeline",
            FlowKind::CompleteAssistant => "complete-assistant",
            FlowKind::Qa => "qa",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "idea-generation" | "idea" => Ok(FlowKind::IdeaGeneration),
            "rag" | "novelty" => Ok(FlowKind::Rag),
            "planning" | "plan" => Ok(FlowKind::Planning),
            "full-pipeline" => Ok(FlowKind::FullPipeline),
            "complete-assistant" | "complete" => Ok(FlowKind::CompleteAssistant),
            "qa" | "legacy" => Ok(FlowKind::Qa),
            other => Err(format!(
                "unknown flow '{other}', expected one of: {}",
                FlowKind::ALL.map(|k| k.as_str()).join(", ")
            )),
        }
    }
}

/// 单轮问答节点
pub struct AnswerQuestion {
    llm: Arc<dyn LlmClient>,
}

impl AnswerQuestion {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn answer(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let question = ctx.get(QUESTION)?;
        let answer = self.llm.complete(&prompts::answer(&question)).await?;
        Ok(Outputs::new().with(ANSWER, &answer)?)
    }
}

#[async_trait]
impl Stage for AnswerQuestion {
    fn name(&self) -> &str {
        "answer"
    }

    fn inputs(&self) -> Vec<&'static str> {
        vec![QUESTION.name()]
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![ANSWER.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.answer(ctx).await.into()
    }
}

fn idea_critique_prompt(ctx: &Context) -> Result<Vec<Message>, StageError> {
    let question = ctx.get(QUESTION)?;
    let idea = ctx.get(IDEA_DRAFT)?;
    Ok(prompts::idea_critique(&question, &idea.render()))
}

fn render_idea(ctx: &Context) -> Result<String, StageError> {
    Ok(ctx.get(IDEA_DRAFT)?.render())
}

fn plan_critique_prompt(ctx: &Context) -> Result<Vec<Message>, StageError> {
    Ok(prompts::plan_critique(&ctx.get(PLAN_DRAFT)?.render()))
}

fn render_plan(ctx: &Context) -> Result<String, StageError> {
    Ok(ctx.get(PLAN_DRAFT)?.render())
}

/// 循环耗尽后的去向
fn exhausted_route(policy: ExhaustedPolicy, next: &str, reason: String) -> Route {
    match policy {
        ExhaustedPolicy::Proceed => Route::Goto(next.to_string()),
        ExhaustedPolicy::Abort => Route::Abort(reason),
    }
}

/// 一次运行的可执行单元
pub enum Flow {
    Graph(FlowGraph),
    Chain(FlowChain),
}

impl Flow {
    pub fn name(&self) -> &str {
        match self {
            Flow::Graph(g) => g.name(),
            Flow::Chain(c) => c.name(),
        }
    }

    /// 运行前调用方必须提供的字段
    pub fn seeds(&self) -> &[&'static str] {
        match self {
            Flow::Graph(g) => g.seeds(),
            Flow::Chain(c) => c.seeds(),
        }
    }

    pub async fn run(&self, runner: &FlowRunner, ctx: Context) -> Result<RunReport, FlowError> {
        match self {
            Flow::Graph(g) => runner.run(g, ctx).await,
            Flow::Chain(c) => runner.run_chain(c, ctx).await,
        }
    }
}

/// 由配置与协作方组装各个流程
pub struct FlowFactory {
    config: AppConfig,
    collaborators: Collaborators,
    policy: RetryPolicy,
}

impl FlowFactory {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let policy = RetryPolicy::from_config(&config.executor);
        Self {
            config,
            collaborators,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn build(&self, kind: FlowKind) -> Result<Flow, GraphError> {
        Ok(match kind {
            FlowKind::IdeaGeneration => Flow::Graph(self.idea_generation()?),
            FlowKind::Rag => Flow::Graph(self.rag()?),
            FlowKind::Planning => Flow::Graph(self.planning()?),
            FlowKind::Qa => Flow::Graph(self.qa()?),
            FlowKind::FullPipeline => Flow::Chain(
                FlowChain::new(kind.as_str())
                    .link(self.idea_generation()?, &[RESEARCH_IDEA.name(), QUESTION.name()])
                    .link(self.rag()?, &[])
                    .validate()?,
            ),
            FlowKind::CompleteAssistant => Flow::Chain(
                FlowChain::new(kind.as_str())
                    .link(self.idea_generation()?, &[RESEARCH_IDEA.name()])
                    .link(
                        self.rag()?,
                        &[
                            RESEARCH_IDEA.name(),
                            NOVELTY.name(),
                            ASSESSMENT_SUMMARY.name(),
                            REFERENCES.name(),
                        ],
                    )
                    .link(self.planning()?, &[])
                    .validate()?,
            ),
        })
    }

    pub fn idea_generation(&self) -> Result<FlowGraph, GraphError> {
        let c = &self.collaborators;
        let cfg = &self.config;
        let producer = idea_producer(
            c.llm.clone(),
            c.search.clone(),
            cfg.search.num_queries,
            cfg.llm.schema_retries,
            cfg.executor.max_concurrency,
            self.policy.clone(),
        );
        let critic: Arc<dyn Stage> = match &c.review {
            Review::Automated => Arc::new(LlmCritic::new(
                "idea_critic",
                c.llm.clone(),
                &[QUESTION.name(), IDEA_DRAFT.name()],
                IDEA_LOOP.verdict,
                idea_critique_prompt,
            )),
            Review::Human(channel) => Arc::new(HumanCritic::new(
                "idea_review",
                channel.clone(),
                &[IDEA_DRAFT.name()],
                IDEA_LOOP.verdict,
                render_idea,
            )),
        };
        let max_cycles = cfg.idea.max_cycles;

        FlowBuilder::new(FlowKind::IdeaGeneration.as_str())
            .seed(QUESTION)
            .node(
                ValidationLoop::new("idea_loop", producer, critic, IDEA_LOOP)
                    .max_cycles(max_cycles)
                    .retry(self.policy.clone()),
            )
            .node(FinalizeIdea)
            .entry("idea_loop")
            .branch(
                "idea_loop",
                IDEA_LOOP.status,
                vec![
                    (LoopStatus::Approved, Route::Goto("finalize_idea".to_string())),
                    (
                        LoopStatus::Exhausted,
                        exhausted_route(
                            cfg.idea.on_exhausted,
                            "finalize_idea",
                            format!("research idea not approved within {max_cycles} cycle(s)"),
                        ),
                    ),
                ],
            )
            .build()
    }

    pub fn rag(&self) -> Result<FlowGraph, GraphError> {
        let c = &self.collaborators;
        let engine = NoveltyEngine {
            embedder: c.embedder.clone(),
            index: c.index.clone(),
            reranker: c.reranker.clone(),
            top_k: self.config.rag.top_k,
            top_n: self.config.rag.top_n,
            scoring: self.config.rag.scoring,
            assessor: Some(c.llm.clone()),
        };
        let stages = engine.stages();
        let names: Vec<String> = stages.iter().map(|s| s.name().to_string()).collect();

        let mut builder = FlowBuilder::new(FlowKind::Rag.as_str()).seed(RESEARCH_IDEA);
        for stage in stages {
            builder = builder.node_arc(stage);
        }
        if let Some(first) = names.first() {
            builder = builder.entry(first.as_str());
        }
        for pair in names.windows(2) {
            builder = builder.then(pair[0].as_str(), pair[1].as_str());
        }
        builder.build()
    }

    pub fn planning(&self) -> Result<FlowGraph, GraphError> {
        let c = &self.collaborators;
        let cfg = &self.config;
        let request = PlanRequest::from(&cfg.plan);
        let critic: Arc<dyn Stage> = match &c.review {
            Review::Automated => Arc::new(LlmCritic::new(
                "plan_critic",
                c.llm.clone(),
                &[PLAN_DRAFT.name()],
                PLAN_LOOP.verdict,
                plan_critique_prompt,
            )),
            Review::Human(channel) => Arc::new(HumanCritic::new(
                "plan_review",
                channel.clone(),
                &[PLAN_DRAFT.name()],
                PLAN_LOOP.verdict,
                render_plan,
            )),
        };
        let max_times = cfg.plan.max_times;

        FlowBuilder::new(FlowKind::Planning.as_str())
            .seed(RESEARCH_IDEA)
            .seed(NOVELTY)
            .seed(ASSESSMENT_SUMMARY)
            .seed(REFERENCES)
            .node(
                ValidationLoop::new(
                    "plan_loop",
                    GeneratePlan::new(c.llm.clone(), request.clone(), cfg.llm.schema_retries),
                    critic,
                    PLAN_LOOP,
                )
                .max_cycles(max_times)
                .retry(self.policy.clone()),
            )
            .node(FinalizePlan::new(request))
            .node(PersistPlan::new(c.writer.clone(), cfg.app.output_dir.clone()))
            .entry("plan_loop")
            .branch(
                "plan_loop",
                PLAN_LOOP.status,
                vec![
                    (LoopStatus::Approved, Route::Goto("finalize_plan".to_string())),
                    (
                        LoopStatus::Exhausted,
                        exhausted_route(
                            cfg.plan.on_exhausted,
                            "finalize_plan",
                            format!("research plan not approved within {max_times} cycle(s)"),
                        ),
                    ),
                ],
            )
            .then("finalize_plan", "persist_plan")
            .build()
    }

    pub fn qa(&self) -> Result<FlowGraph, GraphError> {
        FlowBuilder::new(FlowKind::Qa.as_str())
            .seed(QUESTION)
            .node(AnswerQuestion::new(self.collaborators.llm.clone()))
            .entry("answer")
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn factory(config: AppConfig) -> FlowFactory {
        FlowFactory::new(config, Collaborators::offline(Review::Automated))
    }

    #[test]
    fn test_flow_kind_parsing() {
        for kind in FlowKind::ALL {
            assert_eq!(kind.as_str().parse::<FlowKind>().unwrap(), kind);
        }
        assert_eq!("legacy".parse::<FlowKind>().unwrap(), FlowKind::Qa);
        assert_eq!("Complete_Assistant".parse::<FlowKind>().unwrap(), FlowKind::CompleteAssistant);
        let err = "poetry".parse::<FlowKind>().unwrap_err();
        assert!(err.contains("unknown flow 'poetry'"));
    }

    #[test]
    fn test_every_flow_builds() {
        let factory = factory(AppConfig::default());
        for kind in FlowKind::ALL {
            let flow = factory.build(kind).unwrap();
            assert_eq!(flow.name(), kind.as_str());
        }
    }

    #[test]
    fn test_flow_seeds() {
        let factory = factory(AppConfig::default());
        let seeds = |kind| factory.build(kind).unwrap().seeds().to_vec();
        assert_eq!(seeds(FlowKind::IdeaGeneration), vec!["question"]);
        assert_eq!(seeds(FlowKind::Rag), vec!["research_idea"]);
        assert_eq!(
            seeds(FlowKind::Planning),
            vec!["research_idea", "novelty", "assessment_summary", "references"]
        );
        assert_eq!(seeds(FlowKind::CompleteAssistant), vec!["question"]);
    }

    #[test]
    fn test_exhausted_route() {
        assert_eq!(
            exhausted_route(ExhaustedPolicy::Proceed, "next", "x".into()),
            Route::Goto("next".into())
        );
        assert_eq!(
            exhausted_route(ExhaustedPolicy::Abort, "next", "x".into()),
            Route::Abort("x".into())
        );
    }

    #[tokio::test]
    async fn test_qa_flow_answers() {
        let mut collaborators = Collaborators::offline(Review::Automated);
        collaborators.llm = Arc::new(MockLlmClient::scripted(vec![Ok("42".to_string())]));
        let factory = FlowFactory::new(AppConfig::default(), collaborators);
        let flow = factory.build(FlowKind::Qa).unwrap();

        let mut ctx = Context::new();
        ctx.seed(QUESTION, &"What is the answer?".to_string()).unwrap();
        let report = flow.run(&FlowRunner::new(RetryPolicy::none()), ctx).await.unwrap();
        assert_eq!(report.context.get(ANSWER).unwrap(), "42");
    }
}
