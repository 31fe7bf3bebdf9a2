//! 流程集成测试：Fan-Out 超时、RAG 打分与失败处理、完整助手离线运行

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};

use scout::config::AppConfig;
use scout::core::{FlowError, RetryPolicy};
use scout::flow::{Context, FanOut, FlowBuilder, FlowRunner, Outcome, Stage, ValidationVerdict};
use scout::llm::MockLlmClient;
use scout::research::fields::{
    ASSESSMENT_SUMMARY, FINAL_PLAN, NOVELTY, PLAN_PATH, QUERY, QUESTION, REFERENCES,
    RESEARCH_IDEA, RESULT_SET, RESULT_SETS, SEARCH_QUERIES,
};
use scout::research::idea::SearchQueryStage;
use scout::research::types::{GeneratedIdea, Provenance, SearchQuery};
use scout::research::{Collaborators, FlowFactory, FlowKind, ResearchIdea, Review, ScriptedFeedback};
use scout::retrieval::{IndexError, IndexHit, LlmReranker, VectorIndex};
use scout::search::{SearchError, SearchHit, WebSearch};

/// 包含 "stall" 的查询永远不返回
struct StallingSearch {
    stalled_calls: AtomicUsize,
}

#[async_trait]
impl WebSearch for StallingSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        if query.contains("stall") {
            self.stalled_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(vec![SearchHit {
            title: format!("hit for {query}"),
            snippet: "snippet".into(),
            url: format!("https://example.org/{query}"),
        }])
    }
}

/// 固定返回给定相似度的索引
struct FixedIndex {
    similarities: Vec<f64>,
}

#[async_trait]
impl VectorIndex for FixedIndex {
    async fn query(&self, _embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        Ok(self
            .similarities
            .iter()
            .enumerate()
            .take(top_k)
            .map(|(i, s)| {
                let mut metadata = Map::new();
                metadata.insert("title".into(), json!(format!("Paper {}", i + 1)));
                IndexHit {
                    document_id: format!("paper-{}", i + 1),
                    similarity: *s,
                    metadata,
                }
            })
            .collect())
    }
}

/// 始终不可用的索引，记录被调用的次数
struct UnavailableIndex {
    calls: AtomicUsize,
}

#[async_trait]
impl VectorIndex for UnavailableIndex {
    async fn query(&self, _embedding: &[f32], _top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IndexError::Unavailable("connection refused".into()))
    }
}

fn two_queries() -> Vec<SearchQuery> {
    vec![
        SearchQuery {
            query: "quantized inference power".into(),
            rationale: "energy".into(),
        },
        SearchQuery {
            query: "stall on approximate kernels".into(),
            rationale: "accuracy".into(),
        },
    ]
}

fn idea() -> ResearchIdea {
    ResearchIdea::new(
        GeneratedIdea {
            title: "Frugal inference".into(),
            description: "Reduce GPU power draw via approximate low-precision inference.".into(),
            rationale: String::new(),
        },
        Provenance::default(),
        0,
    )
}

#[tokio::test(start_paused = true)]
async fn fan_out_timeout_exhausts_budget_and_merges_nothing() {
    let search = Arc::new(StallingSearch {
        stalled_calls: AtomicUsize::new(0),
    });
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_timeout(Some(Duration::from_secs(5)));
    let fan_out = FanOut::over(
        "search_all",
        SearchQueryStage::new(search.clone()),
        SEARCH_QUERIES,
        QUERY,
        RESULT_SET,
        RESULT_SETS,
    )
    .retry(policy);

    let mut ctx = Context::new();
    ctx.seed(SEARCH_QUERIES, &two_queries()).unwrap();

    match fan_out.run(&ctx).await {
        Outcome::Fatal(reason) => assert!(reason.contains("branch 2 of 2"), "{reason}"),
        other => panic!("expected fatal outcome, got {other:?}"),
    }
    assert_eq!(search.stalled_calls.load(Ordering::SeqCst), 3);
    assert!(!ctx.contains(RESULT_SETS.name()));
}

#[tokio::test(start_paused = true)]
async fn fan_out_failure_aborts_flow_run() {
    let search = Arc::new(StallingSearch {
        stalled_calls: AtomicUsize::new(0),
    });
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_timeout(Some(Duration::from_secs(5)));
    let graph = FlowBuilder::new("search")
        .seed(SEARCH_QUERIES)
        .node(
            FanOut::over(
                "search_all",
                SearchQueryStage::new(search),
                SEARCH_QUERIES,
                QUERY,
                RESULT_SET,
                RESULT_SETS,
            )
            .retry(policy.clone()),
        )
        .entry("search_all")
        .build()
        .unwrap();

    let mut ctx = Context::new();
    ctx.seed(SEARCH_QUERIES, &two_queries()).unwrap();
    let err = FlowRunner::new(policy).run(&graph, ctx).await.unwrap_err();
    match err {
        FlowError::NodeFailed { node, inputs, reason } => {
            assert_eq!(node, "search_all");
            assert_eq!(inputs, vec!["search_queries".to_string()]);
            assert!(reason.contains("branch 2 of 2"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

async fn run_rag(similarities: Vec<f64>) -> scout::flow::RunReport {
    let mut collaborators = Collaborators::offline(Review::Automated);
    collaborators.index = Arc::new(FixedIndex { similarities });
    run_rag_with(collaborators).await
}

async fn run_rag_with(collaborators: Collaborators) -> scout::flow::RunReport {
    let factory = FlowFactory::new(AppConfig::default(), collaborators);
    let flow = factory.build(FlowKind::Rag).unwrap();

    let mut ctx = Context::new();
    ctx.seed(RESEARCH_IDEA, &idea()).unwrap();
    flow.run(&FlowRunner::new(RetryPolicy::none()), ctx)
        .await
        .unwrap()
}

#[tokio::test]
async fn rag_scores_linear_novelty_and_mean() {
    let report = run_rag(vec![0.92, 0.81, 0.40]).await;
    let novelty = report.context.get(NOVELTY).unwrap();

    let per_reference: Vec<f64> = novelty.per_reference.iter().map(|s| s.novelty).collect();
    let expected = [0.08, 0.19, 0.60];
    for (got, want) in per_reference.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "{got} != {want}");
    }
    assert!((novelty.aggregate - 0.29).abs() < 1e-9);
    assert!(!novelty.low_confidence);
    assert_eq!(novelty.total_retrieved, 3);
    assert_eq!(novelty.contributing, vec!["paper-1", "paper-2", "paper-3"]);

    let references = report.context.get(REFERENCES).unwrap();
    assert_eq!(references[0].title, "Paper 1");
    assert_eq!(references[2].final_rank, 3);

    let assessment = report.context.get(ASSESSMENT_SUMMARY).unwrap();
    assert!(assessment.llm_generated);
    assert!((assessment.confidence - 0.75).abs() < 1e-9);
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn malformed_rerank_reply_keeps_retrieval_order() {
    let mut collaborators = Collaborators::offline(Review::Automated);
    collaborators.index = Arc::new(FixedIndex {
        similarities: vec![0.92, 0.81, 0.40],
    });
    let reranker_llm = Arc::new(MockLlmClient::scripted(vec![Ok("[0.5]".to_string())]));
    collaborators.reranker = Some(Arc::new(LlmReranker::new(reranker_llm)));

    let report = run_rag_with(collaborators).await;
    let novelty = report.context.get(NOVELTY).unwrap();
    assert!(novelty.reranking_enabled);
    assert_eq!(novelty.contributing, vec!["paper-1", "paper-2", "paper-3"]);
    assert!((novelty.aggregate - 0.29).abs() < 1e-9);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("reranking failed"), "{}", report.warnings[0]);
}

#[tokio::test(start_paused = true)]
async fn unavailable_index_is_retried_then_fails_the_run() {
    let index = Arc::new(UnavailableIndex {
        calls: AtomicUsize::new(0),
    });
    let mut collaborators = Collaborators::offline(Review::Automated);
    collaborators.index = index.clone();
    let factory = FlowFactory::new(AppConfig::default(), collaborators);
    let flow = factory.build(FlowKind::Rag).unwrap();

    let mut ctx = Context::new();
    ctx.seed(RESEARCH_IDEA, &idea()).unwrap();
    let err = flow
        .run(&FlowRunner::new(RetryPolicy::default().with_max_retries(2)), ctx)
        .await
        .unwrap_err();
    match err {
        FlowError::NodeFailed { node, inputs, reason } => {
            assert_eq!(node, "retrieve_references");
            assert_eq!(inputs, vec!["idea_embedding".to_string()]);
            assert!(reason.contains("vector index unavailable"), "{reason}");
            assert!(reason.contains("after 3 attempt(s)"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(index.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rag_without_references_is_low_confidence() {
    let report = run_rag(vec![]).await;
    let novelty = report.context.get(NOVELTY).unwrap();
    assert_eq!(novelty.aggregate, 1.0);
    assert!(novelty.low_confidence);
    assert!(novelty.per_reference.is_empty());
    assert_eq!(report.warnings.len(), 1);
}

#[tokio::test]
async fn complete_assistant_runs_offline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.app.output_dir = dir.path().to_path_buf();
    let factory = FlowFactory::new(config, Collaborators::offline(Review::Automated));
    let flow = factory.build(FlowKind::CompleteAssistant).unwrap();

    let mut ctx = Context::new();
    ctx.seed(QUESTION, &"How can GPU inference use less power?".to_string())
        .unwrap();
    let report = flow
        .run(&FlowRunner::new(factory.policy().clone()), ctx)
        .await
        .unwrap();

    assert_eq!(report.flow, "complete-assistant");
    assert_eq!(
        report.visited.first().map(String::as_str),
        Some("idea-generation/idea_loop")
    );
    assert_eq!(
        report.visited.last().map(String::as_str),
        Some("planning/persist_plan")
    );

    let idea = report.context.get(RESEARCH_IDEA).unwrap();
    assert_eq!(idea.provenance.queries.len(), 3);
    let novelty = report.context.get(NOVELTY).unwrap();
    assert_eq!(novelty.idea_id, idea.id);

    let final_plan = report.context.get(FINAL_PLAN).unwrap();
    assert!(final_plan.metadata.approved);
    assert_eq!(final_plan.metadata.cycles, 1);
    assert_eq!(final_plan.metadata.idea_id, idea.id);

    let path = report.context.get(PLAN_PATH).unwrap();
    let markdown = std::fs::read_to_string(&path).unwrap();
    assert!(markdown.starts_with("# Energy-Proportional Low-Precision Inference"));
    assert!(markdown.contains("is not covered by them."));
    assert!(markdown.contains("*Confidence: 0.75*"));
    assert!(path.ends_with("EnergyProportional_LowPrecision_Inference_research_plan.md"));
}

#[tokio::test]
async fn human_feedback_drives_plan_refinement() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.app.output_dir = dir.path().to_path_buf();
    // 第一次评审针对想法（通过），第二次针对计划（打回）
    let channel = Arc::new(ScriptedFeedback::new(vec![
        ValidationVerdict::approved(),
        ValidationVerdict::Rejected {
            feedback: "add a risk register".into(),
            areas_to_improve: vec!["risks".into()],
        },
    ]));
    let factory = FlowFactory::new(config, Collaborators::offline(Review::Human(channel.clone())));
    let flow = factory.build(FlowKind::CompleteAssistant).unwrap();

    let mut ctx = Context::new();
    ctx.seed(QUESTION, &"How can GPU inference use less power?".to_string())
        .unwrap();
    let report = flow
        .run(&FlowRunner::new(RetryPolicy::none()), ctx)
        .await
        .unwrap();

    let final_plan = report.context.get(FINAL_PLAN).unwrap();
    assert_eq!(final_plan.metadata.cycles, 2);
    assert_eq!(final_plan.metadata.outcome, "Plan approved after 2 validation cycle(s).");
    assert_eq!(final_plan.feedback.len(), 2);
    assert_eq!(final_plan.feedback[0].areas_to_improve, vec!["risks"]);
    assert_eq!(final_plan.revision, 1);
    assert_eq!(channel.presented().len(), 3);
}

#[tokio::test]
async fn exhausted_idea_loop_aborts_when_configured() {
    let mut config = AppConfig::default();
    config.idea.max_cycles = 2;
    config.idea.on_exhausted = scout::flow::ExhaustedPolicy::Abort;
    let channel = Arc::new(ScriptedFeedback::new(vec![
        ValidationVerdict::rejected("too broad"),
        ValidationVerdict::rejected("still too broad"),
    ]));
    let factory = FlowFactory::new(config, Collaborators::offline(Review::Human(channel)));
    let flow = factory.build(FlowKind::IdeaGeneration).unwrap();

    let mut ctx = Context::new();
    ctx.seed(QUESTION, &"How can GPU inference use less power?".to_string())
        .unwrap();
    let err = flow
        .run(&FlowRunner::new(RetryPolicy::none()), ctx)
        .await
        .unwrap_err();
    match err {
        FlowError::Aborted { node, reason } => {
            assert_eq!(node, "idea_loop");
            assert!(reason.contains("within 2 cycle(s)"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn exhausted_idea_loop_proceeds_by_default() {
    let channel = Arc::new(ScriptedFeedback::new(vec![
        ValidationVerdict::rejected("too broad"),
        ValidationVerdict::rejected("still too broad"),
        ValidationVerdict::rejected("no"),
    ]));
    let factory = FlowFactory::new(
        AppConfig::default(),
        Collaborators::offline(Review::Human(channel)),
    );
    let flow = factory.build(FlowKind::IdeaGeneration).unwrap();

    let mut ctx = Context::new();
    ctx.seed(QUESTION, &"How can GPU inference use less power?".to_string())
        .unwrap();
    let report = flow
        .run(&FlowRunner::new(RetryPolicy::none()), ctx)
        .await
        .unwrap();
    assert!(report.context.contains(RESEARCH_IDEA.name()));
    assert!(!report.warnings.is_empty());
    assert_eq!(report.context.get(RESEARCH_IDEA).unwrap().revision, 2);
}
