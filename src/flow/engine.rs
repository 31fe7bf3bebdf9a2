//! Flow 运行器
//!
//! 每次运行独占一个 Context：检查种子字段、登记字段归属，然后从入口节点逐个执行到终止。
//! 节点失败时报告节点名、其声明的输入与底层原因。FlowChain 把多张图串起来，
//! 前一张图的终态上下文（只携带声明的字段）作为下一张图的初始上下文。

use std::time::Instant;

use tracing::{error, info, warn};

use crate::core::{ContextError, FlowError, GraphError, RetryPolicy};
use crate::flow::context::Context;
use crate::flow::graph::{FlowGraph, Route};
use crate::flow::stage::{apply_outputs, run_supervised};
use crate::flow::types::NodeId;

/// 一次运行的结果
#[derive(Debug)]
pub struct RunReport {
    pub flow: String,
    pub context: Context,
    /// 依次执行过的节点
    pub visited: Vec<NodeId>,
    /// 非致命警告（如校验循环耗尽后继续）
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FlowRunner {
    policy: RetryPolicy,
}

impl FlowRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn run(&self, graph: &FlowGraph, mut ctx: Context) -> Result<RunReport, FlowError> {
        if let Some(missing) = graph.seeds().iter().find(|f| !ctx.contains(f)) {
            error!(flow = graph.name(), field = missing, "missing initial field");
            return Err(ContextError::MissingField(missing.to_string()).into());
        }
        graph.declare_owners(&mut ctx)?;

        info!(flow = graph.name(), entry = graph.entry(), "flow started");
        let started = Instant::now();
        let mut visited = Vec::new();
        let mut warnings = Vec::new();
        let mut current = graph.entry().to_string();

        loop {
            let node = graph
                .node(&current)
                .ok_or_else(|| GraphError::UnknownNode(current.clone()))?;

            let node_started = Instant::now();
            let result = match run_supervised(node.as_ref(), &ctx, &self.policy).await {
                Ok(outputs) => apply_outputs(&mut ctx, &current, node.as_ref(), outputs),
                Err(e) => Err(e),
            };
            match result {
                Ok(node_warnings) => {
                    for w in &node_warnings {
                        warn!(flow = graph.name(), node = %current, "{}", w);
                    }
                    warnings.extend(node_warnings);
                    info!(
                        flow = graph.name(),
                        node = %current,
                        elapsed_ms = node_started.elapsed().as_millis() as u64,
                        "node completed"
                    );
                }
                Err(e) => {
                    let inputs: Vec<String> = node.inputs().iter().map(|f| f.to_string()).collect();
                    error!(
                        flow = graph.name(),
                        node = %current,
                        inputs = ?inputs,
                        error = %e,
                        "node failed, aborting run"
                    );
                    return Err(FlowError::NodeFailed {
                        node: current,
                        inputs,
                        reason: e.reason().to_string(),
                    });
                }
            }
            visited.push(current.clone());

            match graph.next(&current, &ctx)? {
                Route::Goto(next) => current = next,
                Route::Finish => break,
                Route::Abort(reason) => {
                    error!(flow = graph.name(), node = %current, reason = %reason, "run aborted");
                    return Err(FlowError::Aborted {
                        node: current,
                        reason,
                    });
                }
            }
        }

        info!(
            flow = graph.name(),
            nodes = visited.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flow completed"
        );
        Ok(RunReport {
            flow: graph.name().to_string(),
            context: ctx,
            visited,
            warnings,
        })
    }

    /// 依次运行链上的每张图
    pub async fn run_chain(&self, chain: &FlowChain, ctx: Context) -> Result<RunReport, FlowError> {
        let mut ctx = ctx;
        let mut visited = Vec::new();
        let mut warnings = Vec::new();

        for (i, link) in chain.links.iter().enumerate() {
            let report = self.run(&link.graph, ctx).await?;
            visited.extend(
                report
                    .visited
                    .iter()
                    .map(|node| format!("{}/{}", report.flow, node)),
            );
            warnings.extend(report.warnings);
            ctx = if i + 1 < chain.links.len() {
                report.context.carry(&link.carry)
            } else {
                report.context
            };
        }

        info!(chain = %chain.name, flows = chain.links.len(), "chain completed");
        Ok(RunReport {
            flow: chain.name.clone(),
            context: ctx,
            visited,
            warnings,
        })
    }
}

/// 链上的一段：图 + 传给下一段的字段
pub struct ChainLink {
    pub graph: FlowGraph,
    pub carry: Vec<&'static str>,
}

/// 多张图的顺序组合（complete assistant）
pub struct FlowChain {
    name: String,
    links: Vec<ChainLink>,
}

impl FlowChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            links: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 追加一段；carry 是本段结束后带入下一段的字段
    pub fn link(mut self, graph: FlowGraph, carry: &[&'static str]) -> Self {
        self.links.push(ChainLink {
            graph,
            carry: carry.to_vec(),
        });
        self
    }

    /// 首段的种子字段
    pub fn seeds(&self) -> &[&'static str] {
        self.links.first().map(|l| l.graph.seeds()).unwrap_or(&[])
    }

    /// 每段携带的字段必须由本段提供，下一段的种子必须都在携带集合里
    pub fn validate(self) -> Result<Self, GraphError> {
        for pair in self.links.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let produced = prev.graph.produced_fields();
            if let Some(field) = prev
                .carry
                .iter()
                .find(|f| !produced.contains(*f) && !prev.graph.seeds().contains(*f))
            {
                return Err(GraphError::UnsatisfiedInput {
                    node: prev.graph.name().to_string(),
                    field: field.to_string(),
                });
            }
            if let Some(field) = next.graph.seeds().iter().find(|f| !prev.carry.contains(*f)) {
                return Err(GraphError::UnsatisfiedInput {
                    node: next.graph.name().to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageError;
    use crate::flow::builder::FlowBuilder;
    use crate::flow::stage::{Outcome, Outputs, Stage};
    use crate::flow::types::{Field, LoopStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const QUESTION: Field<String> = Field::new("question");
    const ANSWER: Field<String> = Field::new("answer");
    const STATUS: Field<LoopStatus> = Field::new("status");
    const SHOUT: Field<String> = Field::new("shout");

    struct Answer {
        calls: Arc<AtomicU32>,
        status: Option<LoopStatus>,
    }

    #[async_trait]
    impl Stage for Answer {
        fn name(&self) -> &str {
            "answer"
        }

        fn inputs(&self) -> Vec<&'static str> {
            vec![QUESTION.name()]
        }

        fn outputs(&self) -> Vec<&'static str> {
            vec![ANSWER.name(), STATUS.name()]
        }

        async fn run(&self, ctx: &Context) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result: Result<Outputs, StageError> = async {
                let q = ctx.get(QUESTION)?;
                let mut out = Outputs::new().with(ANSWER, &format!("answer to {q}"))?;
                if let Some(status) = self.status {
                    out = out.with(STATUS, &status)?;
                }
                Ok(out)
            }
            .await;
            result.into()
        }
    }

    struct Shout;

    #[async_trait]
    impl Stage for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        fn inputs(&self) -> Vec<&'static str> {
            vec![ANSWER.name()]
        }

        fn outputs(&self) -> Vec<&'static str> {
            vec![SHOUT.name()]
        }

        async fn run(&self, ctx: &Context) -> Outcome {
            match ctx.get(ANSWER) {
                Ok(a) if a.is_empty() => Outcome::Fatal("empty answer".to_string()),
                Ok(a) => Outputs::new()
                    .with(SHOUT, &a.to_uppercase())
                    .map_err(StageError::from)
                    .into(),
                Err(e) => Outcome::Fatal(e.to_string()),
            }
        }
    }

    fn graph(status: Option<LoopStatus>, calls: Arc<AtomicU32>) -> FlowGraph {
        FlowBuilder::new("qa")
            .seed(QUESTION)
            .node(Answer { calls, status })
            .node(Shout)
            .entry("answer")
            .branch(
                "answer",
                STATUS,
                vec![
                    (LoopStatus::Approved, Route::Goto("shout".to_string())),
                    (LoopStatus::Exhausted, Route::Abort("answer not approved".to_string())),
                ],
            )
            .build()
            .unwrap()
    }

    fn seeded(question: &str) -> Context {
        let mut ctx = Context::new();
        ctx.seed(QUESTION, &question.to_string()).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_run_follows_branch_to_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let g = graph(Some(LoopStatus::Approved), calls.clone());
        let report = FlowRunner::new(RetryPolicy::none())
            .run(&g, seeded("why"))
            .await
            .unwrap();
        assert_eq!(report.visited, vec!["answer", "shout"]);
        assert_eq!(report.context.get(SHOUT).unwrap(), "ANSWER TO WHY");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_route_stops_run() {
        let g = graph(Some(LoopStatus::Exhausted), Arc::new(AtomicU32::new(0)));
        let err = FlowRunner::default().run(&g, seeded("why")).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::Aborted {
                node: "answer".to_string(),
                reason: "answer not approved".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_discriminant_is_no_matching_edge() {
        let g = graph(None, Arc::new(AtomicU32::new(0)));
        let err = FlowRunner::default().run(&g, seeded("why")).await.unwrap_err();
        assert!(matches!(err, FlowError::NoMatchingEdge { .. }));
    }

    #[tokio::test]
    async fn test_missing_seed_rejected_before_any_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let g = graph(Some(LoopStatus::Approved), calls.clone());
        let err = FlowRunner::default().run(&g, Context::new()).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::Context(ContextError::MissingField("question".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_node_failure_reports_node_and_inputs() {
        let g = FlowBuilder::new("shouting")
            .seed(ANSWER)
            .node(Shout)
            .entry("shout")
            .build()
            .unwrap();
        let mut ctx = Context::new();
        ctx.seed(ANSWER, &String::new()).unwrap();
        let err = FlowRunner::new(RetryPolicy::none())
            .run(&g, ctx)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FlowError::NodeFailed {
                node: "shout".to_string(),
                inputs: vec!["answer".to_string()],
                reason: "empty answer".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_chain_carries_declared_fields() {
        let first = FlowBuilder::new("first")
            .seed(QUESTION)
            .node(Answer {
                calls: Arc::new(AtomicU32::new(0)),
                status: None,
            })
            .entry("answer")
            .build()
            .unwrap();
        let second = FlowBuilder::new("second")
            .seed(ANSWER)
            .node(Shout)
            .entry("shout")
            .build()
            .unwrap();
        let chain = FlowChain::new("both")
            .link(first, &["answer"])
            .link(second, &[])
            .validate()
            .unwrap();
        assert_eq!(chain.seeds(), &["question"]);

        let report = FlowRunner::default().run_chain(&chain, seeded("how")).await.unwrap();
        assert_eq!(report.visited, vec!["first/answer", "second/shout"]);
        assert_eq!(report.context.get(SHOUT).unwrap(), "ANSWER TO HOW");
        // 未携带的字段不会进入下一段
        assert!(!report.context.contains("question"));
    }

    #[test]
    fn test_chain_rejects_uncarried_seed() {
        let first = FlowBuilder::new("first")
            .seed(QUESTION)
            .node(Answer {
                calls: Arc::new(AtomicU32::new(0)),
                status: None,
            })
            .entry("answer")
            .build()
            .unwrap();
        let second = FlowBuilder::new("second")
            .seed(ANSWER)
            .node(Shout)
            .entry("shout")
            .build()
            .unwrap();
        let err = FlowChain::new("broken")
            .link(first, &["question"])
            .link(second, &[])
            .validate()
            .err()
            .unwrap();
        assert_eq!(
            err,
            GraphError::UnsatisfiedInput {
                node: "second".to_string(),
                field: "answer".to_string(),
            }
        );
    }
}
