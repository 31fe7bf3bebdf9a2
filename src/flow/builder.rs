//! Flow 构建器
//!
//! 流畅 API 组装节点与边，build() 时整体校验。分支要求判别枚举的每个变体都有去向，
//! 漏掉的变体在构建期报错，而不是在运行到该节点时才发现。

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::GraphError;
use crate::flow::graph::{Edge, FlowGraph, Route};
use crate::flow::stage::Stage;
use crate::flow::types::{resolve_label, Discriminant, Field, NodeId};

pub struct FlowBuilder {
    name: String,
    entry: Option<NodeId>,
    nodes: HashMap<NodeId, Arc<dyn Stage>>,
    order: Vec<NodeId>,
    edges: HashMap<NodeId, Edge>,
    seeds: Vec<&'static str>,
    /// 链式调用中遇到的第一个错误，build() 时返回
    error: Option<GraphError>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: HashMap::new(),
            seeds: Vec::new(),
            error: None,
        }
    }

    fn fail(&mut self, error: GraphError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// 添加节点，节点 ID 取 Stage 名称
    pub fn node(self, stage: impl Stage + 'static) -> Self {
        self.node_arc(Arc::new(stage))
    }

    pub fn node_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        let id = stage.name().to_string();
        if self.nodes.contains_key(&id) {
            self.fail(GraphError::DuplicateNode(id));
            return self;
        }
        self.order.push(id.clone());
        self.nodes.insert(id, stage);
        self
    }

    pub fn entry(mut self, id: impl Into<NodeId>) -> Self {
        self.entry = Some(id.into());
        self
    }

    /// 声明运行前由调用方提供的字段
    pub fn seed<T>(mut self, field: Field<T>) -> Self {
        if !self.seeds.contains(&field.name()) {
            self.seeds.push(field.name());
        }
        self
    }

    fn set_edge(&mut self, from: NodeId, edge: Edge) {
        if self.edges.contains_key(&from) {
            self.fail(GraphError::DuplicateEdges { node: from });
            return;
        }
        self.edges.insert(from, edge);
    }

    /// 无条件边
    pub fn then(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.set_edge(from.into(), Edge::Next(to.into()));
        self
    }

    /// 按判别字段分支；routes 必须覆盖 D 的全部变体
    pub fn branch<D: Discriminant>(
        mut self,
        from: impl Into<NodeId>,
        field: Field<D>,
        routes: Vec<(D, Route)>,
    ) -> Self {
        let from = from.into();
        let labelled: Vec<(&'static str, Route)> =
            routes.into_iter().map(|(d, r)| (d.label(), r)).collect();
        if let Some(missing) = D::variants()
            .iter()
            .find(|v| !labelled.iter().any(|(l, _)| *l == v.label()))
        {
            self.fail(GraphError::UnmatchedDiscriminant {
                node: from,
                field: field.name().to_string(),
                value: missing.label().to_string(),
            });
            return self;
        }
        self.set_edge(
            from,
            Edge::Branch {
                field: field.name(),
                resolve: resolve_label::<D>,
                routes: labelled,
            },
        );
        self
    }

    pub fn build(self) -> Result<FlowGraph, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let graph = FlowGraph {
            name: self.name,
            entry: self.entry.ok_or(GraphError::MissingEntry)?,
            nodes: self.nodes,
            order: self.order,
            edges: self.edges,
            seeds: self.seeds,
        };
        graph.validate()?;
        tracing::debug!(flow = %graph.name, nodes = graph.order.len(), "flow graph validated");
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::Context;
    use crate::flow::stage::{Outcome, Outputs};
    use crate::flow::types::LoopStatus;
    use async_trait::async_trait;

    /// 只声明字段的测试节点
    struct Node {
        name: &'static str,
        inputs: Vec<&'static str>,
        outputs: Vec<&'static str>,
    }

    fn node(name: &'static str, inputs: &[&'static str], outputs: &[&'static str]) -> Node {
        Node {
            name,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        }
    }

    #[async_trait]
    impl Stage for Node {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> Vec<&'static str> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<&'static str> {
            self.outputs.clone()
        }

        async fn run(&self, _ctx: &Context) -> Outcome {
            Outcome::Success(Outputs::new())
        }
    }

    const QUESTION: Field<String> = Field::new("question");
    const STATUS: Field<LoopStatus> = Field::new("status");

    fn looped() -> FlowBuilder {
        FlowBuilder::new("test")
            .seed(QUESTION)
            .node(node("ideate", &["question"], &["idea", "status"]))
            .node(node("finalize", &["idea"], &["final"]))
            .entry("ideate")
    }

    #[test]
    fn test_valid_branching_graph() {
        let graph = looped()
            .branch(
                "ideate",
                STATUS,
                vec![
                    (LoopStatus::Approved, Route::Goto("finalize".to_string())),
                    (LoopStatus::Exhausted, Route::Abort("no approval".to_string())),
                ],
            )
            .build()
            .unwrap();
        assert_eq!(graph.entry(), "ideate");
        assert_eq!(graph.node_ids().collect::<Vec<_>>(), vec!["ideate", "finalize"]);
    }

    #[test]
    fn test_non_exhaustive_branch_rejected() {
        let err = looped()
            .branch(
                "ideate",
                STATUS,
                vec![(LoopStatus::Approved, Route::Goto("finalize".to_string()))],
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnmatchedDiscriminant {
                node: "ideate".to_string(),
                field: "status".to_string(),
                value: "exhausted".to_string(),
            }
        );
    }

    #[test]
    fn test_branch_on_field_node_does_not_produce() {
        let err = FlowBuilder::new("bad")
            .seed(QUESTION)
            .node(node("a", &["question"], &["idea"]))
            .node(node("b", &["idea"], &["final"]))
            .entry("a")
            .branch(
                "a",
                STATUS,
                vec![
                    (LoopStatus::Approved, Route::Goto("b".to_string())),
                    (LoopStatus::Exhausted, Route::Finish),
                ],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::BranchOnForeignField { .. }));
    }

    #[test]
    fn test_unknown_target_and_missing_entry() {
        let err = looped().then("ideate", "nowhere").build().unwrap_err();
        assert_eq!(err, GraphError::UnknownNode("nowhere".to_string()));

        let err = FlowBuilder::new("empty")
            .node(node("a", &[], &[]))
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::MissingEntry);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = FlowBuilder::new("cyclic")
            .node(node("a", &[], &["x"]))
            .node(node("b", &[], &["y"]))
            .entry("a")
            .then("a", "b")
            .then("b", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let err = looped().node(node("orphan", &[], &[])).then("ideate", "finalize").build();
        assert_eq!(err.unwrap_err(), GraphError::Unreachable("orphan".to_string()));
    }

    #[test]
    fn test_duplicate_owner_rejected() {
        let err = FlowBuilder::new("dup")
            .node(node("a", &[], &["x"]))
            .node(node("b", &[], &["x"]))
            .entry("a")
            .then("a", "b")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateOwner { .. }));
    }

    #[test]
    fn test_unsatisfied_input_rejected() {
        let err = FlowBuilder::new("gap")
            .node(node("a", &["question"], &["x"]))
            .entry("a")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnsatisfiedInput {
                node: "a".to_string(),
                field: "question".to_string(),
            }
        );
    }

    #[test]
    fn test_input_only_on_some_paths_rejected() {
        // c 需要 y，但经 a -> c 的路径上没有 y
        let err = FlowBuilder::new("paths")
            .node(node("a", &[], &["status"]))
            .node(node("b", &[], &["y"]))
            .node(node("c", &["y"], &[]))
            .entry("a")
            .branch(
                "a",
                STATUS,
                vec![
                    (LoopStatus::Approved, Route::Goto("b".to_string())),
                    (LoopStatus::Exhausted, Route::Goto("c".to_string())),
                ],
            )
            .then("b", "c")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::UnsatisfiedInput { .. }));
    }

    #[test]
    fn test_duplicate_edges_rejected() {
        let err = looped()
            .then("ideate", "finalize")
            .then("ideate", "finalize")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateEdges {
                node: "ideate".to_string()
            }
        );
    }
}
