//! Flow 图
//!
//! 节点是 Stage（可能被校验循环或 Fan-Out 包装），边要么无条件指向下一节点，
//! 要么按节点输出的判别字段分支。图在构建时一次性校验（见 FlowGraph::validate），
//! 非法的图在任何协作方调用之前就被拒绝。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::core::{ContextError, FlowError, GraphError};
use crate::flow::context::Context;
use crate::flow::stage::Stage;
use crate::flow::types::NodeId;

/// 判别值解析器：原始 JSON -> 变体标签
pub type LabelResolver = fn(&Value) -> Option<&'static str>;

/// 分支的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Goto(NodeId),
    /// 正常结束运行
    Finish,
    /// 以给定原因中止运行
    Abort(String),
}

#[derive(Debug, Clone)]
pub enum Edge {
    Next(NodeId),
    Branch {
        field: &'static str,
        resolve: LabelResolver,
        routes: Vec<(&'static str, Route)>,
    },
}

impl Edge {
    fn targets(&self) -> Vec<&NodeId> {
        match self {
            Edge::Next(to) => vec![to],
            Edge::Branch { routes, .. } => routes
                .iter()
                .filter_map(|(_, route)| match route {
                    Route::Goto(to) => Some(to),
                    _ => None,
                })
                .collect(),
        }
    }

    fn can_finish(&self) -> bool {
        match self {
            Edge::Next(_) => false,
            Edge::Branch { routes, .. } => routes.iter().any(|(_, r)| *r == Route::Finish),
        }
    }
}

/// 已校验的 Flow 图
pub struct FlowGraph {
    pub(crate) name: String,
    pub(crate) entry: NodeId,
    pub(crate) nodes: HashMap<NodeId, Arc<dyn Stage>>,
    /// 节点添加顺序（日志与校验输出稳定）
    pub(crate) order: Vec<NodeId>,
    pub(crate) edges: HashMap<NodeId, Edge>,
    /// 运行前必须由调用方提供的字段
    pub(crate) seeds: Vec<&'static str>,
}

impl std::fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .field("seeds", &self.seeds)
            .finish()
    }
}

impl FlowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn seeds(&self) -> &[&'static str] {
        &self.seeds
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Stage>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// 所有节点输出字段的并集
    pub fn produced_fields(&self) -> BTreeSet<&'static str> {
        self.nodes.values().flat_map(|n| n.outputs()).collect()
    }

    /// 把每个节点的输出字段归属登记到上下文
    pub fn declare_owners(&self, ctx: &mut Context) -> Result<(), ContextError> {
        for id in &self.order {
            if let Some(node) = self.nodes.get(id) {
                for field in node.outputs() {
                    ctx.declare_owner(field, id)?;
                }
            }
        }
        Ok(())
    }

    /// 节点完成后决定去向；没有出边的节点即终止节点
    pub fn next(&self, node: &str, ctx: &Context) -> Result<Route, FlowError> {
        match self.edges.get(node) {
            None => Ok(Route::Finish),
            Some(Edge::Next(to)) => Ok(Route::Goto(to.clone())),
            Some(Edge::Branch {
                field,
                resolve,
                routes,
            }) => {
                let raw = ctx.get_raw(field).cloned().unwrap_or(Value::Null);
                let no_match = || FlowError::NoMatchingEdge {
                    node: node.to_string(),
                    field: field.to_string(),
                    value: raw.to_string(),
                };
                let label = resolve(&raw).ok_or_else(no_match)?;
                routes
                    .iter()
                    .find(|(l, _)| *l == label)
                    .map(|(_, route)| route.clone())
                    .ok_or_else(no_match)
            }
        }
    }

    /// 构建期校验：入口、引用、分支字段、字段归属、无环、可达、输入可满足、存在终止节点
    pub(crate) fn validate(&self) -> Result<(), GraphError> {
        if self.entry.is_empty() {
            return Err(GraphError::MissingEntry);
        }
        if !self.nodes.contains_key(&self.entry) {
            return Err(GraphError::UnknownNode(self.entry.clone()));
        }

        for (from, edge) in &self.edges {
            let node = self
                .nodes
                .get(from)
                .ok_or_else(|| GraphError::UnknownNode(from.clone()))?;
            for to in edge.targets() {
                if !self.nodes.contains_key(to) {
                    return Err(GraphError::UnknownNode(to.clone()));
                }
            }
            if let Edge::Branch { field, .. } = edge {
                if !node.outputs().contains(field) {
                    return Err(GraphError::BranchOnForeignField {
                        node: from.clone(),
                        field: field.to_string(),
                    });
                }
            }
        }

        let mut owners: BTreeMap<&'static str, &str> = BTreeMap::new();
        for seed in &self.seeds {
            owners.insert(*seed, "<seed>");
        }
        for id in &self.order {
            for field in self.nodes[id].outputs() {
                if let Some(first) = owners.insert(field, id) {
                    return Err(GraphError::DuplicateOwner {
                        field: field.to_string(),
                        first: first.to_string(),
                        second: id.clone(),
                    });
                }
            }
        }

        let topo = self.topological_order()?;

        let reachable = self.reachable();
        if let Some(id) = self.order.iter().find(|id| !reachable.contains(id.as_str())) {
            return Err(GraphError::Unreachable(id.clone()));
        }

        self.check_inputs(&topo)?;

        let has_terminal = self
            .order
            .iter()
            .any(|id| self.edges.get(id).map_or(true, Edge::can_finish));
        if !has_terminal {
            return Err(GraphError::NoTerminal);
        }
        Ok(())
    }

    /// 邻接表 + 入度表做拓扑排序；剩余入度非零的节点说明有环
    fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            in_degree.insert(id, 0);
            adjacency.insert(id, Vec::new());
        }
        for (from, edge) in &self.edges {
            for to in edge.targets() {
                adjacency.entry(from.as_str()).or_default().push(to.as_str());
                *in_degree.entry(to.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());
            for next in adjacency.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if sorted.len() < self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| in_degree.get(id.as_str()).copied().unwrap_or(0) > 0)
                .cloned()
                .unwrap_or_default();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(sorted)
    }

    fn reachable(&self) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([self.entry.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(edge) = self.edges.get(id) {
                queue.extend(edge.targets().into_iter().map(String::as_str));
            }
        }
        seen
    }

    /// 每个节点的输入必须在到达它的每条路径上都已可用（种子字段或上游输出）
    fn check_inputs(&self, topo: &[NodeId]) -> Result<(), GraphError> {
        let mut available: HashMap<&str, BTreeSet<&'static str>> = HashMap::new();
        available.insert(&self.entry, self.seeds.iter().copied().collect());

        for id in topo {
            let Some(before) = available.get(id.as_str()).cloned() else {
                continue;
            };
            let node = &self.nodes[id];
            if let Some(missing) = node.inputs().into_iter().find(|f| !before.contains(f)) {
                return Err(GraphError::UnsatisfiedInput {
                    node: id.clone(),
                    field: missing.to_string(),
                });
            }
            let mut after = before;
            after.extend(node.outputs());
            if let Some(edge) = self.edges.get(id) {
                for to in edge.targets() {
                    available
                        .entry(to)
                        .and_modify(|set| set.retain(|f| after.contains(f)))
                        .or_insert_with(|| after.clone());
                }
            }
        }
        Ok(())
    }
}
