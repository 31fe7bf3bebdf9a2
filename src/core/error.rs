//! 错误分类：Retryable / Fatal / 上下文错误 / 图构建错误 / 运行中止
//!
//! 所有外部协作方（LLM、搜索、向量库、持久化）的错误都先归类为 StageError，
//! 由重试策略决定是退避重试还是升级为 Fatal；Flow 层只看到 FlowError。

use thiserror::Error;

/// Stage 级错误：可重试（限流、超时、瞬时网络错误）或致命（契约违背、输入非法、重试耗尽）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        StageError::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        StageError::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            StageError::Retryable(r) | StageError::Fatal(r) => r,
        }
    }

    /// 重试耗尽后升级为 Fatal（保留最后一次失败原因）
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            StageError::Retryable(r) => {
                StageError::Fatal(format!("retries exhausted after {attempts} attempt(s): {r}"))
            }
            fatal => fatal,
        }
    }
}

/// Context 读写错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("missing field: {0}")]
    MissingField(String),

    /// fan-in 时两个分支对同一字段写入了不同的值
    #[error("conflicting writes to field '{field}' from branches {first} and {second}")]
    Conflict {
        field: String,
        first: usize,
        second: usize,
    },

    #[error("field '{field}' is owned by '{owner}', '{writer}' may not write it")]
    NotOwner {
        field: String,
        owner: String,
        writer: String,
    },

    #[error("field '{field}' has no declared owner")]
    Undeclared { field: String },

    #[error("cannot decode field '{field}': {reason}")]
    Decode { field: String, reason: String },

    #[error("cannot encode field '{field}': {reason}")]
    Encode { field: String, reason: String },
}

impl From<ContextError> for StageError {
    fn from(e: ContextError) -> Self {
        StageError::Fatal(e.to_string())
    }
}

/// 图构建期错误：在任何协作方调用之前拒绝非法图
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no entry node")]
    MissingEntry,

    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    #[error("unknown node referenced: {0}")]
    UnknownNode(String),

    #[error("node '{node}' already has outgoing edges")]
    DuplicateEdges { node: String },

    #[error("node '{node}' does not cover discriminant value '{value}' of field '{field}'")]
    UnmatchedDiscriminant {
        node: String,
        field: String,
        value: String,
    },

    #[error("node '{node}' branches on field '{field}' it does not produce")]
    BranchOnForeignField { node: String, field: String },

    #[error("node unreachable from entry: {0}")]
    Unreachable(String),

    #[error("cycle detected through node: {0}")]
    Cycle(String),

    #[error("field '{field}' is produced by both '{first}' and '{second}'")]
    DuplicateOwner {
        field: String,
        first: String,
        second: String,
    },

    #[error("node '{node}' requires field '{field}' that nothing provides")]
    UnsatisfiedInput { node: String, field: String },

    #[error("graph has no terminal node")]
    NoTerminal,
}

/// Fan-Out 失败：分支序号从 1 开始，与输入序列中的位置一一对应
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FanOutError {
    #[error("fan-out input: {0}")]
    Input(#[from] ContextError),

    #[error("branch {branch} of {total} failed: {error}")]
    Branch {
        branch: usize,
        total: usize,
        error: StageError,
    },

    #[error("fan-in merge: {0}")]
    Merge(ContextError),
}

impl From<FanOutError> for StageError {
    fn from(e: FanOutError) -> Self {
        StageError::Fatal(e.to_string())
    }
}

/// 运行期中止：报告失败节点、节点声明的输入与底层原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("node '{node}' failed (inputs: [{}]): {reason}", inputs.join(", "))]
    NodeFailed {
        node: String,
        inputs: Vec<String>,
        reason: String,
    },

    #[error("run aborted after node '{node}': {reason}")]
    Aborted { node: String, reason: String },

    #[error("node '{node}' produced no matching edge for {field} = {value}")]
    NoMatchingEdge {
        node: String,
        field: String,
        value: String,
    },

    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate_retryable_becomes_fatal() {
        let err = StageError::retryable("rate limited").escalate(3);
        assert!(!err.is_retryable());
        assert!(err.reason().contains("3 attempt(s)"));
        assert!(err.reason().contains("rate limited"));
    }

    #[test]
    fn test_escalate_keeps_fatal() {
        let err = StageError::fatal("bad schema").escalate(1);
        assert_eq!(err, StageError::Fatal("bad schema".to_string()));
    }

    #[test]
    fn test_node_failed_display_lists_inputs() {
        let err = FlowError::NodeFailed {
            node: "retrieve".to_string(),
            inputs: vec!["embedding".to_string()],
            reason: "index offline".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("retrieve"));
        assert!(msg.contains("[embedding]"));
        assert!(msg.contains("index offline"));
    }
}
