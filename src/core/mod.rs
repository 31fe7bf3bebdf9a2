//! 核心层：错误分类与重试策略

pub mod error;
pub mod retry;

pub use error::{ContextError, FanOutError, FlowError, GraphError, StageError};
pub use retry::RetryPolicy;
