//! 流程编排层：共享上下文、Stage、Fan-Out/Fan-In、校验循环、Flow 图与运行器

pub mod builder;
pub mod context;
pub mod engine;
pub mod fanout;
pub mod graph;
pub mod stage;
pub mod types;
pub mod validation;

pub use builder::FlowBuilder;
pub use context::Context;
pub use engine::{FlowChain, FlowRunner, RunReport};
pub use fanout::{FanIn, FanOut};
pub use graph::{FlowGraph, Route};
pub use stage::{Outcome, Outputs, Sequence, Stage, Supervision};
pub use types::*;
pub use validation::{LoopFields, LoopReport, LoopState, ValidationLoop};
