//! 科研助手领域层：数据模型、Context 字段、各流程的 Stage 与组装

pub mod collaborators;
pub mod fields;
pub mod flows;
pub mod idea;
pub mod markdown;
pub mod offline;
pub mod plan;
pub mod prompts;
pub mod review;
pub mod types;

pub use collaborators::{create_llm, CollaboratorError, Collaborators, Review};
pub use flows::{AnswerQuestion, Flow, FlowFactory, FlowKind};
pub use markdown::{FsMarkdownWriter, MarkdownWriter, PersistError};
pub use review::{ConsoleFeedback, FeedbackChannel, ScriptedFeedback};
pub use types::{FinalPlan, PlanRequest, ResearchIdea, ResearchPlan};
