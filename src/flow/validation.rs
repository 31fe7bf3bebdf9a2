//! 校验循环控制器
//!
//! 状态机：Produce → Critique → (Approved | Produce | Exhausted)。
//! 生产者每轮都能读到完整的反馈日志（只追加），周期计数每轮覆盖。
//! Exhausted 不是错误：产出最后一版产物 + 未解决的反馈，由 Flow Graph 决定继续还是中止。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::{RetryPolicy, StageError};
use crate::flow::context::Context;
use crate::flow::stage::{
    apply_outputs, collect_outputs, dedup, run_supervised, Outcome, Outputs, Stage, Supervision,
};
use crate::flow::types::{FeedbackEntry, Field, LoopStatus, ValidationVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Produce,
    Critique,
    Approved,
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Approved | LoopState::Exhausted)
    }
}

/// 循环自身维护的字段
#[derive(Debug, Clone, Copy)]
pub struct LoopFields {
    /// 评审者写入的结论
    pub verdict: Field<ValidationVerdict>,
    /// 只追加的反馈日志
    pub feedback: Field<Vec<FeedbackEntry>>,
    pub cycles: Field<u32>,
    /// 分支判别字段
    pub status: Field<LoopStatus>,
}

/// 一次循环的结果
#[derive(Debug)]
pub struct LoopReport {
    pub state: LoopState,
    pub cycles: u32,
    /// Exhausted 时最后一轮未解决的反馈
    pub unresolved: Option<String>,
    pub outputs: Outputs,
}

pub struct ValidationLoop {
    name: String,
    producer: Arc<dyn Stage>,
    critic: Arc<dyn Stage>,
    fields: LoopFields,
    max_cycles: u32,
    policy: RetryPolicy,
}

impl ValidationLoop {
    pub fn new(
        name: impl Into<String>,
        producer: impl Stage + 'static,
        critic: Arc<dyn Stage>,
        fields: LoopFields,
    ) -> Self {
        Self {
            name: name.into(),
            producer: Arc::new(producer),
            critic,
            fields,
            max_cycles: 3,
            policy: RetryPolicy::default(),
        }
    }

    /// 至少一轮
    pub fn max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn own_fields(&self) -> [&'static str; 3] {
        [
            self.fields.feedback.name(),
            self.fields.cycles.name(),
            self.fields.status.name(),
        ]
    }

    pub async fn drive(&self, ctx: &Context) -> Result<LoopReport, StageError> {
        let outputs = self.outputs();
        let mut scratch = ctx.clone();
        for field in &outputs {
            scratch.declare_owner(field, &self.name)?;
        }

        let mut state = LoopState::Produce;
        let mut cycle = 0u32;
        let mut log: Vec<FeedbackEntry> = Vec::new();
        let mut warnings = Vec::new();

        while !state.is_terminal() {
            state = match state {
                LoopState::Produce => {
                    cycle += 1;
                    info!(node = %self.name, cycle, max_cycles = self.max_cycles, "producing");
                    let out = run_supervised(self.producer.as_ref(), &scratch, &self.policy).await?;
                    warnings.extend(apply_outputs(
                        &mut scratch,
                        &self.name,
                        self.producer.as_ref(),
                        out,
                    )?);
                    scratch.set(&self.name, self.fields.cycles, &cycle)?;
                    LoopState::Critique
                }
                LoopState::Critique => {
                    let out = run_supervised(self.critic.as_ref(), &scratch, &self.policy).await?;
                    warnings.extend(apply_outputs(
                        &mut scratch,
                        &self.name,
                        self.critic.as_ref(),
                        out,
                    )?);
                    let verdict = scratch.get(self.fields.verdict)?;
                    log.push(FeedbackEntry::from_verdict(cycle, &verdict));
                    scratch.set(&self.name, self.fields.feedback, &log)?;

                    if verdict.is_approved() {
                        LoopState::Approved
                    } else if cycle >= self.max_cycles {
                        LoopState::Exhausted
                    } else {
                        info!(node = %self.name, cycle, feedback = verdict.feedback(), "revision requested");
                        LoopState::Produce
                    }
                }
                terminal => terminal,
            };
        }

        let status = match state {
            LoopState::Approved => LoopStatus::Approved,
            _ => LoopStatus::Exhausted,
        };
        scratch.set(&self.name, self.fields.status, &status)?;

        let unresolved = match state {
            LoopState::Exhausted => {
                let feedback = log.last().map(|e| e.feedback.clone()).unwrap_or_default();
                warn!(
                    node = %self.name,
                    cycles = cycle,
                    feedback = %feedback,
                    "validation loop exhausted without approval"
                );
                warnings.push(format!(
                    "'{}' exhausted after {} cycle(s) without approval: {}",
                    self.name, cycle, feedback
                ));
                Some(feedback)
            }
            _ => None,
        };

        let mut collected = collect_outputs(&scratch, &outputs);
        collected.extend_warnings(warnings);
        Ok(LoopReport {
            state,
            cycles: cycle,
            unresolved,
            outputs: collected,
        })
    }
}

#[async_trait]
impl Stage for ValidationLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<&'static str> {
        let produced = self.outputs();
        dedup(
            self.producer
                .inputs()
                .into_iter()
                .chain(self.critic.inputs())
                .filter(|f| !produced.contains(f)),
        )
    }

    fn outputs(&self) -> Vec<&'static str> {
        dedup(
            self.producer
                .outputs()
                .into_iter()
                .chain(self.critic.outputs())
                .chain(self.own_fields()),
        )
    }

    fn supervision(&self) -> Supervision {
        Supervision::SelfManaged
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.drive(ctx).await.map(|report| report.outputs).into()
    }
}
