//! Stage：流程中的最小工作单元
//!
//! Stage 声明输入字段与输出字段，run 只能看到声明过的输入（执行器先 fork 出只含这些字段的视图），
//! 返回 Outcome：Success(输出) / Retryable / Fatal。输出由调用方按归属写回 Context，
//! 因此 Stage 本身不直接修改共享状态，重复调用是幂等的。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::{ContextError, RetryPolicy, StageError};
use crate::flow::context::Context;
use crate::flow::types::Field;

/// Stage 执行结果
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Outputs),
    Retryable(String),
    Fatal(String),
}

impl Outcome {
    pub fn into_result(self) -> Result<Outputs, StageError> {
        match self {
            Outcome::Success(outputs) => Ok(outputs),
            Outcome::Retryable(reason) => Err(StageError::Retryable(reason)),
            Outcome::Fatal(reason) => Err(StageError::Fatal(reason)),
        }
    }
}

impl From<Result<Outputs, StageError>> for Outcome {
    fn from(result: Result<Outputs, StageError>) -> Self {
        match result {
            Ok(outputs) => Outcome::Success(outputs),
            Err(StageError::Retryable(reason)) => Outcome::Retryable(reason),
            Err(StageError::Fatal(reason)) => Outcome::Fatal(reason),
        }
    }
}

/// Stage 的输出字段集合，附带运行期警告（如校验循环耗尽）
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    values: Vec<(&'static str, Value)>,
    warnings: Vec<String>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Serialize>(mut self, field: Field<T>, value: &T) -> Result<Self, ContextError> {
        let value = serde_json::to_value(value).map_err(|e| ContextError::Encode {
            field: field.name().to_string(),
            reason: e.to_string(),
        })?;
        self.insert_raw(field.name(), value);
        Ok(self)
    }

    pub fn insert_raw(&mut self, name: &'static str, value: Value) {
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
    }

    pub fn take_raw(&mut self, name: &str) -> Option<Value> {
        let pos = self.values.iter().position(|(n, _)| *n == name)?;
        Some(self.values.remove(pos).1)
    }

    pub fn get<T: DeserializeOwned>(&self, field: Field<T>) -> Option<T> {
        self.values
            .iter()
            .find(|(n, _)| *n == field.name())
            .and_then(|(_, v)| serde_json::from_value(v.clone()).ok())
    }

    pub fn warn(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.warnings.extend(warnings);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_parts(self) -> (Vec<(&'static str, Value)>, Vec<String>) {
        (self.values, self.warnings)
    }
}

/// 执行器如何对待某个 Stage 的重试与超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// 按运行策略超时 + 重试（默认，适用于单次协作方调用）
    Retried,
    /// 重试但不限时（等待人工反馈）
    Untimed,
    /// 复合 Stage 自行管理子 Stage 的重试，只运行一次
    SelfManaged,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// 运行前必须存在（或可选读取）的字段
    fn inputs(&self) -> Vec<&'static str>;

    /// 只有本 Stage（或包装它的循环 / 序列）可以写入的字段
    fn outputs(&self) -> Vec<&'static str>;

    fn supervision(&self) -> Supervision {
        Supervision::Retried
    }

    async fn run(&self, ctx: &Context) -> Outcome;
}

/// 在只含声明输入的视图上运行 Stage，并按其监管方式施加重试策略
pub async fn run_supervised(
    stage: &dyn Stage,
    ctx: &Context,
    policy: &RetryPolicy,
) -> Result<Outputs, StageError> {
    let view = ctx.fork(&stage.inputs());
    let view = &view;
    match stage.supervision() {
        Supervision::SelfManaged => stage.run(view).await.into_result(),
        Supervision::Retried => {
            policy
                .run(stage.name(), move |_| async move { stage.run(view).await.into_result() })
                .await
        }
        Supervision::Untimed => {
            policy
                .without_timeout()
                .run(stage.name(), move |_| async move { stage.run(view).await.into_result() })
                .await
        }
    }
}

/// 以 writer 身份把输出写回 ctx；写入未声明的字段视为契约违背
pub fn apply_outputs(
    ctx: &mut Context,
    writer: &str,
    stage: &dyn Stage,
    outputs: Outputs,
) -> Result<Vec<String>, StageError> {
    let declared = stage.outputs();
    let (values, warnings) = outputs.into_parts();
    for (name, value) in values {
        if !declared.contains(&name) {
            return Err(StageError::fatal(format!(
                "stage '{}' wrote undeclared field '{}'",
                stage.name(),
                name
            )));
        }
        ctx.set_raw(writer, name, value)?;
    }
    Ok(warnings)
}

/// 从 scratch 上下文中收集指定字段作为输出（缺失字段跳过）
pub fn collect_outputs(scratch: &Context, fields: &[&'static str]) -> Outputs {
    let mut outputs = Outputs::new();
    for name in fields {
        if let Some(value) = scratch.get_raw(name) {
            outputs.insert_raw(name, value.clone());
        }
    }
    outputs
}

/// 去重并保持首次出现顺序
pub(crate) fn dedup(fields: impl IntoIterator<Item = &'static str>) -> Vec<&'static str> {
    let mut seen = BTreeSet::new();
    fields.into_iter().filter(|f| seen.insert(*f)).collect()
}

/// 顺序组合：依次运行子 Stage，前者的输出对后者可见；整体作为一个 Stage 对外
pub struct Sequence {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    policy: RetryPolicy,
}

impl Sequence {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            policy,
        }
    }

    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn then_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }
}

#[async_trait]
impl Stage for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<&'static str> {
        let mut produced = BTreeSet::new();
        let mut inputs = Vec::new();
        for stage in &self.stages {
            inputs.extend(stage.inputs().into_iter().filter(|f| !produced.contains(f)));
            produced.extend(stage.outputs());
        }
        dedup(inputs)
    }

    fn outputs(&self) -> Vec<&'static str> {
        dedup(self.stages.iter().flat_map(|s| s.outputs()))
    }

    fn supervision(&self) -> Supervision {
        Supervision::SelfManaged
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        let result: Result<Outputs, StageError> = async {
            let mut scratch = ctx.clone();
            let outputs = self.outputs();
            for field in &outputs {
                scratch.declare_owner(field, &self.name)?;
            }
            let mut warnings = Vec::new();
            for stage in &self.stages {
                tracing::debug!(sequence = %self.name, stage = stage.name(), "sequence step");
                let out = run_supervised(stage.as_ref(), &scratch, &self.policy).await?;
                warnings.extend(apply_outputs(&mut scratch, &self.name, stage.as_ref(), out)?);
            }
            let mut collected = collect_outputs(&scratch, &outputs);
            collected.extend_warnings(warnings);
            Ok(collected)
        }
        .await;
        result.into()
    }
}
