//! Fan-Out / Fan-In 执行器
//!
//! 对输入序列中的每一项运行同一个 Stage，最多 max_concurrency 个并发（Semaphore 控制），
//! 结果按输入顺序重组。任一分支 Fatal（含重试耗尽）即整体失败：
//! 其余在途分支随 FuturesUnordered 一起被丢弃，已完成分支的结果也不写回。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::{ContextError, FanOutError, RetryPolicy, StageError};
use crate::flow::context::Context;
use crate::flow::stage::{
    apply_outputs, collect_outputs, dedup, run_supervised, Outcome, Outputs, Stage, Supervision,
};
use crate::flow::types::Field;

/// Fan-In 结果：按输入顺序排列的收集值与各分支的子上下文
#[derive(Debug)]
pub struct FanIn {
    pub values: Vec<Value>,
    pub children: Vec<Context>,
}

pub struct FanOut {
    name: String,
    stage: Arc<dyn Stage>,
    /// 输入序列字段
    items: &'static str,
    /// 分支内单个元素的字段名
    item: &'static str,
    /// 分支 Stage 产出的、需要按序收集的字段
    collect: &'static str,
    /// 收集后的序列字段
    output: &'static str,
    max_concurrency: usize,
    policy: RetryPolicy,
}

impl FanOut {
    pub fn over<I, O>(
        name: impl Into<String>,
        stage: impl Stage + 'static,
        items: Field<Vec<I>>,
        item: Field<I>,
        collect: Field<O>,
        output: Field<Vec<O>>,
    ) -> Self {
        Self {
            name: name.into(),
            stage: Arc::new(stage),
            items: items.name(),
            item: item.name(),
            collect: collect.name(),
            output: output.name(),
            max_concurrency: 4,
            policy: RetryPolicy::default(),
        }
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 分支 Stage 除收集字段外的其它输出，经屏障合并后整体写回
    fn side_outputs(&self) -> Vec<&'static str> {
        self.stage
            .outputs()
            .into_iter()
            .filter(|f| *f != self.collect)
            .collect()
    }

    /// 分支共享的输入字段（不含逐项注入的元素字段）
    fn shared_inputs(&self) -> Vec<&'static str> {
        self.stage
            .inputs()
            .into_iter()
            .filter(|f| *f != self.item)
            .collect()
    }

    pub async fn execute(&self, ctx: &Context) -> Result<FanIn, FanOutError> {
        let items = match ctx.get_raw(self.items) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(FanOutError::Input(ContextError::Decode {
                    field: self.items.to_string(),
                    reason: format!("expected a sequence, found {other}"),
                }))
            }
            None => return Err(ContextError::MissingField(self.items.to_string()).into()),
        };
        let total = items.len();
        let shared = self.shared_inputs();
        let side = self.side_outputs();
        let sem = Semaphore::new(self.max_concurrency);
        let sem = &sem;
        let mut tasks = FuturesUnordered::new();

        for (index, item) in items.into_iter().enumerate() {
            let mut child = ctx.fork(&shared);
            child.seed_raw(self.item, item);
            let side = &side;
            tasks.push(async move {
                let result: Result<(Value, Context), StageError> = async {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|_| StageError::fatal("fan-out semaphore closed"))?;
                    tracing::debug!(node = %self.name, branch = index + 1, total, "branch started");
                    let mut outputs =
                        run_supervised(self.stage.as_ref(), &child, &self.policy).await?;
                    let collected = outputs.take_raw(self.collect).ok_or_else(|| {
                        StageError::fatal(format!(
                            "stage '{}' did not produce '{}'",
                            self.stage.name(),
                            self.collect
                        ))
                    })?;
                    for field in side {
                        child.declare_owner(field, &self.name)?;
                    }
                    apply_outputs(&mut child, &self.name, self.stage.as_ref(), outputs)?;
                    Ok((collected, child))
                }
                .await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<(Value, Context)>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = tasks.next().await {
            match result {
                Ok(done) => slots[index] = Some(done),
                Err(error) => {
                    tracing::warn!(
                        node = %self.name,
                        branch = index + 1,
                        total,
                        error = %error,
                        "branch failed, cancelling siblings"
                    );
                    return Err(FanOutError::Branch {
                        branch: index + 1,
                        total,
                        error,
                    });
                }
            }
        }

        let (values, children): (Vec<Value>, Vec<Context>) = slots.into_iter().flatten().unzip();
        Ok(FanIn { values, children })
    }
}

#[async_trait]
impl Stage for FanOut {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<&'static str> {
        let mut inputs = vec![self.items];
        inputs.extend(self.shared_inputs());
        dedup(inputs)
    }

    fn outputs(&self) -> Vec<&'static str> {
        let mut outputs = vec![self.output];
        outputs.extend(self.side_outputs());
        dedup(outputs)
    }

    fn supervision(&self) -> Supervision {
        Supervision::SelfManaged
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        let result: Result<Outputs, StageError> = async {
            let fan_in = self.execute(ctx).await?;
            let mut merged = Context::new();
            merged.merge(fan_in.children).map_err(FanOutError::Merge)?;
            let mut outputs = collect_outputs(&merged, &self.side_outputs());
            outputs.insert_raw(self.output, Value::Array(fan_in.values));
            Ok(outputs)
        }
        .await;
        result.into()
    }
}
