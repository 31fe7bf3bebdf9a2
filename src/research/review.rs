//! 评审者：校验循环中扮演 critic 的 Stage
//!
//! LlmCritic 做一次轻量 LLM 调用，回复为 "OK"（可跟标点，不可跟字母）或为空即通过，否则整段回复作为修改意见。
//! HumanCritic 把产物交给 FeedbackChannel（控制台或脚本），等待人给出结论，不设超时。

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::StageError;
use crate::flow::{Context, Field, Outcome, Outputs, Stage, Supervision, ValidationVerdict};
use crate::llm::{LlmClient, Message};

/// 由 Context 生成评审提示词 / 展示文本
pub type PromptFn = fn(&Context) -> Result<Vec<Message>, StageError>;
pub type RenderFn = fn(&Context) -> Result<String, StageError>;

/// 解析自动评审的回复；"Okay, but ..." 之类不算通过
pub fn parse_verdict(reply: &str) -> ValidationVerdict {
    let reply = reply.trim();
    if reply.is_empty() || is_ok_token(reply) {
        ValidationVerdict::approved()
    } else {
        ValidationVerdict::rejected(reply)
    }
}

fn is_ok_token(reply: &str) -> bool {
    let mut chars = reply.chars();
    let head: String = chars.by_ref().take(2).collect();
    head.eq_ignore_ascii_case("ok") && chars.next().map_or(true, |c| !c.is_alphabetic())
}

pub struct LlmCritic {
    name: &'static str,
    llm: Arc<dyn LlmClient>,
    inputs: Vec<&'static str>,
    verdict: Field<ValidationVerdict>,
    prompt: PromptFn,
}

impl LlmCritic {
    pub fn new(
        name: &'static str,
        llm: Arc<dyn LlmClient>,
        inputs: &[&'static str],
        verdict: Field<ValidationVerdict>,
        prompt: PromptFn,
    ) -> Self {
        Self {
            name,
            llm,
            inputs: inputs.to_vec(),
            verdict,
            prompt,
        }
    }

    async fn critique(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let messages = (self.prompt)(ctx)?;
        let reply = self.llm.complete(&messages).await?;
        let verdict = parse_verdict(&reply);
        tracing::debug!(critic = self.name, approved = verdict.is_approved(), "critique received");
        Ok(Outputs::new().with(self.verdict, &verdict)?)
    }
}

#[async_trait]
impl Stage for LlmCritic {
    fn name(&self) -> &str {
        self.name
    }

    fn inputs(&self) -> Vec<&'static str> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![self.verdict.name()]
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.critique(ctx).await.into()
    }
}

/// 人工反馈协作方：present(artifact) -> ValidationVerdict
#[async_trait]
pub trait FeedbackChannel: Send + Sync {
    async fn present(&self, artifact: &str) -> Result<ValidationVerdict, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Approve,
    Refine,
    Feedback,
}

pub fn parse_choice(input: &str) -> Option<Choice> {
    match input.trim().to_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(Choice::Approve),
        "r" | "refine" => Some(Choice::Refine),
        "f" | "feedback" => Some(Choice::Feedback),
        _ => None,
    }
}

/// 逗号分隔的改进方向
pub fn parse_areas(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// 控制台交互：在后台线程阻塞读取 stdin
#[derive(Debug, Default)]
pub struct ConsoleFeedback;

impl ConsoleFeedback {
    async fn ask(prompt: &str) -> Result<String, StageError> {
        print!("{prompt}");
        io::stdout()
            .flush()
            .map_err(|e| StageError::fatal(format!("stdout: {e}")))?;
        let line = tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            io::stdin().read_line(&mut input).map(|n| (n, input))
        })
        .await
        .map_err(|e| StageError::fatal(format!("console reader: {e}")))?
        .map_err(|e| StageError::fatal(format!("stdin: {e}")))?;
        match line {
            (0, _) => Err(StageError::fatal("stdin closed while waiting for feedback")),
            (_, input) => Ok(input.trim().to_string()),
        }
    }
}

#[async_trait]
impl FeedbackChannel for ConsoleFeedback {
    async fn present(&self, artifact: &str) -> Result<ValidationVerdict, StageError> {
        println!("\n{artifact}\n");
        println!("1. Approve (a)\n2. Request refinement (r)\n3. Give specific feedback (f)");
        loop {
            let choice = Self::ask("\nYour choice: ").await?;
            match parse_choice(&choice) {
                Some(Choice::Approve) => {
                    return Ok(ValidationVerdict::Approved {
                        feedback: "Approved by user".to_string(),
                    })
                }
                Some(Choice::Refine) => {
                    let suggestions = Self::ask("Refinement suggestions (optional): ").await?;
                    let mut feedback = "User requested general refinement".to_string();
                    if !suggestions.is_empty() {
                        feedback.push_str(&format!(" with suggestions: {suggestions}"));
                    }
                    return Ok(ValidationVerdict::rejected(feedback));
                }
                Some(Choice::Feedback) => {
                    let mut feedback = Self::ask("Your feedback: ").await?;
                    while feedback.is_empty() {
                        feedback = Self::ask("Feedback cannot be empty, try again: ").await?;
                    }
                    let areas = Self::ask("Areas to improve (comma-separated, optional): ").await?;
                    return Ok(ValidationVerdict::Rejected {
                        feedback,
                        areas_to_improve: parse_areas(&areas),
                    });
                }
                None => println!("Please type 'approve', 'refine' or 'feedback'"),
            }
        }
    }
}

/// 预先排好的结论序列；用完后一律通过
#[derive(Debug, Default)]
pub struct ScriptedFeedback {
    verdicts: Mutex<VecDeque<ValidationVerdict>>,
    presented: Mutex<Vec<String>>,
}

impl ScriptedFeedback {
    pub fn new(verdicts: Vec<ValidationVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            presented: Mutex::new(Vec::new()),
        }
    }

    /// 已展示过的产物
    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FeedbackChannel for ScriptedFeedback {
    async fn present(&self, artifact: &str) -> Result<ValidationVerdict, StageError> {
        if let Ok(mut presented) = self.presented.lock() {
            presented.push(artifact.to_string());
        }
        let next = self.verdicts.lock().ok().and_then(|mut v| v.pop_front());
        Ok(next.unwrap_or_else(ValidationVerdict::approved))
    }
}

pub struct HumanCritic {
    name: &'static str,
    channel: Arc<dyn FeedbackChannel>,
    inputs: Vec<&'static str>,
    verdict: Field<ValidationVerdict>,
    render: RenderFn,
}

impl HumanCritic {
    pub fn new(
        name: &'static str,
        channel: Arc<dyn FeedbackChannel>,
        inputs: &[&'static str],
        verdict: Field<ValidationVerdict>,
        render: RenderFn,
    ) -> Self {
        Self {
            name,
            channel,
            inputs: inputs.to_vec(),
            verdict,
            render,
        }
    }

    async fn review(&self, ctx: &Context) -> Result<Outputs, StageError> {
        let artifact = (self.render)(ctx)?;
        let verdict = self.channel.present(&artifact).await?;
        Ok(Outputs::new().with(self.verdict, &verdict)?)
    }
}

#[async_trait]
impl Stage for HumanCritic {
    fn name(&self) -> &str {
        self.name
    }

    fn inputs(&self) -> Vec<&'static str> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<&'static str> {
        vec![self.verdict.name()]
    }

    fn supervision(&self) -> Supervision {
        Supervision::Untimed
    }

    async fn run(&self, ctx: &Context) -> Outcome {
        self.review(ctx).await.into()
    }
}
