//! Scout - Rust 科研助手
//!
//! 入口：解析命令行、加载配置、组装协作方与流程，运行并导出上下文快照。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use clap::Parser;
use serde_json::{Map, Value};

use scout::config::{load_config, Credentials};
use scout::flow::{Context, FlowRunner, RunReport};
use scout::research::fields::{
    ANSWER, ASSESSMENT_SUMMARY, NOVELTY, PLAN_PATH, QUESTION, RESEARCH_IDEA,
};
use scout::research::{Collaborators, ConsoleFeedback, FlowFactory, FlowKind, Review};

#[derive(Parser, Debug)]
#[command(name = "scout", version, about = "From a research question to a novelty-checked research plan")]
struct Args {
    /// 研究问题（idea-generation / full-pipeline / complete-assistant / qa 需要）
    question: Option<String>,

    /// idea-generation | rag | planning | full-pipeline | complete-assistant | qa
    #[arg(long)]
    flow: Option<String>,

    /// 额外的配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 作为初始输入的上下文快照（JSON），用于单独运行 rag / planning
    #[arg(long)]
    context: Option<PathBuf>,

    /// 用 LLM 评审代替终端人工评审
    #[arg(long)]
    non_interactive: bool,
}

async fn initial_context(args: &Args, seeds: &[&'static str]) -> anyhow::Result<Context> {
    let mut ctx = match &args.context {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read context snapshot {}", path.display()))?;
            let snapshot: Map<String, Value> = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid context snapshot {}", path.display()))?;
            Context::from_snapshot(snapshot).carry(seeds)
        }
        None => Context::new(),
    };
    if let Some(question) = &args.question {
        if seeds.contains(&QUESTION.name()) {
            ctx.seed(QUESTION, question)?;
        } else {
            tracing::warn!("question ignored: this flow starts from a context snapshot");
        }
    }
    if let Some(missing) = seeds.iter().find(|f| !ctx.contains(f)) {
        bail!(
            "missing initial field '{missing}': pass a question or --context <snapshot.json> providing {}",
            seeds.join(", ")
        );
    }
    Ok(ctx)
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    let ctx = &report.context;
    println!("\n=== {} finished ({} node(s)) ===", report.flow, report.visited.len());
    if let Some(idea) = ctx.get_opt(RESEARCH_IDEA)? {
        println!("\n{}", idea.render());
    }
    if let Some(novelty) = ctx.get_opt(NOVELTY)? {
        println!("\n{}", novelty.summary());
    }
    if let Some(assessment) = ctx.get_opt(ASSESSMENT_SUMMARY)? {
        println!("{} (confidence {:.2})", assessment.summary, assessment.confidence);
    }
    if let Some(path) = ctx.get_opt(PLAN_PATH)? {
        println!("\nResearch plan written to {path}");
    }
    if let Some(answer) = ctx.get_opt(ANSWER)? {
        println!("\n{answer}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scout::observability::init();
    let args = Args::parse();

    let config = load_config(args.config.clone()).context("Failed to load configuration")?;
    let kind: FlowKind = args
        .flow
        .as_deref()
        .unwrap_or(&config.app.flow)
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let review = if config.app.interactive && !args.non_interactive {
        Review::Human(Arc::new(ConsoleFeedback))
    } else {
        Review::Automated
    };
    let collaborators = Collaborators::from_config(&config, &Credentials::from_env(), review)
        .context("Failed to set up collaborators")?;
    let output_dir = config.app.output_dir.clone();
    let factory = FlowFactory::new(config, collaborators);
    let flow = factory
        .build(kind)
        .with_context(|| format!("Failed to build flow '{kind}'"))?;

    let ctx = initial_context(&args, flow.seeds()).await?;
    let runner = FlowRunner::new(factory.policy().clone());
    let report = flow
        .run(&runner, ctx)
        .await
        .with_context(|| format!("Flow '{kind}' failed"))?;

    print_report(&report)?;

    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let snapshot_path = output_dir.join(format!("{}_context.json", kind.as_str().replace('-', "_")));
    let snapshot = serde_json::to_string_pretty(&report.context.snapshot())
        .context("Failed to serialize context snapshot")?;
    tokio::fs::write(&snapshot_path, snapshot)
        .await
        .with_context(|| format!("Failed to write {}", snapshot_path.display()))?;
    println!("Context snapshot saved to {}", snapshot_path.display());

    Ok(())
}
