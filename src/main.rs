//! Flowpilot 命令行入口
//!
//! 初始化日志、加载配置、运行一次任务，并把事件按 JSON Lines 打印到 stdout。
//!
//! 用法：
//!   flowpilot [--config PATH] [--max-steps N] [--cache-key KEY] [--replay] <task prompt...>
//!   flowpilot [--config PATH] --replay-key KEY
//!   flowpilot [--config PATH] --clear
//!   flowpilot [--config PATH] --list

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use flowpilot::config::{load_config, AppConfig};
use flowpilot::core::{Confirmation, Orchestrator, ReplayRequest, RunHandle, RunRequest};
use flowpilot::observability;
use flowpilot::react::FlowEvent;

#[derive(Parser, Debug)]
#[command(name = "flowpilot")]
#[command(about = "LLM-directed browser automation with deterministic replay")]
#[command(version)]
struct Cli {
    /// Task prompt (remaining words are joined with spaces)
    prompt: Vec<String>,

    /// Extra config file layered over config/default.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Step limit for this run
    #[arg(long)]
    max_steps: Option<usize>,

    /// Reuse a cacheKey (stored actions are loaded)
    #[arg(long)]
    cache_key: Option<String>,

    /// Approve the deterministic replay once the run completes
    #[arg(long)]
    replay: bool,

    /// Replay a stored flow without running the planner
    #[arg(long, conflicts_with_all = ["clear", "list", "prompt"])]
    replay_key: Option<String>,

    /// Delete all stored flows and execution logs
    #[arg(long, conflicts_with_all = ["list", "prompt"])]
    clear: bool,

    /// Print stored flows and execution logs as JSON lines
    #[arg(long, conflicts_with = "prompt")]
    list: bool,
}

/// 打印事件直到通道关闭；返回终止事件
async fn drain(handle: &mut RunHandle) -> anyhow::Result<Option<FlowEvent>> {
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if event.is_terminal() {
            last = Some(event);
        }
    }
    Ok(last)
}

async fn watch_ctrl_c(handle: &RunHandle) {
    let token = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = Cli::parse();
    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let orchestrator = Orchestrator::from_config(&cfg)
        .await
        .context("Failed to create orchestrator")?;

    if args.clear {
        let cleared = orchestrator.clear().await?;
        println!("{}", serde_json::to_string(&cleared)?);
        return Ok(());
    }

    if args.list {
        for flow in orchestrator.list_flows(50).await? {
            println!("{}", serde_json::to_string(&flow)?);
        }
        for record in orchestrator.list_executions(50).await? {
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(());
    }

    if let Some(key) = args.replay_key {
        let mut handle = orchestrator
            .submit_replay(ReplayRequest { cache_key: Some(key), flow_state: None })
            .await?;
        watch_ctrl_c(&handle).await;
        drain(&mut handle).await?;
        return Ok(());
    }

    if args.prompt.is_empty() {
        bail!("a task prompt is required (see --help)");
    }
    let mut handle = orchestrator
        .submit_run(RunRequest {
            task_prompt: args.prompt.join(" "),
            cache_key: args.cache_key,
            max_steps: args.max_steps,
            session_id: None,
        })
        .await?;
    watch_ctrl_c(&handle).await;

    let Some(FlowEvent::ConfirmationRequired { cache_key, .. }) = drain(&mut handle).await? else {
        return Ok(());
    };

    match orchestrator.confirm(&cache_key, args.replay).await? {
        Confirmation::Replay(mut replay) => {
            watch_ctrl_c(&replay).await;
            drain(&mut replay).await?;
        }
        Confirmation::Cleared { cache_key } => {
            tracing::info!(cache_key = %cache_key, "replay declined, state cleared");
        }
    }
    Ok(())
}
