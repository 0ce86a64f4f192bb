//! Planloom 命令行入口：标准输入上的需求对话 REPL
//!
//! 普通输入作为一轮对话发送；以 `/` 开头的是命令，见 `HELP`。

use std::path::PathBuf;

use anyhow::Context;
use planloom::core::EngineEvent;
use planloom::create_engine_builder;
use planloom::plan::{analyze_plan, to_json, to_markdown};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  /plan        show the current plan as markdown
  /json        show the current plan as JSON
  /analyze     show the dependency analysis of the current plan
  /regenerate  regenerate the plan from the gathered requirements
  /run         execute the current plan autonomously
  /reset       reset the conversation to IDLE
  /health      check every registered provider
  /quit        flush pending saves and exit";

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn print_event(ev: &EngineEvent) {
    match ev {
        EngineEvent::Progress {
            iteration,
            max_iterations,
            completed_tasks,
            total_tasks,
            combo_multiplier,
            ..
        } => println!(
            "[{}/{}] {}/{} tasks done, combo x{:.1}",
            iteration, max_iterations, completed_tasks, total_tasks, combo_multiplier
        ),
        EngineEvent::Completion { success, iterations, status } => {
            println!("loop finished: {} after {} iterations (success: {})", status, iterations, success)
        }
        EngineEvent::PlanGenerated { total_phases, .. } => {
            println!("plan generated with {} phases", total_phases)
        }
        EngineEvent::ContextSummarized { tokens_before, tokens_after, .. } => {
            tracing::info!(tokens_before, tokens_after, "context summarized")
        }
        EngineEvent::StateTransition { from_state, to_state, .. } => {
            tracing::debug!(from = %from_state, to = %to_state, "state transition")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    planloom::observability::init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = create_engine_builder(parse_config_arg())
        .with_events(tx)
        .build()
        .context("Failed to build engine")?;

    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            print_event(&ev);
        }
    });

    let conversations = engine.conversations.clone();
    let id = conversations.create_conversation(None).await;
    println!("{} ready. Describe what you want to build; type /help for commands.", engine.config.app.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/plan" => match conversations.plan(&id).await {
                Ok(plan) => println!("{}", to_markdown(&plan)),
                Err(e) => println!("error: {}", e),
            },
            "/json" => match conversations.plan(&id).await {
                Ok(plan) => println!("{}", to_json(&plan)?),
                Err(e) => println!("error: {}", e),
            },
            "/analyze" => match conversations.plan(&id).await {
                Ok(plan) => {
                    let analysis = analyze_plan(&plan);
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
                Err(e) => println!("error: {}", e),
            },
            "/regenerate" => match conversations.regenerate_plan(&id, None).await {
                Ok(plan) => println!("{}", to_markdown(&plan)),
                Err(e) => println!("error: {}", e),
            },
            "/run" => match conversations.plan(&id).await {
                Ok(plan) => match engine.autonomous.run(Some(plan), None).await {
                    Ok(report) => {
                        if let Err(e) = conversations.store_plan(&id, report.plan.clone()).await {
                            tracing::warn!(error = %e, "failed to store executed plan");
                        }
                        println!(
                            "{}: {}/{} tasks, achievements: {}",
                            report.status,
                            report.completed_tasks,
                            report.total_tasks,
                            report.achievements.join(", ")
                        );
                    }
                    Err(e) => println!("error: {}", e),
                },
                Err(e) => println!("error: {}", e),
            },
            "/reset" => match conversations.reset(&id).await {
                Ok(()) => println!("conversation reset"),
                Err(e) => println!("error: {}", e),
            },
            "/health" => {
                for health in engine.registry.check_all_health().await {
                    println!("{:<10} {}", health.id, if health.healthy { "ok" } else { "unavailable" });
                }
            }
            cmd if cmd.starts_with('/') => println!("unknown command {}; type /help", cmd),
            text => match conversations.send_message(&id, text, None).await {
                Ok(turn) => {
                    println!("{}", turn.reply);
                    tracing::debug!(state = %turn.state, plan_generated = turn.plan_generated, "turn complete");
                }
                Err(e) => println!("error: {}", e),
            },
        }
    }

    conversations.flush().await.context("Failed to flush conversations")?;
    Ok(())
}
