//! `chatloop chat`: Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use chatloop_agent::{LoopSummary, StopReason, TaskLoop, TaskLoopOptions};
use chatloop_config::AppConfig;
use chatloop_core::bridge::MessageBridge;
use chatloop_core::event::EventBus;
use chatloop_core::message::Conversation;
use chatloop_core::tool::ToolRegistry;
use chatloop_providers::{BridgeHost, OpenAiCompatFactory};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

pub async fn run(
    message: Option<String>,
    max_epochs: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Fail early with setup instructions when no key is configured
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    CHATLOOP_API_KEY = 'sk-...'");
        eprintln!("    OPENAI_API_KEY   = 'sk-...'");
        eprintln!();
        eprintln!("  Or add `api_key` to the current model in:");
        eprintln!("    {}", AppConfig::config_path().display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let (bridge, outbound) = MessageBridge::new();
    let bridge = Arc::new(bridge);
    let host = BridgeHost::new(bridge.clone(), Arc::new(OpenAiCompatFactory)).spawn(outbound);

    let event_bus = Arc::new(EventBus::default());
    let mut events = event_bus.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(event = ?event, "Domain event");
        }
    });

    let task_loop = build_task_loop(bridge, &config, event_bus);
    if let Some(max) = max_epochs {
        task_loop.set_max_epochs(max);
    }

    let mut conv = Conversation::new();

    if let Some(msg) = message {
        // Single message mode
        let summary = run_turn(&task_loop, &mut conv, msg).await;
        report(&summary, &conv);
    } else {
        // Interactive mode
        println!();
        println!("  chatloop — Interactive Mode");
        println!();
        if let Some(model) = config.models.get(config.current_model) {
            println!("  Model:     {} ({})", model.id, model.model);
            println!("  Endpoint:  {}", model.base_url);
        }
        println!("  Epochs:    {}", task_loop.max_epochs());
        println!();
        println!("  Type your message and press Enter.");
        println!("  Ctrl+C stops a running reply; 'exit' or Ctrl+C at the prompt quits.");
        println!();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("  You > ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else { break };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if input == "exit" || input == "quit" {
                break;
            }

            println!();
            let summary = run_turn(&task_loop, &mut conv, input.to_string()).await;
            report(&summary, &conv);
            println!();
        }

        println!();
        println!("  Goodbye!");
        println!();
    }

    host.abort();
    event_log.abort();
    Ok(())
}

fn build_task_loop(bridge: Arc<MessageBridge>, config: &AppConfig, event_bus: Arc<EventBus>) -> TaskLoop {
    let options = TaskLoopOptions {
        max_epochs: config.task_loop.max_epochs,
        max_json_parse_retry: config.task_loop.max_json_parse_retry,
    };

    let mut task_loop = TaskLoop::new(
        bridge,
        Arc::new(ToolRegistry::new()),
        Arc::new(config.clone()),
        options,
    )
    .with_tool_call_policy(config.task_loop.tool_call_policy)
    .with_event_bus(event_bus);

    task_loop.register_on_chunk(|chunk, _| {
        if let Some(text) = &chunk.content {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        for delta in &chunk.tool_calls {
            if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
                eprintln!("\n  [tool] {name}");
            }
        }
    });
    task_loop.register_on_error(|report| {
        eprintln!("\n  [error: {:?}] {}", report.state, report.message);
    });
    task_loop.register_on_epoch(|epoch| {
        if epoch > 0 {
            debug!(epoch, "Continuing after tool results");
        }
    });

    task_loop
}

/// Run one user turn; Ctrl-C aborts the in-flight exchange.
async fn run_turn(task_loop: &TaskLoop, conv: &mut Conversation, input: String) -> LoopSummary {
    let turn = task_loop.start(conv, input);
    tokio::pin!(turn);

    loop {
        tokio::select! {
            summary = &mut turn => return summary,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n  [interrupted]");
                task_loop.abort();
            }
        }
    }
}

fn report(summary: &LoopSummary, conv: &Conversation) {
    println!();
    match summary.stop_reason {
        StopReason::ParseRetryExhausted => {
            if let Some(last) = conv.last() {
                eprintln!("  {}", last.text());
            }
        }
        StopReason::EpochBudgetExhausted => {
            eprintln!(
                "  Stopped after {} exchanges without a final answer.",
                summary.exchanges
            );
        }
        // Errors were already printed by the error hook.
        _ => {}
    }
    debug!(exchanges = summary.exchanges, stop_reason = ?summary.stop_reason, "Turn finished");
}
