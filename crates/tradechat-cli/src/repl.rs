use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use tradechat_core::models::{ErrorLevel, ErrorStore};
use tradechat_core::{ChatController, ChatError, DecisionResolution, Message, Role, TranscriptEvent};

const HELP: &str = "Commands: /approve, /decline, /clear, /errors, /help, /quit";

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => return,
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    println!("{}> {}", label, message.content);

    if message.metadata.decision_id.is_some()
        && message.metadata.extra.get("requires_approval").and_then(|v| v.as_bool()) == Some(true)
    {
        println!("  (type /approve or /decline)");
    }
}

pub fn print_history(controller: &ChatController) {
    for message in controller.store().all().iter() {
        print_message(message);
    }
}

/// Print transcript changes as they happen: finished messages in full,
/// streaming ones as stage updates.
pub fn spawn_printer(controller: ChatController) -> JoinHandle<()> {
    let mut events = controller.store().subscribe();
    tokio::spawn(async move {
        let mut last_stage: Option<String> = None;
        loop {
            let id = match events.recv().await {
                Ok(TranscriptEvent::Appended { id }) | Ok(TranscriptEvent::Replaced { id }) => id,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transcript printer fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(message) = controller.store().get(&id) else {
                continue;
            };

            if message.is_streaming() {
                if let Some(event) = message.metadata.progress.last()
                    && last_stage.as_deref() != Some(event.stage.as_str())
                {
                    println!(
                        "  ... {} ({}%)",
                        event.message,
                        message.metadata.progress_percent.unwrap_or(0)
                    );
                    last_stage = Some(event.stage.clone());
                }
                continue;
            }
            last_stage = None;
            print_message(&message);
        }
    })
}

fn print_errors(store: &ErrorStore) {
    let entries = store.get_all_entries();
    if entries.is_empty() {
        println!("No warnings or errors.");
        return;
    }
    for entry in entries {
        let level = match entry.level {
            ErrorLevel::Warning => "WARN",
            ErrorLevel::Error => "ERROR",
        };
        println!(
            "{} {:5} {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            level,
            entry.target,
            entry.message
        );
    }
}

async fn resolve(controller: &ChatController, approved: bool) {
    let Some(decision) = controller.pending_decision() else {
        println!("No trade is waiting for confirmation.");
        return;
    };
    if controller.resolve_decision(&decision.id, approved).await == DecisionResolution::NotPending {
        println!("That trade was already resolved.");
    }
}

/// Read stdin line by line until `/quit` or end of input.
pub async fn run(controller: &ChatController, errors: &ErrorStore) -> Result<()> {
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/approve" => resolve(controller, true).await,
            "/decline" => resolve(controller, false).await,
            "/clear" => {
                controller.clear_conversation().await;
                println!("Conversation cleared.");
            }
            "/errors" => print_errors(errors),
            text => match controller.send(text).await {
                Ok(_) => {}
                Err(ChatError::RequestInFlight) => println!("Still answering the previous message."),
                // Already shown in the transcript
                Err(ChatError::Session(_)) => {}
                Err(e) => println!("{}", e),
            },
        }
    }

    Ok(())
}
