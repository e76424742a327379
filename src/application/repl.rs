use crate::application::agent::{Agent, Plan, Reporter, RunOutcome, RunResult};
use crate::application::memory::Memory;
use crate::infrastructure::sandbox::StreamKind;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("stdin/stdout I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prints progress to the terminal as it happens; tool stdout/stderr pass
/// through unmodified.
pub struct TerminalReporter;

impl Reporter for TerminalReporter {
    fn plan(&self, plan: &Plan) {
        let description = plan.describe();
        if !description.is_empty() {
            println!("plan: {description}");
        }
    }

    fn create_tools(&self, ids: &[String]) {
        if !ids.is_empty() {
            println!("created tools: {}", ids.join(", "));
        }
    }

    fn run_start(&self, id: &str) {
        println!("-> running {id}");
    }

    fn run_chunk(&self, _id: &str, stream: StreamKind, chunk: &str) {
        match stream {
            StreamKind::Stdout => {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            }
            StreamKind::Stderr => {
                eprint!("{chunk}");
                let _ = std::io::stderr().flush();
            }
        }
    }

    fn run_end(&self, result: &RunResult) {
        match result.code {
            Some(0) => println!("<- {} finished", result.id),
            Some(code) => println!("<- {} exited with code {code}", result.id),
            None => println!("<- {}: {}", result.id, result.error.as_deref().unwrap_or("no run")),
        }
    }

    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

/// One-shot goal execution used by `run --goal` and piped stdin.
pub async fn run_once(agent: &Agent, memory: &mut Memory, goal: &str) -> RunOutcome {
    let outcome = agent.run(goal, memory, Arc::new(TerminalReporter)).await;
    print_outcome(&outcome);
    outcome
}

/// Interactive REPL with `/exit`, `/help`, and `/status` commands.
pub async fn run_interactive(agent: &Agent, memory: &mut Memory) -> Result<(), ReplError> {
    println!("boxedin agent ready. Type a goal, or /help for commands.");
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" => break,
            "/help" => {
                println!("/exit    leave the session");
                println!("/status  show conversation, tool, and run counters");
                println!("Anything else is treated as a goal for the agent.");
            }
            "/status" => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status_json(memory))
                        .unwrap_or_else(|_| "{}".to_string())
                );
            }
            goal => {
                info!(goal, "Running goal from REPL");
                let outcome = agent.run(goal, memory, Arc::new(TerminalReporter)).await;
                match &outcome.answer {
                    Some(answer) => println!("\n{answer}"),
                    None => println!("\n(no answer was produced)"),
                }
            }
        }
    }
    Ok(())
}

pub fn status_json(memory: &Memory) -> serde_json::Value {
    json!({
        "conversations": memory.history.len(),
        "tools": memory.tools.len(),
        "lastRun": memory.runs.last().map(|run| run.ts),
    })
}

fn print_outcome(outcome: &RunOutcome) {
    match serde_json::to_string_pretty(outcome) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => {
            if let Some(answer) = &outcome.answer {
                println!("{answer}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tooling::ToolStore;

    #[test]
    fn status_json_reports_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ToolStore::new(dir.path());
        let mut memory = Memory::load(dir.path(), &store).expect("load");
        assert_eq!(status_json(&memory)["conversations"], 0);
        assert_eq!(status_json(&memory)["lastRun"], serde_json::Value::Null);

        memory.runs.push(crate::domain::types::RunRecord {
            goal: "g".into(),
            steps: Vec::new(),
            result: json!({}),
            ts: 7,
        });
        assert_eq!(status_json(&memory)["lastRun"], 7);
    }
}
