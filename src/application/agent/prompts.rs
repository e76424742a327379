use super::models::Plan;
use super::models::RunResult;
use crate::domain::types::{truncate_chars, HistoryEntry};

pub const PLANNER_SYSTEM_PROMPT: &str = "You are an autonomous engineering agent. \
You reach goals by creating small single-purpose tools (python or node programs) \
and running them in a sandbox, piping one tool's stdout into the next. \
Respond with a single JSON object and no other text.";

pub const ANSWER_SYSTEM_PROMPT: &str = "You summarize the outcome of an automated \
tool run for the person who asked for it. Answer in a short paragraph of plain \
language. Do not include JSON.";

const RESPONSE_SCHEMA: &str = r#"{
  "plan": "one-line description of the approach",
  "steps": ["ordered human-readable steps"],
  "createTools": [
    {
      "id": "optional-stable-id",
      "name": "tool name",
      "language": "python" or "node",
      "entry": "main.py",
      "purpose": "what the tool does",
      "files": { "main.py": "full source code" },
      "inputs": [{"name": "...", "type": "..."}],
      "outputs": [{"name": "...", "type": "..."}],
      "usage": "how to invoke it"
    }
  ],
  "run": [
    { "id": "tool id", "args": ["..."], "stdin": "optional input" }
  ]
}"#;

const HISTORY_ENTRIES: usize = 20;
const HISTORY_ENTRY_CHARS: usize = 500;
const ANSWER_STDOUT_CHARS: usize = 2_000;
const ANSWER_STDERR_CHARS: usize = 1_000;

/// Planning message embedding the goal, a bounded history window, and the
/// response contract.
pub fn planning_message(goal: &str, history: &[HistoryEntry], allow_network: bool) -> String {
    let mut message = String::new();
    message.push_str(&format!("Goal: {goal}\n\n"));
    if !history.is_empty() {
        message.push_str("Recent conversation:\n");
        let start = history.len().saturating_sub(HISTORY_ENTRIES);
        for entry in &history[start..] {
            message.push_str(&format!(
                "{}: {}\n",
                entry.role.as_str(),
                truncate_chars(&entry.content, HISTORY_ENTRY_CHARS)
            ));
        }
        message.push('\n');
    }
    message.push_str(&format!(
        "Network access inside the sandbox is {}.\n\n",
        if allow_network { "allowed" } else { "disabled" }
    ));
    message.push_str(
        "Existing tools can be reused by id in \"run\" without recreating them. \
Chain runs with ${last.stdout} or ${runs.<toolId>.stdout} placeholders in args or stdin.\n\n",
    );
    message.push_str(&format!(
        "Respond with JSON matching this schema:\n```json\n{RESPONSE_SCHEMA}\n```"
    ));
    message
}

/// Follow-up used when the first plan carried no actions.
pub fn refine_message() -> String {
    "Your plan contained no tools to create and nothing to run. \
Produce a concrete plan: list the tools to create under \"createTools\" \
(with complete source files) and the calls to make under \"run\", \
using the same JSON schema as before."
        .to_string()
}

/// Patch request for a failing tool.
pub fn patch_message(tool_id: &str, entry: &str, stderr: &str) -> String {
    format!(
        "The tool '{tool_id}' (entry file: {entry}) failed. Stderr:\n\n{stderr}\n\n\
Fix the tool. Respond with JSON of the form \
{{\"files\": {{\"relative/path\": \"full new file content\"}}}} \
containing every file that must change. No other text."
    )
}

/// Context for the final natural-language answer.
pub fn answer_message(goal: &str, plan: &Plan, last_run: Option<&RunResult>) -> String {
    let mut message = String::new();
    message.push_str(&format!("Goal: {goal}\n"));
    let description = plan.describe();
    if !description.is_empty() {
        message.push_str(&format!("Plan: {description}\n"));
    }
    match last_run {
        Some(run) => {
            message.push_str(&format!(
                "Last run: tool '{}' exited with code {}.\n",
                run.id,
                run.code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
            ));
            if let Some(stdout) = run.stdout.as_deref().filter(|s| !s.is_empty()) {
                message.push_str(&format!(
                    "Stdout:\n{}\n",
                    truncate_chars(stdout, ANSWER_STDOUT_CHARS)
                ));
            }
            if let Some(stderr) = run.stderr.as_deref().filter(|s| !s.is_empty()) {
                message.push_str(&format!(
                    "Stderr:\n{}\n",
                    truncate_chars(stderr, ANSWER_STDERR_CHARS)
                ));
            }
        }
        None => message.push_str("No tools were run.\n"),
    }
    message.push_str("Summarize what happened and what the result means.");
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MessageRole;

    #[test]
    fn planning_message_truncates_history_entries() {
        let history = vec![HistoryEntry::new(MessageRole::User, "y".repeat(800))];
        let message = planning_message("count things", &history, false);
        assert!(message.contains("Goal: count things"));
        assert!(message.contains("disabled"));
        assert!(!message.contains(&"y".repeat(600)));
        assert!(message.contains(&"y".repeat(500)));
    }

    #[test]
    fn planning_message_windows_to_twenty_entries() {
        let history: Vec<HistoryEntry> = (0..30)
            .map(|index| HistoryEntry::new(MessageRole::User, format!("turn-{index}")))
            .collect();
        let message = planning_message("goal", &history, true);
        assert!(!message.contains("turn-9\n"));
        assert!(message.contains("turn-10"));
        assert!(message.contains("turn-29"));
        assert!(message.contains("allowed"));
    }

    #[test]
    fn answer_message_bounds_run_excerpts() {
        let run = RunResult {
            id: "big".into(),
            args: Some(Vec::new()),
            code: Some(0),
            stdout: Some("o".repeat(5_000)),
            stderr: Some("e".repeat(5_000)),
            log_file: None,
            retry: None,
            reason: None,
            error: None,
        };
        let message = answer_message("goal", &Plan::default(), Some(&run));
        assert!(message.contains(&"o".repeat(2_000)));
        assert!(!message.contains(&"o".repeat(2_100)));
        assert!(message.contains(&"e".repeat(1_000)));
        assert!(!message.contains(&"e".repeat(1_100)));
    }
}
