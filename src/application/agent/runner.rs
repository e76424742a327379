use super::models::{Plan, RunCall, RunOutcome, RunResult, ToolSpec};
use super::parser::parse_plan;
use super::prompts;
use super::repair;
use super::reporter::Reporter;
use super::template::TemplateContext;
use crate::application::memory::Memory;
use crate::application::tooling::ToolStore;
use crate::domain::types::{now_ms, ChatMessage, MessageRole, ToolManifest};
use crate::infrastructure::model::{CompletionRequest, PlanGenerator};
use crate::infrastructure::sandbox::{RunRequest, Sandbox};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PLAN_TEMPERATURE: f32 = 0.2;
const REFINE_TEMPERATURE: f32 = 0.3;

/// Orchestrates one goal: planning, tool materialization, chained sandbox
/// runs, bounded self-repair, and persistence. Never returns an error; every
/// failure becomes data in the outcome.
pub struct Agent {
    provider: Arc<dyn PlanGenerator>,
    store: ToolStore,
    sandbox: Sandbox,
    allow_network: bool,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn PlanGenerator>,
        store: ToolStore,
        sandbox: Sandbox,
        allow_network: bool,
    ) -> Self {
        Self {
            provider,
            store,
            sandbox,
            allow_network,
        }
    }

    pub async fn run(
        &self,
        goal: &str,
        memory: &mut Memory,
        reporter: Arc<dyn Reporter>,
    ) -> RunOutcome {
        info!(goal, "Agent run started");
        self.ensure_directories();
        match self.store.load() {
            Ok(tools) => memory.tools = tools,
            Err(err) => warn!(%err, "Tool catalog scan failed; using persisted summaries"),
        }
        memory.add_history(MessageRole::User, goal);

        let plan = self.generate_plan(goal, memory).await;
        reporter.plan(&plan);
        debug!(
            tools_planned = plan.create_tools.len(),
            calls_planned = plan.run.len(),
            "Plan accepted"
        );

        let created = self.materialize_tools(&plan.create_tools, memory, reporter.as_ref());

        let mut context = TemplateContext::default();
        let mut previous_success_stdout = String::new();
        let mut runs = Vec::with_capacity(plan.run.len());
        for call in &plan.run {
            let Some(manifest) = memory.tools.get(&call.id).cloned() else {
                warn!(tool = %call.id, "Planned tool is not in the catalog");
                let result = RunResult::missing(&call.id);
                context.record(&result);
                runs.push(result);
                continue;
            };
            let result = self
                .execute_call(&manifest, call, &context, &previous_success_stdout, &reporter)
                .await;
            if result.succeeded() {
                previous_success_stdout = result.stdout.clone().unwrap_or_default();
            }
            context.record(&result);
            runs.push(result);
        }

        let answer = self.compose_answer(goal, &plan, runs.last()).await;

        let outcome = RunOutcome {
            goal: goal.to_string(),
            plan: plan.plan.clone(),
            steps: plan.steps.clone(),
            created,
            runs,
            answer,
        };
        self.persist(&outcome, memory, reporter.as_ref());
        reporter.result(&outcome);
        reporter.done();
        info!(goal, runs = outcome.runs.len(), "Agent run finished");
        outcome
    }

    fn ensure_directories(&self) {
        for dir in [
            self.store.root().to_path_buf(),
            self.sandbox.root().join("runs"),
        ] {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(path = %dir.display(), %err, "Failed to prepare sandbox directory");
            }
        }
    }

    async fn generate_plan(&self, goal: &str, memory: &Memory) -> Plan {
        let tools_description = ToolStore::to_prompt(&memory.tools);
        let history = memory.summarize_history_default();
        let planning = prompts::planning_message(goal, &history, self.allow_network);

        let first = self
            .complete_plan(vec![ChatMessage::new(MessageRole::User, planning.clone())], PLAN_TEMPERATURE, &tools_description)
            .await;
        let plan = match first {
            Some(plan) if !plan.is_empty() => return plan,
            Some(plan) => plan,
            None => Plan::default(),
        };

        // One refinement attempt; keep the original plan unless the second
        // response parses.
        let refined = self
            .complete_plan(
                vec![
                    ChatMessage::new(MessageRole::User, planning),
                    ChatMessage::new(MessageRole::User, prompts::refine_message()),
                ],
                REFINE_TEMPERATURE,
                &tools_description,
            )
            .await;
        refined.unwrap_or(plan)
    }

    async fn complete_plan(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        tools_description: &str,
    ) -> Option<Plan> {
        let request = CompletionRequest {
            system_prompt: prompts::PLANNER_SYSTEM_PROMPT.to_string(),
            messages,
            temperature,
            tools_description: Some(tools_description.to_string()),
        };
        match self.provider.complete(request).await {
            Ok(text) => {
                let plan = parse_plan(&text);
                if plan.is_none() {
                    warn!("Planner response carried no parseable JSON");
                }
                plan
            }
            Err(err) => {
                warn!(%err, "Planner call failed");
                None
            }
        }
    }

    fn materialize_tools(
        &self,
        specs: &[ToolSpec],
        memory: &mut Memory,
        reporter: &dyn Reporter,
    ) -> Vec<String> {
        let mut created = Vec::new();
        for spec in specs {
            match self.materialize(spec) {
                Ok(manifest) => {
                    info!(tool = %manifest.id, language = manifest.language.as_str(), "Tool created");
                    created.push(manifest.id.clone());
                    memory.tools.insert(manifest.id.clone(), manifest);
                }
                Err(err) => {
                    warn!(tool = %spec.name, %err, "Tool creation failed");
                    memory.add_history(
                        MessageRole::Assistant,
                        format!("Tool creation failed for '{}': {err}", spec.name),
                    );
                }
            }
        }
        if !specs.is_empty() {
            reporter.create_tools(&created);
        }
        created
    }

    fn materialize(&self, spec: &ToolSpec) -> Result<ToolManifest, crate::application::tooling::ToolStoreError> {
        let id = spec
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", slug(&spec.name), now_ms()));
        let entry = spec
            .entry
            .clone()
            .filter(|entry| !entry.trim().is_empty())
            .unwrap_or_else(|| spec.language.default_entry().to_string());
        let now = now_ms();
        let manifest = ToolManifest {
            id,
            name: spec.name.clone(),
            purpose: spec.purpose.clone(),
            language: spec.language,
            entry,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            usage: spec.usage.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.write_code(&manifest.id, &spec.files)?;
        self.store.save(&manifest)?;
        Ok(manifest)
    }

    async fn execute_call(
        &self,
        manifest: &ToolManifest,
        call: &RunCall,
        context: &TemplateContext,
        previous_success_stdout: &str,
        reporter: &Arc<dyn Reporter>,
    ) -> RunResult {
        let args: Vec<String> = call.args.iter().map(|arg| context.expand_arg(arg)).collect();
        // Omitted stdin pipes the previous successful stdout; an explicit
        // empty string stays empty.
        let stdin = match &call.stdin {
            Some(template) => context.expand(template),
            None => previous_success_stdout.to_string(),
        };

        let first = self
            .run_once(manifest, &args, &stdin, None, None, reporter)
            .await;
        if first.succeeded() {
            return first;
        }
        let mut last = first;

        if self.allow_network {
            let stderr = last.stderr.clone().unwrap_or_default();
            if let Some(package) = repair::detect_missing_dependency(manifest.language, &stderr) {
                match repair::register_dependency(
                    &self.store.tool_dir(&manifest.id),
                    &manifest.id,
                    manifest.language,
                    &package,
                ) {
                    Ok(reason) => {
                        let retry = self
                            .run_once(manifest, &args, &stdin, Some(true), Some(reason), reporter)
                            .await;
                        if retry.succeeded() {
                            return retry;
                        }
                        last = retry;
                    }
                    Err(err) => {
                        warn!(tool = %manifest.id, %err, "Failed to register missing dependency");
                    }
                }
            }
        }

        let stderr = last.stderr.clone().unwrap_or_default();
        if let Some(files) = self.request_patch(manifest, &stderr).await {
            if let Err(err) = self.store.write_code(&manifest.id, &files) {
                warn!(tool = %manifest.id, %err, "Failed to apply model patch");
                return last;
            }
            info!(tool = %manifest.id, files = files.len(), "Applied model patch");
            // The patched retry reuses the call's raw stdin, not the expanded
            // pipe input from the first attempt.
            let original_stdin = call.stdin.clone().unwrap_or_default();
            return self
                .run_once(
                    manifest,
                    &args,
                    &original_stdin,
                    Some(true),
                    Some(repair::REASON_MODEL_PATCH),
                    reporter,
                )
                .await;
        }
        last
    }

    async fn run_once(
        &self,
        manifest: &ToolManifest,
        args: &[String],
        stdin: &str,
        retry: Option<bool>,
        reason: Option<&'static str>,
        reporter: &Arc<dyn Reporter>,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<crate::infrastructure::sandbox::RunChunk>();
        let chunk_reporter = Arc::clone(reporter);
        let tool_id = manifest.id.clone();
        let forward = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                chunk_reporter.run_chunk(&tool_id, chunk.stream, &chunk.data);
            }
        });

        reporter.run_start(&manifest.id);
        let output = self
            .sandbox
            .run(RunRequest {
                language: manifest.language,
                entry: format!("tools/{}/{}", manifest.id, manifest.entry),
                args: args.to_vec(),
                stdin: stdin.to_string(),
                run_id,
                tool_dir: self.store.tool_dir(&manifest.id),
                chunk_tx: Some(tx),
            })
            .await;
        // All chunks are delivered before runEnd.
        let _ = forward.await;

        let result = RunResult {
            id: manifest.id.clone(),
            args: Some(args.to_vec()),
            code: Some(output.code),
            stdout: Some(output.stdout),
            stderr: Some(output.stderr),
            log_file: Some(output.log_file.display().to_string()),
            retry,
            reason: reason.map(String::from),
            error: None,
        };
        reporter.run_end(&result);
        result
    }

    async fn request_patch(
        &self,
        manifest: &ToolManifest,
        stderr: &str,
    ) -> Option<BTreeMap<String, String>> {
        let request = CompletionRequest {
            system_prompt: prompts::PLANNER_SYSTEM_PROMPT.to_string(),
            messages: vec![ChatMessage::new(
                MessageRole::User,
                prompts::patch_message(&manifest.id, &manifest.entry, stderr),
            )],
            temperature: PLAN_TEMPERATURE,
            tools_description: None,
        };
        match self.provider.complete(request).await {
            Ok(text) => repair::parse_patch(&text),
            Err(err) => {
                warn!(tool = %manifest.id, %err, "Patch request failed");
                None
            }
        }
    }

    async fn compose_answer(
        &self,
        goal: &str,
        plan: &Plan,
        last_run: Option<&RunResult>,
    ) -> Option<String> {
        let request = CompletionRequest {
            system_prompt: prompts::ANSWER_SYSTEM_PROMPT.to_string(),
            messages: vec![ChatMessage::new(
                MessageRole::User,
                prompts::answer_message(goal, plan, last_run),
            )],
            temperature: PLAN_TEMPERATURE,
            tools_description: None,
        };
        match self.provider.complete(request).await {
            Ok(text) => {
                let trimmed = text.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(err) => {
                debug!(%err, "Answer generation failed; continuing without one");
                None
            }
        }
    }

    fn persist(&self, outcome: &RunOutcome, memory: &mut Memory, reporter: &dyn Reporter) {
        let encoded = serde_json::to_value(outcome).unwrap_or(Value::Null);
        memory.add_history(MessageRole::Assistant, encoded.to_string());
        memory.runs.push(crate::domain::types::RunRecord {
            goal: outcome.goal.clone(),
            steps: outcome.steps.clone(),
            result: encoded,
            ts: now_ms(),
        });
        if let Err(err) = memory.save() {
            warn!(%err, "Failed to persist memory");
            reporter.error(&err.to_string());
        }
    }
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to a
/// single dash.
pub fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "tool".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod slug_tests {
    use super::slug;

    #[test]
    fn slug_collapses_non_alphanumeric_runs() {
        assert_eq!(slug("Word Counter"), "word-counter");
        assert_eq!(slug("CSV -> JSON!!"), "csv-json");
        assert_eq!(slug("  trim  "), "trim");
        assert_eq!(slug("***"), "tool");
    }
}
