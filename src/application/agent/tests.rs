use super::reporter::Reporter;
use super::*;
use crate::application::memory::Memory;
use crate::application::tooling::ToolStore;
use crate::infrastructure::model::{CompletionRequest, ModelError, PlanGenerator};
use crate::infrastructure::sandbox::{Sandbox, SandboxEngine, SandboxLimits, StreamKind};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone)]
struct ScriptedGenerator {
    responses: Arc<Mutex<Vec<String>>>,
    recordings: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedGenerator {
    fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            recordings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.recordings.lock().expect("recordings lock").clone()
    }
}

#[async_trait]
impl PlanGenerator for ScriptedGenerator {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        self.recordings
            .lock()
            .expect("recordings lock")
            .push(request);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(ModelError::InvalidResponse("script exhausted".into()));
        }
        Ok(responses.remove(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Plan,
    CreateTools(Vec<String>),
    RunStart(String),
    RunChunk(String, StreamKind),
    RunEnd(String, Option<i32>),
    Result,
    Done,
}

#[derive(Clone, Default)]
struct RecordingReporter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingReporter {
    fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl Reporter for RecordingReporter {
    fn plan(&self, _plan: &Plan) {
        self.push(Event::Plan);
    }
    fn create_tools(&self, ids: &[String]) {
        self.push(Event::CreateTools(ids.to_vec()));
    }
    fn run_start(&self, id: &str) {
        self.push(Event::RunStart(id.to_string()));
    }
    fn run_chunk(&self, id: &str, stream: StreamKind, _chunk: &str) {
        self.push(Event::RunChunk(id.to_string(), stream));
    }
    fn run_end(&self, result: &RunResult) {
        self.push(Event::RunEnd(result.id.clone(), result.code));
    }
    fn result(&self, _outcome: &RunOutcome) {
        self.push(Event::Result);
    }
    fn done(&self) {
        self.push(Event::Done);
    }
}

struct Harness {
    _sandbox_dir: TempDir,
    _data_dir: TempDir,
    memory: Memory,
    agent: Agent,
}

fn harness(provider: ScriptedGenerator, allow_network: bool) -> Harness {
    let sandbox_dir = TempDir::new().expect("sandbox tempdir");
    let data_dir = TempDir::new().expect("data tempdir");
    let store = ToolStore::new(sandbox_dir.path());
    let memory = Memory::load(data_dir.path(), &store).expect("memory loads");
    // Bootstrap installs are not exercised here; the heuristic gate is.
    let sandbox = Sandbox::new(sandbox_dir.path().to_path_buf(), SandboxLimits::default())
        .with_engine(SandboxEngine::Local);
    let store = ToolStore::new(sandbox_dir.path());
    let agent = Agent::new(Arc::new(provider), store, sandbox, allow_network);
    Harness {
        _sandbox_dir: sandbox_dir,
        _data_dir: data_dir,
        memory,
        agent,
    }
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn fenced(value: serde_json::Value) -> String {
    format!("```json\n{value}\n```")
}

#[tokio::test]
async fn echo_plan_creates_and_runs_tool() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let plan = fenced(json!({
        "plan": "echo",
        "steps": ["echo"],
        "createTools": [{
            "id": "echo",
            "name": "echo",
            "language": "python",
            "entry": "main.py",
            "purpose": "echo stdin",
            "files": {"main.py": "import sys\nprint(sys.stdin.read().strip())\n"}
        }],
        "run": [{"id": "echo", "stdin": "hello"}]
    }));
    let provider = ScriptedGenerator::new(vec![plan, "Echoed the input.".into()]);
    let mut harness = harness(provider.clone(), false);

    let outcome = harness
        .agent
        .run("echo hello", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert_eq!(outcome.created, vec!["echo".to_string()]);
    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.runs[0].code, Some(0));
    assert_eq!(outcome.runs[0].stdout.as_deref(), Some("hello\n"));
    assert_eq!(outcome.answer.as_deref(), Some("Echoed the input."));

    // Plan call first, answer call second; no refinement for a non-empty plan.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools_description.is_some());
    assert!(requests[0]
        .messages
        .iter()
        .any(|message| message.content.contains("echo hello")));
}

#[tokio::test]
async fn chained_runs_pipe_stdout_and_expand_templates() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let plan = fenced(json!({
        "plan": "uppercase then count",
        "steps": ["upper", "count"],
        "createTools": [
            {
                "id": "upper",
                "name": "upper",
                "language": "python",
                "entry": "main.py",
                "purpose": "uppercase stdin",
                "files": {"main.py": "import sys\nprint(sys.stdin.read().strip().upper())\n"}
            },
            {
                "id": "count",
                "name": "count",
                "language": "python",
                "entry": "main.py",
                "purpose": "count stdin bytes",
                "files": {"main.py": "import sys\nprint(len(sys.stdin.read()))\n"}
            },
            {
                "id": "argecho",
                "name": "argecho",
                "language": "python",
                "entry": "main.py",
                "purpose": "print first arg",
                "files": {"main.py": "import sys\nprint(sys.argv[1] if len(sys.argv) > 1 else '')\n"}
            }
        ],
        "run": [
            {"id": "upper", "stdin": "abc"},
            {"id": "count"},
            {"id": "argecho", "args": ["${runs.upper.stdout}"], "stdin": ""},
            {"id": "argecho", "args": ["${runs.ghost.stdout}"], "stdin": ""}
        ]
    }));
    let provider = ScriptedGenerator::new(vec![plan, "Done.".into()]);
    let mut harness = harness(provider, false);

    let outcome = harness
        .agent
        .run("count letters", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert_eq!(outcome.runs.len(), 4);
    assert_eq!(outcome.runs[0].stdout.as_deref(), Some("ABC\n"));
    // The count call omitted stdin, so it received "ABC\n".
    assert_eq!(outcome.runs[1].stdout.as_deref(), Some("4\n"));
    // Template expansion feeds upper's stdout in as an argument.
    assert_eq!(outcome.runs[2].stdout.as_deref(), Some("ABC\n\n"));
    // Unknown template keys expand to empty.
    assert_eq!(outcome.runs[3].stdout.as_deref(), Some("\n"));
}

#[tokio::test]
async fn missing_tool_is_recorded_without_failing_the_run() {
    let plan = fenced(json!({
        "plan": "use a tool that does not exist",
        "steps": [],
        "createTools": [],
        "run": [{"id": "nope"}]
    }));
    let provider = ScriptedGenerator::new(vec![plan, "Nothing could run.".into()]);
    let mut harness = harness(provider, false);

    let outcome = harness
        .agent
        .run("impossible", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.runs[0].id, "nope");
    assert_eq!(outcome.runs[0].error.as_deref(), Some("Tool not found"));
    assert_eq!(outcome.runs[0].code, None);
    assert_eq!(outcome.answer.as_deref(), Some("Nothing could run."));
}

#[tokio::test]
async fn unparseable_plan_falls_back_to_empty_after_refine() {
    let provider = ScriptedGenerator::new(vec![
        "I cannot answer in JSON today.".into(),
        "Still prose, sorry.".into(),
        "No actions were taken.".into(),
    ]);
    let mut harness = harness(provider.clone(), false);

    let outcome = harness
        .agent
        .run("do something", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert!(outcome.created.is_empty());
    assert!(outcome.runs.is_empty());
    assert_eq!(outcome.answer.as_deref(), Some("No actions were taken."));

    // Plan, refinement, then answer.
    let requests = provider.requests();
    assert_eq!(requests.len(), 3);
    assert!((requests[1].temperature - 0.3).abs() < f32::EPSILON);
}

#[tokio::test]
async fn planner_failure_still_persists_a_run_record() {
    let provider = ScriptedGenerator::new(Vec::new());
    let mut harness = harness(provider, false);

    let outcome = harness
        .agent
        .run("anything", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert!(outcome.runs.is_empty());
    assert!(outcome.answer.is_none());
    assert_eq!(harness.memory.runs.len(), 1);
    assert_eq!(harness.memory.runs[0].goal, "anything");
    // Goal plus persisted outcome JSON.
    assert!(harness.memory.history.len() >= 2);
}

#[tokio::test]
async fn reporter_events_are_ordered_per_run() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let plan = fenced(json!({
        "plan": "echo",
        "steps": ["echo"],
        "createTools": [{
            "id": "echo",
            "name": "echo",
            "language": "python",
            "entry": "main.py",
            "purpose": "echo stdin",
            "files": {"main.py": "import sys\nprint(sys.stdin.read().strip())\n"}
        }],
        "run": [{"id": "echo", "stdin": "hi"}]
    }));
    let provider = ScriptedGenerator::new(vec![plan, "ok".into()]);
    let mut harness = harness(provider, false);
    let reporter = RecordingReporter::default();

    harness
        .agent
        .run("echo", &mut harness.memory, Arc::new(reporter.clone()))
        .await;

    let events = harness_events(&reporter, "echo");
    let start = events
        .iter()
        .position(|event| matches!(event, Event::RunStart(_)))
        .expect("runStart emitted");
    let end = events
        .iter()
        .position(|event| matches!(event, Event::RunEnd(_, _)))
        .expect("runEnd emitted");
    assert!(start < end);
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, Event::RunStart(_)))
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, Event::RunEnd(_, _)))
            .count(),
        1
    );
    for (index, event) in events.iter().enumerate() {
        if matches!(event, Event::RunChunk(_, _)) {
            assert!(index > start && index < end);
        }
    }

    let all = reporter.events();
    assert_eq!(all.first(), Some(&Event::Plan));
    assert_eq!(all.last(), Some(&Event::Done));
    assert!(all.contains(&Event::CreateTools(vec!["echo".into()])));
    assert!(all.contains(&Event::Result));
}

fn harness_events(reporter: &RecordingReporter, id: &str) -> Vec<Event> {
    reporter
        .events()
        .into_iter()
        .filter(|event| match event {
            Event::RunStart(event_id)
            | Event::RunChunk(event_id, _)
            | Event::RunEnd(event_id, _) => event_id == id,
            _ => false,
        })
        .collect()
}

#[tokio::test]
async fn dependency_heuristic_registers_package_and_retries() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    // The tool fails with a missing-module error until the package shows up
    // in requirements.txt, which is exactly what the heuristic writes.
    let source = "import os, sys\nhere = os.path.dirname(os.path.abspath(__file__))\npath = os.path.join(here, 'requirements.txt')\nif os.path.exists(path) and 'fancymodule' in open(path).read():\n    print('imported')\nelse:\n    sys.stderr.write(\"ModuleNotFoundError: No module named 'fancymodule'\\n\")\n    sys.exit(1)\n";
    let plan = fenced(json!({
        "plan": "needs a dependency",
        "steps": ["run it"],
        "createTools": [{
            "id": "needy",
            "name": "needy",
            "language": "python",
            "entry": "main.py",
            "purpose": "requires fancymodule",
            "files": {"main.py": source}
        }],
        "run": [{"id": "needy", "stdin": ""}]
    }));
    let provider = ScriptedGenerator::new(vec![plan, "Recovered.".into()]);
    let mut harness = harness(provider, true);

    let outcome = harness
        .agent
        .run("needs dep", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert_eq!(outcome.runs.len(), 1);
    let run = &outcome.runs[0];
    assert_eq!(run.code, Some(0));
    assert_eq!(run.retry, Some(true));
    assert_eq!(run.reason.as_deref(), Some("auto-install-python"));

    let requirements = requirements_path(&harness, "needy");
    let content = std::fs::read_to_string(requirements).expect("requirements exist");
    assert!(content.lines().any(|line| line.trim() == "fancymodule"));
}

#[tokio::test]
async fn model_patch_reruns_with_original_stdin() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    // First version crashes; the patched version echoes stdin.
    let plan = fenced(json!({
        "plan": "patch me",
        "steps": ["run"],
        "createTools": [{
            "id": "crasher",
            "name": "crasher",
            "language": "python",
            "entry": "main.py",
            "purpose": "always fails at first",
            "files": {"main.py": "raise RuntimeError('broken tool')\n"}
        }],
        "run": [{"id": "crasher", "stdin": "keep-this"}]
    }));
    let patch = fenced(json!({
        "files": {"main.py": "import sys\nprint(sys.stdin.read())\n"}
    }));
    let provider = ScriptedGenerator::new(vec![plan, patch, "Patched.".into()]);
    let mut harness = harness(provider.clone(), false);

    let outcome = harness
        .agent
        .run("patch", &mut harness.memory, Arc::new(NullReporter))
        .await;

    assert_eq!(outcome.runs.len(), 1);
    let run = &outcome.runs[0];
    assert_eq!(run.code, Some(0));
    assert_eq!(run.retry, Some(true));
    assert_eq!(run.reason.as_deref(), Some("model-patch"));
    assert_eq!(run.stdout.as_deref(), Some("keep-this\n"));

    // The patch request carried the failing stderr.
    let requests = provider.requests();
    assert!(requests[1]
        .messages
        .iter()
        .any(|message| message.content.contains("broken tool")));
}

fn requirements_path(harness: &Harness, id: &str) -> std::path::PathBuf {
    tool_dir(harness, id).join("requirements.txt")
}

fn tool_dir(harness: &Harness, id: &str) -> std::path::PathBuf {
    harness._sandbox_dir.path().join("tools").join(id)
}

#[tokio::test]
async fn tools_persist_across_loop_invocations() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let plan = fenced(json!({
        "plan": "make a tool",
        "steps": [],
        "createTools": [{
            "id": "keeper",
            "name": "keeper",
            "language": "python",
            "entry": "main.py",
            "purpose": "prints a constant",
            "files": {"main.py": "print('kept')\n"}
        }],
        "run": [{"id": "keeper", "stdin": ""}]
    }));
    let reuse = fenced(json!({
        "plan": "reuse the tool",
        "steps": [],
        "createTools": [],
        "run": [{"id": "keeper", "stdin": ""}]
    }));
    let provider =
        ScriptedGenerator::new(vec![plan, "made".into(), reuse, "reused".into()]);
    let mut harness = harness(provider, false);

    let first = harness
        .agent
        .run("make", &mut harness.memory, Arc::new(NullReporter))
        .await;
    assert_eq!(first.runs[0].code, Some(0));

    let second = harness
        .agent
        .run("reuse", &mut harness.memory, Arc::new(NullReporter))
        .await;
    assert!(second.created.is_empty());
    assert_eq!(second.runs[0].code, Some(0));
    assert_eq!(second.runs[0].stdout.as_deref(), Some("kept\n"));

    assert!(tool_dir(&harness, "keeper").join("manifest.json").exists());
    assert_eq!(harness.memory.runs.len(), 2);
}
