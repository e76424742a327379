use super::models::{Plan, RunOutcome, RunResult};
use crate::infrastructure::sandbox::StreamKind;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

/// Progress observer. Every callback is best-effort; the loop is correct
/// with the null implementation.
pub trait Reporter: Send + Sync {
    fn plan(&self, _plan: &Plan) {}
    fn create_tools(&self, _ids: &[String]) {}
    fn run_start(&self, _id: &str) {}
    fn run_chunk(&self, _id: &str, _stream: StreamKind, _chunk: &str) {}
    fn run_end(&self, _result: &RunResult) {}
    fn result(&self, _outcome: &RunOutcome) {}
    fn done(&self) {}
    fn error(&self, _message: &str) {}
}

pub struct NullReporter;

impl Reporter for NullReporter {}

/// Serializable progress event, shared by the SSE stream and the request
/// collector. `event` matches the SSE event name.
#[derive(Debug, Clone, Serialize)]
pub struct ReporterEvent {
    pub event: &'static str,
    pub data: Value,
}

impl ReporterEvent {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

/// Forwards events into a per-subscriber channel; dropped receivers simply
/// stop observing without affecting the run.
pub struct ChannelReporter {
    tx: UnboundedSender<ReporterEvent>,
}

impl ChannelReporter {
    pub fn new(tx: UnboundedSender<ReporterEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: ReporterEvent) {
        let _ = self.tx.send(event);
    }
}

impl Reporter for ChannelReporter {
    fn plan(&self, plan: &Plan) {
        let data = serde_json::to_value(plan).unwrap_or(Value::Null);
        self.emit(ReporterEvent::new("plan", data));
    }

    fn create_tools(&self, ids: &[String]) {
        self.emit(ReporterEvent::new("createTools", json!({ "ids": ids })));
    }

    fn run_start(&self, id: &str) {
        self.emit(ReporterEvent::new("runStart", json!({ "id": id })));
    }

    fn run_chunk(&self, id: &str, stream: StreamKind, chunk: &str) {
        self.emit(ReporterEvent::new(
            "runChunk",
            json!({ "id": id, "stream": stream, "chunk": chunk }),
        ));
    }

    fn run_end(&self, result: &RunResult) {
        let data = serde_json::to_value(result).unwrap_or(Value::Null);
        self.emit(ReporterEvent::new("runEnd", data));
    }

    fn result(&self, outcome: &RunOutcome) {
        let data = serde_json::to_value(outcome).unwrap_or(Value::Null);
        self.emit(ReporterEvent::new("result", data));
    }

    fn done(&self) {
        self.emit(ReporterEvent::new("complete", json!({})));
    }

    fn error(&self, message: &str) {
        self.emit(ReporterEvent::new("error", json!({ "message": message })));
    }
}
