use crate::domain::types::{Language, ToolPort};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Structured plan extracted from free-form model output. The `plan` field
/// is duck-typed upstream (string or nested object) and kept opaque here;
/// only `create_tools` and `run` drive execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub plan: Value,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(rename = "createTools", alias = "create_tools", default)]
    pub create_tools: Vec<ToolSpec>,
    #[serde(default)]
    pub run: Vec<RunCall>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create_tools.is_empty() && self.run.is_empty()
    }

    /// Human-readable plan description for prompts and display.
    pub fn describe(&self) -> String {
        match &self.plan {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A tool the planner wants materialized before the run chain starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<ToolPort>,
    #[serde(default)]
    pub outputs: Vec<ToolPort>,
    #[serde(default)]
    pub usage: String,
}

/// One entry of the ordered run chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCall {
    pub id: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Outcome of one run-chain entry (or of the lookup that preceded it).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(rename = "logFile", skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: None,
            code: None,
            stdout: None,
            stderr: None,
            log_file: None,
            retry: None,
            reason: None,
            error: Some("Tool not found".into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// Return value of one agent-loop invocation. The loop never errors; failed
/// runs are data inside `runs`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunOutcome {
    pub goal: String,
    #[schema(value_type = Object)]
    pub plan: Value,
    pub steps: Vec<String>,
    pub created: Vec<String>,
    pub runs: Vec<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}
