use super::models::RunResult;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder pattern"))
}

/// Expansion context for chaining one run's output into the next call.
#[derive(Debug, Default)]
pub struct TemplateContext {
    last_stdout: String,
    by_tool: HashMap<String, RunResult>,
}

impl TemplateContext {
    pub fn record(&mut self, result: &RunResult) {
        if let Some(stdout) = &result.stdout {
            self.last_stdout = stdout.clone();
        }
        // Latest result wins for `runs.<id>.*` lookups.
        self.by_tool.insert(result.id.clone(), result.clone());
    }

    /// Replace every `${EXPR}` occurrence. Supported expressions:
    /// `last.stdout` and `runs.<toolId>.stdout|stderr|code`. Unknown
    /// expressions expand to the empty string.
    pub fn expand(&self, template: &str) -> String {
        placeholder_pattern()
            .replace_all(template, |captures: &regex::Captures<'_>| {
                self.resolve(captures[1].trim())
            })
            .into_owned()
    }

    /// String arguments are expanded; anything else passes through and is
    /// rendered verbatim.
    pub fn expand_arg(&self, arg: &Value) -> String {
        match arg {
            Value::String(text) => self.expand(text),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn resolve(&self, expr: &str) -> String {
        if expr == "last.stdout" {
            return self.last_stdout.clone();
        }
        let mut parts = expr.splitn(3, '.');
        if parts.next() != Some("runs") {
            return String::new();
        }
        let (Some(tool), Some(field)) = (parts.next(), parts.next()) else {
            return String::new();
        };
        let Some(result) = self.by_tool.get(tool) else {
            return String::new();
        };
        match field {
            "stdout" => result.stdout.clone().unwrap_or_default(),
            "stderr" => result.stderr.clone().unwrap_or_default(),
            "code" => result
                .code
                .map(|code| code.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}
