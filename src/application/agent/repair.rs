use super::parser::extract_json;
use crate::domain::types::Language;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

pub const REASON_PYTHON_INSTALL: &str = "auto-install-python";
pub const REASON_NODE_INSTALL: &str = "auto-install-node";
pub const REASON_MODEL_PATCH: &str = "model-patch";

fn python_missing_module() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"ModuleNotFoundError: No module named '([^']+)'")
            .expect("valid python pattern")
    })
}

fn node_missing_module() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Cannot find module '([^']+)'").expect("valid node pattern"))
}

/// Match the stderr of a failed run against the known missing-dependency
/// shapes. Relative node requires (`./util`) are not packages.
pub fn detect_missing_dependency(language: Language, stderr: &str) -> Option<String> {
    let pattern = match language {
        Language::Python => python_missing_module(),
        Language::Node => node_missing_module(),
    };
    let package = pattern.captures(stderr)?.get(1)?.as_str();
    if package.starts_with('.') || package.starts_with('/') {
        return None;
    }
    Some(package.to_string())
}

/// Register the package in the tool's dependency file, creating it when
/// absent. Returns the retry reason recorded on the re-run.
pub fn register_dependency(
    tool_dir: &Path,
    tool_id: &str,
    language: Language,
    package: &str,
) -> io::Result<&'static str> {
    match language {
        Language::Python => {
            let path = tool_dir.join("requirements.txt");
            let existing = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
                Err(err) => return Err(err),
            };
            if existing.lines().any(|line| line.trim() == package) {
                return Ok(REASON_PYTHON_INSTALL);
            }
            let mut updated = existing;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(package);
            updated.push('\n');
            fs::write(&path, updated)?;
            info!(tool = %tool_id, package, "Added package to requirements.txt");
            Ok(REASON_PYTHON_INSTALL)
        }
        Language::Node => {
            let path = tool_dir.join("package.json");
            let mut manifest: Value = match fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| json!({})),
                Err(err) if err.kind() == io::ErrorKind::NotFound => json!({
                    "name": tool_id,
                    "version": "0.0.0",
                    "private": true,
                    "dependencies": {}
                }),
                Err(err) => return Err(err),
            };
            if !manifest.is_object() {
                manifest = json!({
                    "name": tool_id,
                    "version": "0.0.0",
                    "private": true,
                    "dependencies": {}
                });
            }
            let dependencies = manifest
                .as_object_mut()
                .and_then(|map| {
                    map.entry("dependencies")
                        .or_insert_with(|| json!({}))
                        .as_object_mut()
                });
            if let Some(dependencies) = dependencies {
                dependencies.insert(package.to_string(), json!("*"));
            }
            let encoded = serde_json::to_string_pretty(&manifest)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            fs::write(&path, encoded)?;
            info!(tool = %tool_id, package, "Added package to package.json");
            Ok(REASON_NODE_INSTALL)
        }
    }
}

/// Parse a model patch response of the form `{"files": {path: content}}`.
pub fn parse_patch(content: &str) -> Option<BTreeMap<String, String>> {
    let value = extract_json(content)?;
    let files = value.get("files")?.as_object()?;
    let mut patch = BTreeMap::new();
    for (path, content) in files {
        patch.insert(path.clone(), content.as_str()?.to_string());
    }
    if patch.is_empty() {
        None
    } else {
        Some(patch)
    }
}
