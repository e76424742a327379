use crate::domain::types::ToolManifest;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// On-disk tool catalog rooted at `<sandbox>/tools`.
pub struct ToolStore {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum ToolStoreError {
    #[error("tool I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode manifest for '{id}': {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },
    #[error("code path '{path}' escapes the tool directory")]
    PathEscape { path: String },
}

impl ToolStore {
    pub fn new(sandbox_dir: &Path) -> Self {
        Self {
            root: sandbox_dir.join("tools"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tool_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Validate and persist a manifest, creating the tool directory.
    pub fn save(&self, manifest: &ToolManifest) -> Result<(), ToolStoreError> {
        validate(manifest)?;
        let dir = self.tool_dir(&manifest.id);
        fs::create_dir_all(&dir).map_err(|source| ToolStoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let encoded =
            serde_json::to_string_pretty(manifest).map_err(|source| ToolStoreError::Encode {
                id: manifest.id.clone(),
                source,
            })?;
        let path = dir.join(MANIFEST_FILE);
        fs::write(&path, encoded).map_err(|source| ToolStoreError::Io { path, source })?;
        debug!(tool = %manifest.id, "Persisted tool manifest");
        Ok(())
    }

    /// Write source files under the tool directory. Existing files are
    /// overwritten; this is also the patch path for auto-fix.
    pub fn write_code(
        &self,
        id: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<(), ToolStoreError> {
        let dir = self.tool_dir(id);
        for (rel_path, content) in files {
            let rel = sanitize_rel_path(rel_path)?;
            let target = dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| ToolStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&target, content).map_err(|source| ToolStoreError::Io {
                path: target.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Enumerate the catalog. Invalid manifests are skipped, never fatal.
    pub fn load(&self) -> Result<BTreeMap<String, ToolManifest>, ToolStoreError> {
        let mut tools = BTreeMap::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(tools),
            Err(source) => {
                return Err(ToolStoreError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| ToolStoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            let content = match fs::read_to_string(&manifest_path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(tool = %name, %err, "Skipping tool without readable manifest");
                    continue;
                }
            };
            let manifest: ToolManifest = match serde_json::from_str(&content) {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(tool = %name, %err, "Skipping tool with invalid manifest");
                    continue;
                }
            };
            if validate(&manifest).is_err() {
                warn!(tool = %name, "Skipping tool whose manifest failed validation");
                continue;
            }
            tools.insert(manifest.id.clone(), manifest);
        }
        Ok(tools)
    }

    /// Deterministic catalog listing embedded in planner prompts.
    pub fn to_prompt(tools: &BTreeMap<String, ToolManifest>) -> String {
        if tools.is_empty() {
            return "(no tools registered yet)".to_string();
        }
        let mut lines = Vec::with_capacity(tools.len());
        for manifest in tools.values() {
            let inputs: Vec<&str> = manifest
                .inputs
                .iter()
                .map(|port| port.name.as_str())
                .collect();
            lines.push(format!(
                "- {} [{}] {} (inputs: {})",
                manifest.id,
                manifest.language.as_str(),
                manifest.purpose,
                if inputs.is_empty() {
                    "none".to_string()
                } else {
                    inputs.join(", ")
                }
            ));
        }
        lines.join("\n")
    }
}

fn validate(manifest: &ToolManifest) -> Result<(), ToolStoreError> {
    if manifest.id.trim().is_empty() {
        return Err(ToolStoreError::InvalidManifest {
            reason: "id must not be empty".into(),
        });
    }
    if manifest.id.contains('/') || manifest.id.contains('\\') || manifest.id.contains("..") {
        return Err(ToolStoreError::InvalidManifest {
            reason: format!("id '{}' must be a single path segment", manifest.id),
        });
    }
    if manifest.name.trim().is_empty() {
        return Err(ToolStoreError::InvalidManifest {
            reason: "name must not be empty".into(),
        });
    }
    if manifest.entry.trim().is_empty() {
        return Err(ToolStoreError::InvalidManifest {
            reason: "entry must not be empty".into(),
        });
    }
    sanitize_rel_path(&manifest.entry).map_err(|_| ToolStoreError::InvalidManifest {
        reason: format!("entry '{}' escapes the tool directory", manifest.entry),
    })?;
    Ok(())
}

/// Accept only relative paths that stay inside the tool directory.
fn sanitize_rel_path(raw: &str) -> Result<&Path, ToolStoreError> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(ToolStoreError::PathEscape { path: raw.into() });
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ToolStoreError::PathEscape { path: raw.into() }),
        }
    }
    Ok(path)
}
