use crate::application::tooling::ToolStore;
use crate::domain::types::{HistoryEntry, MessageRole, RunRecord, ToolManifest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_HISTORY_WINDOW: usize = 40;

// Saves from concurrent goals race on the same file; the rename keeps each
// write atomic and this lock keeps writes within one process serialized.
static SAVE_LOCK: Mutex<()> = Mutex::new(());

/// Durable agent state: tool summaries, conversation history, run log.
#[derive(Debug)]
pub struct Memory {
    pub tools: BTreeMap<String, ToolManifest>,
    pub history: Vec<HistoryEntry>,
    pub runs: Vec<RunRecord>,
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode memory state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    tools: BTreeMap<String, ToolManifest>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    runs: Vec<RunRecord>,
}

impl Memory {
    /// Read `memory.json` (or defaults when absent) and reconcile the tool
    /// map against the on-disk catalog, which is authoritative.
    pub fn load(data_dir: &Path, store: &ToolStore) -> Result<Self, MemoryError> {
        let path = data_dir.join("memory").join("memory.json");
        let file = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<MemoryFile>(&content) {
                Ok(file) => file,
                Err(err) => {
                    warn!(%err, "Memory file is corrupt; starting from defaults");
                    MemoryFile::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No memory file yet; starting fresh");
                MemoryFile::default()
            }
            Err(source) => return Err(MemoryError::Io { path, source }),
        };

        let tools = match store.load() {
            Ok(tools) => tools,
            Err(err) => {
                warn!(%err, "Tool catalog scan failed; keeping persisted summaries");
                file.tools
            }
        };

        let memory = Self {
            tools,
            history: file.history,
            runs: file.runs,
            path,
        };
        if !memory.path.exists() {
            memory.save()?;
        }
        Ok(memory)
    }

    /// Persist state with write-new-then-rename so readers never observe a
    /// partially written file.
    pub fn save(&self) -> Result<(), MemoryError> {
        let _guard = SAVE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| MemoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = MemoryFile {
            tools: self.tools.clone(),
            history: self.history.clone(),
            runs: self.runs.clone(),
        };
        let encoded = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded).map_err(|source| MemoryError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| MemoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Memory saved");
        Ok(())
    }

    pub fn add_history(&mut self, role: MessageRole, content: impl Into<String>) {
        self.history.push(HistoryEntry::new(role, content));
    }

    /// Window the transcript for prompting without mutating the store: when
    /// over budget, one synthetic system entry stands in for the omitted
    /// prefix.
    pub fn summarize_history(&self, max: usize) -> Vec<HistoryEntry> {
        if self.history.len() <= max {
            return self.history.clone();
        }
        let omitted = self.history.len() - max;
        let mut window = Vec::with_capacity(max + 1);
        window.push(HistoryEntry::new(
            MessageRole::System,
            format!("{omitted} earlier turns omitted"),
        ));
        window.extend(self.history[omitted..].iter().cloned());
        window
    }

    pub fn summarize_history_default(&self) -> Vec<HistoryEntry> {
        self.summarize_history(DEFAULT_HISTORY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Language;

    fn store_with_tool(dir: &Path) -> ToolStore {
        let store = ToolStore::new(dir);
        store
            .save(&ToolManifest {
                id: "echo".into(),
                name: "echo".into(),
                purpose: "echo stdin".into(),
                language: Language::Python,
                entry: "main.py".into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                usage: String::new(),
                created_at: 1,
                updated_at: 1,
            })
            .expect("save tool");
        store
    }

    #[test]
    fn load_creates_defaults_and_reconciles_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_tool(dir.path());
        let memory = Memory::load(dir.path(), &store).expect("load");

        assert!(memory.history.is_empty());
        assert!(memory.runs.is_empty());
        assert!(memory.tools.contains_key("echo"));
        assert!(dir.path().join("memory/memory.json").exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_tool(dir.path());
        let mut memory = Memory::load(dir.path(), &store).expect("load");
        memory.add_history(MessageRole::User, "do the thing");
        memory.runs.push(RunRecord {
            goal: "do the thing".into(),
            steps: vec!["step one".into()],
            result: serde_json::json!({"ok": true}),
            ts: 42,
        });
        memory.save().expect("save");

        let reloaded = Memory::load(dir.path(), &store).expect("reload");
        assert_eq!(reloaded.history, memory.history);
        assert_eq!(reloaded.runs.len(), 1);
        assert_eq!(reloaded.runs[0].goal, "do the thing");
        assert_eq!(reloaded.tools, memory.tools);
    }

    #[test]
    fn summarize_history_is_non_mutating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ToolStore::new(dir.path());
        let mut memory = Memory::load(dir.path(), &store).expect("load");
        for index in 0..50 {
            memory.add_history(MessageRole::User, format!("turn {index}"));
        }

        let window = memory.summarize_history(40);
        assert_eq!(window.len(), 41);
        assert_eq!(window[0].role, MessageRole::System);
        assert!(window[0].content.contains("10 earlier turns omitted"));
        assert_eq!(window[1].content, "turn 10");
        assert_eq!(memory.history.len(), 50);

        let small = memory.summarize_history(100);
        assert_eq!(small.len(), 50);
    }
}
