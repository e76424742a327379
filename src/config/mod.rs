use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/boxedin.toml";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MEMORY_MB: u64 = 512;
const DEFAULT_CPU: &str = "1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_CONTEXT_WINDOW: usize = 100_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpu: String,
    pub allow_network: bool,
    pub port: u16,
    pub context_window: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    data_dir: Option<PathBuf>,
    sandbox_dir: Option<PathBuf>,
    model: Option<String>,
    timeout_ms: Option<u64>,
    memory_mb: Option<u64>,
    cpu: Option<String>,
    allow_network: Option<bool>,
    port: Option<u16>,
    context_window: Option<usize>,
}

impl AppConfig {
    /// Load order: file (when present) under environment overrides.
    /// CLI flags are applied afterwards by the caller.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => read_raw(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                match read_raw(default_path) {
                    Ok(raw) => raw,
                    Err(ConfigError::Io { source, .. })
                        if source.kind() == io::ErrorKind::NotFound =>
                    {
                        info!("Configuration file not found; using defaults");
                        RawConfig::default()
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        let mut config = Self {
            data_dir: raw.data_dir.unwrap_or_else(|| PathBuf::from("data")),
            sandbox_dir: raw.sandbox_dir.unwrap_or_else(|| PathBuf::from("sandbox")),
            model: raw.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: None,
            timeout_ms: raw.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            memory_mb: raw.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            cpu: raw.cpu.unwrap_or_else(|| DEFAULT_CPU.to_string()),
            allow_network: raw.allow_network.unwrap_or(false),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            context_window: raw.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(model) = env::var("GEMINI_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        if let Some(timeout) = env_number("SANDBOX_TIMEOUT_MS") {
            self.timeout_ms = timeout;
        }
        if let Some(memory) = env_number("SANDBOX_MEMORY_MB") {
            self.memory_mb = memory;
        }
        if let Ok(cpu) = env::var("SANDBOX_CPU") {
            if !cpu.trim().is_empty() {
                self.cpu = cpu;
            }
        }
        if let Ok(network) = env::var("SANDBOX_NETWORK") {
            self.allow_network = matches!(network.trim(), "1" | "true");
        }
        if let Some(port) = env_number::<u16>("PORT") {
            self.port = port;
        }
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    pub fn memory_file(&self) -> PathBuf {
        self.data_dir.join("memory").join("memory.json")
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn read_raw(path: &Path) -> Result<RawConfig, ConfigError> {
    debug!(path = %path.display(), "Reading configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
