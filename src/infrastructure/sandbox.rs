use crate::domain::types::Language;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};
use utoipa::ToSchema;

const READ_BUFFER_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpu: String,
    pub allow_network: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_mb: 512,
            cpu: "1".into(),
            allow_network: false,
        }
    }
}

/// Backend selection. `Auto` probes for a container engine on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxEngine {
    Auto,
    Container,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct RunChunk {
    pub stream: StreamKind,
    pub data: String,
}

/// One tool invocation. `entry` is relative to the sandbox root
/// (`tools/<id>/<file>`); `tool_dir` is the absolute tool directory.
pub struct RunRequest {
    pub language: Language,
    pub entry: String,
    pub args: Vec<String>,
    pub stdin: String,
    pub run_id: String,
    pub tool_dir: PathBuf,
    pub chunk_tx: Option<UnboundedSender<RunChunk>>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub log_file: PathBuf,
}

/// Resource-bounded executor for generated tools. Runs never fail at the
/// call boundary: spawn errors surface as `code == -1` with the error text
/// on stderr.
pub struct Sandbox {
    root: PathBuf,
    limits: SandboxLimits,
    engine: SandboxEngine,
}

impl Sandbox {
    pub fn new(root: PathBuf, limits: SandboxLimits) -> Self {
        Self {
            root,
            limits,
            engine: SandboxEngine::Auto,
        }
    }

    pub fn with_engine(mut self, engine: SandboxEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn run(&self, request: RunRequest) -> RunOutput {
        let run_dir = self.root.join("runs").join(&request.run_id);
        let log_path = run_dir.join("exec.log");
        if let Err(err) = fs::create_dir_all(&run_dir).await {
            return startup_failure(&request, log_path, err.to_string());
        }
        let mut log = match fs::File::create(&log_path).await {
            Ok(file) => file,
            Err(err) => {
                return RunOutput {
                    code: -1,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    log_file: log_path,
                }
            }
        };

        if self.limits.allow_network {
            self.bootstrap_dependencies(&request).await;
        }

        let engine = self.select_engine().await;
        debug!(run_id = %request.run_id, ?engine, entry = %request.entry, "Starting sandboxed run");
        let mut command = self.build_command(&request, engine);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let text = err.to_string();
                let _ = log.write_all(text.as_bytes()).await;
                let _ = log.flush().await;
                if let Some(forward) = &request.chunk_tx {
                    let _ = forward.send(RunChunk {
                        stream: StreamKind::Stderr,
                        data: text.clone(),
                    });
                }
                return RunOutput {
                    code: -1,
                    stdout: String::new(),
                    stderr: text,
                    log_file: log_path,
                };
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if request.stdin.is_empty() {
                drop(stdin);
            } else {
                let data = request.stdin.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(data.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<RunChunk>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        // Single consumer keeps the log, the accumulated strings, and the
        // forwarded chunks in arrival order.
        let forward = request.chunk_tx.clone();
        let collect = async {
            let mut stdout_acc = String::new();
            let mut stderr_acc = String::new();
            while let Some(chunk) = rx.recv().await {
                let _ = log.write_all(chunk.data.as_bytes()).await;
                match chunk.stream {
                    StreamKind::Stdout => stdout_acc.push_str(&chunk.data),
                    StreamKind::Stderr => stderr_acc.push_str(&chunk.data),
                }
                if let Some(forward) = &forward {
                    let _ = forward.send(chunk);
                }
            }
            let _ = log.flush().await;
            (stdout_acc, stderr_acc)
        };

        let timeout = Duration::from_millis(self.limits.timeout_ms);
        let run_id = request.run_id.clone();
        let wait = async {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                Ok(Err(err)) => {
                    warn!(run_id = %run_id, %err, "Failed to await sandboxed child");
                    -1
                }
                Err(_) => {
                    warn!(run_id = %run_id, timeout_ms = timeout.as_millis() as u64, "Run exceeded timeout; killing child");
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(_) => -1,
                    }
                }
            }
        };

        let ((stdout, stderr), code) = tokio::join!(collect, wait);
        debug!(run_id = %request.run_id, code, "Sandboxed run finished");
        RunOutput {
            code,
            stdout,
            stderr,
            log_file: log_path,
        }
    }

    async fn select_engine(&self) -> SandboxEngine {
        match self.engine {
            SandboxEngine::Auto => {
                if container_engine_available().await {
                    SandboxEngine::Container
                } else {
                    SandboxEngine::Local
                }
            }
            fixed => fixed,
        }
    }

    fn build_command(&self, request: &RunRequest, engine: SandboxEngine) -> Command {
        let site_dir = request.tool_dir.join(".site");
        match engine {
            SandboxEngine::Container => {
                let root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
                let mut command = Command::new("docker");
                command
                    .arg("run")
                    .arg("--rm")
                    .arg("-i")
                    .arg("-v")
                    .arg(format!("{}:/app", root.display()))
                    .arg("-w")
                    .arg("/app")
                    .arg(format!("--memory={}m", self.limits.memory_mb))
                    .arg(format!("--cpus={}", self.limits.cpu));
                if !self.limits.allow_network {
                    command.arg("--network=none");
                }
                if request.language == Language::Python && site_dir.is_dir() {
                    if let Some(parent) = Path::new(&request.entry).parent() {
                        command
                            .arg("-e")
                            .arg(format!("PYTHONPATH=/app/{}/.site", parent.display()));
                    }
                }
                command
                    .arg(request.language.container_image())
                    .arg(request.language.container_interpreter())
                    .arg(&request.entry)
                    .args(&request.args);
                command
            }
            _ => {
                let mut command = Command::new(request.language.local_interpreter());
                command
                    .arg(&request.entry)
                    .args(&request.args)
                    .current_dir(&self.root);
                if request.language == Language::Python && site_dir.is_dir() {
                    command.env("PYTHONPATH", &site_dir);
                }
                command
            }
        }
    }

    /// Best-effort install of declared dependencies. Failures are logged and
    /// the main run proceeds; a genuinely missing package will surface there.
    async fn bootstrap_dependencies(&self, request: &RunRequest) {
        match request.language {
            Language::Python => {
                let requirements = request.tool_dir.join("requirements.txt");
                if !requirements.is_file() {
                    return;
                }
                let result = Command::new("python3")
                    .args(["-m", "pip", "install", "-t", ".site", "-r", "requirements.txt"])
                    .current_dir(&request.tool_dir)
                    .output()
                    .await;
                log_bootstrap("pip install", &request.run_id, result);
            }
            Language::Node => {
                if !request.tool_dir.join("package.json").is_file() {
                    return;
                }
                let result = Command::new("npm")
                    .args(["install", "--omit=dev"])
                    .current_dir(&request.tool_dir)
                    .output()
                    .await;
                log_bootstrap("npm install", &request.run_id, result);
            }
        }
    }
}

fn startup_failure(request: &RunRequest, log_path: PathBuf, text: String) -> RunOutput {
    if let Some(forward) = &request.chunk_tx {
        let _ = forward.send(RunChunk {
            stream: StreamKind::Stderr,
            data: text.clone(),
        });
    }
    RunOutput {
        code: -1,
        stdout: String::new(),
        stderr: text,
        log_file: log_path,
    }
}

fn log_bootstrap(label: &str, run_id: &str, result: std::io::Result<std::process::Output>) {
    match result {
        Ok(output) if output.status.success() => {
            debug!(run_id = %run_id, label, "Dependency bootstrap succeeded");
        }
        Ok(output) => {
            warn!(
                run_id = %run_id,
                label,
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Dependency bootstrap failed; continuing"
            );
        }
        Err(err) => {
            warn!(run_id = %run_id, label, %err, "Dependency bootstrap could not start; continuing");
        }
    }
}

async fn container_engine_available() -> bool {
    Command::new("docker")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn pump<R>(mut reader: R, stream: StreamKind, tx: UnboundedSender<RunChunk>)
where
    R: AsyncReadExt + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let data = String::from_utf8_lossy(&buffer[..read]).into_owned();
                if tx.send(RunChunk { stream, data }).is_err() {
                    break;
                }
            }
        }
    }
}
