use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "boxedin",
    version,
    about = "Goal-driven agent with a sandboxed tool executor"
)]
pub struct Cli {
    /// Durable state directory (memory, logs)
    #[arg(long, global = true)]
    pub data: Option<PathBuf>,
    /// Sandbox directory (tools, run logs)
    #[arg(long, global = true)]
    pub sandbox: Option<PathBuf>,
    /// Model name passed to the provider
    #[arg(long, global = true)]
    pub model: Option<String>,
    /// Hard kill for sandboxed runs, in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    pub timeout_ms: Option<u64>,
    /// Container memory limit in MiB
    #[arg(long = "memory-mb", global = true)]
    pub memory_mb: Option<u64>,
    /// Container CPU share (docker --cpus value)
    #[arg(long, global = true)]
    pub cpu: Option<String>,
    /// Allow network access inside the sandbox
    #[arg(long = "allow-network", global = true)]
    pub allow_network: bool,
    /// Optional TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run a goal, or start an interactive session
    Run {
        /// One-shot goal; omit for REPL or piped stdin
        #[arg(long)]
        goal: Option<String>,
        /// Never start the REPL, even on a terminal
        #[arg(long = "no-interactive")]
        no_interactive: bool,
    },
    /// Start the HTTP/SSE server
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print state counters as JSON
    Status,
    /// Write a tar.gz of the data and sandbox directories to stdout
    Export,
    /// Restore state from a tar.gz produced by export
    Import { file: PathBuf },
}

impl Cli {
    /// Flags override everything the config file and environment provided.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(data) = &self.data {
            config.data_dir = data.clone();
        }
        if let Some(sandbox) = &self.sandbox {
            config.sandbox_dir = sandbox.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(memory_mb) = self.memory_mb {
            config.memory_mb = memory_mb;
        }
        if let Some(cpu) = &self.cpu {
            config.cpu = cpu.clone();
        }
        if self.allow_network {
            config.allow_network = true;
        }
        if let CliCommand::Serve { port: Some(port) } = &self.command {
            config.port = *port;
        }
    }
}
