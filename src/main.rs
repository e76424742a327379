use boxedin::application::agent::Agent;
use boxedin::application::memory::Memory;
use boxedin::application::repl;
use boxedin::application::tooling::ToolStore;
use boxedin::cli::{Cli, CliCommand};
use boxedin::config::AppConfig;
use boxedin::infrastructure::archive;
use boxedin::infrastructure::model::GeminiClient;
use boxedin::infrastructure::sandbox::{Sandbox, SandboxLimits};
use boxedin::infrastructure::server;
use clap::Parser;
use std::error::Error;
use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    debug!(
        data = %config.data_dir.display(),
        sandbox = %config.sandbox_dir.display(),
        model = config.model.as_str(),
        "Configuration assembled"
    );

    match cli.command {
        CliCommand::Run {
            goal,
            no_interactive,
        } => run_command(config, goal, no_interactive).await?,
        CliCommand::Serve { .. } => {
            let provider = build_provider(&config);
            let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            server::serve(config, provider, addr).await?;
        }
        CliCommand::Status => {
            let store = ToolStore::new(&config.sandbox_dir);
            let memory = Memory::load(&config.data_dir, &store)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&repl::status_json(&memory))?
            );
        }
        CliCommand::Export => {
            let stdout = std::io::stdout();
            archive::export_state(&config.data_dir, &config.sandbox_dir, stdout.lock())?;
        }
        CliCommand::Import { file } => {
            archive::import_state(&file, &config.data_dir, &config.sandbox_dir)?;
            info!(file = %file.display(), "State imported");
        }
    }
    Ok(())
}

async fn run_command(
    config: AppConfig,
    goal: Option<String>,
    no_interactive: bool,
) -> Result<(), Box<dyn Error>> {
    let provider = build_provider(&config);
    fs::create_dir_all(config.data_dir.join("logs"))?;
    let store = ToolStore::new(&config.sandbox_dir);
    let mut memory = Memory::load(&config.data_dir, &store)?;
    let sandbox = Sandbox::new(
        config.sandbox_dir.clone(),
        SandboxLimits {
            timeout_ms: config.timeout_ms,
            memory_mb: config.memory_mb,
            cpu: config.cpu.clone(),
            allow_network: config.allow_network,
        },
    );
    let agent = Agent::new(provider, store, sandbox, config.allow_network);

    if let Some(goal) = goal {
        repl::run_once(&agent, &mut memory, goal.trim()).await;
        return Ok(());
    }

    if atty::isnt(atty::Stream::Stdin) {
        info!("Reading goal from standard input");
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        let goal = buffer.trim();
        if goal.is_empty() {
            return Err("goal required via --goal or stdin".into());
        }
        repl::run_once(&agent, &mut memory, goal).await;
        return Ok(());
    }

    if no_interactive {
        return Err("goal required via --goal or stdin".into());
    }

    repl::run_interactive(&agent, &mut memory).await?;
    Ok(())
}

fn build_provider(config: &AppConfig) -> Arc<GeminiClient> {
    let api_key = match config.require_api_key() {
        Ok(key) => key.to_string(),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    Arc::new(GeminiClient::new(
        api_key,
        config.model.clone(),
        config.context_window,
    ))
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
