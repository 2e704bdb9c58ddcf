//! MeshPhone agent main application

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use meshphone::{
    config::AgentConfig,
    core::{AgentEvent, MeshPhoneAgent},
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "meshphone")]
#[command(about = "SIP proxy and mesh monitoring agent for AREDN-style meshes")]
#[command(version = meshphone::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured log level (ERROR, WARNING, INFO, DEBUG, NONE)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,
    /// Validate configuration and exit
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    let _log_guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", meshphone::NAME, meshphone::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_agent(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
    }
}

fn load_configuration(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => AgentConfig::default_config(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.to_ascii_uppercase();
    }
    config.validate()?;
    Ok(config)
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let mut agent = MeshPhoneAgent::new(config)?;

    let mut event_rx = agent
        .take_event_receiver()
        .ok_or_else(|| meshphone::Error::internal("event receiver already taken"))?;

    agent.start().await?;

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_agent_event(event);
        }
    });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    agent.stop().await?;
    event_task.abort();

    info!("MeshPhone agent shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Cannot install SIGTERM handler: {}", e);
                    let _ = signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

fn handle_agent_event(event: AgentEvent) {
    match event {
        AgentEvent::Started => {
            info!("Agent started successfully");
        }
        AgentEvent::Stopped => {
            info!("Agent stopped");
        }
        AgentEvent::ComponentFailed { component, message } => {
            error!("Component {} failed: {}", component, message);
        }
    }
}

fn validate_configuration(config: &AgentConfig) -> Result<()> {
    config.validate()?;

    println!("Configuration is valid");
    println!("  Node name: {}", config.general.node_name);
    println!("  SIP port: {}", config.sip.listen_port);
    println!("  Phonebook sources: {}", config.phonebook.sources.len());
    println!(
        "  Mesh monitor: {}",
        if config.mesh_monitor.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  Phone monitor: {}",
        if config.phone_monitor.enabled { "enabled" } else { "disabled" }
    );
    println!("  Probe port: {}", config.mesh_monitor.probe_port);

    Ok(())
}
