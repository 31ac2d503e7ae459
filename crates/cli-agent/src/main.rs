//! CLI entry point for the relay agent
//!
//! Parses command line arguments, installs logging and runs the agent.

use clap::Parser;
use relay_agent::{run_startup_checks, Agent, AgentError, Config, StandaloneConnection};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used when the control plane gives up, so a supervisor restarts us.
const FATAL_EXIT: u8 = 2;

/// Relay agent - adaptive streaming with self-healing recovery
#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source URL to start streaming immediately
    #[arg(short, long)]
    source: Option<String>,

    /// Override the health server listen address
    #[arg(long)]
    listen: Option<String>,

    /// Disable automatic recovery
    #[arg(long, default_value = "false")]
    no_recovery: bool,

    /// Skip the ffmpeg/ffprobe startup checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, relay_agent::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if args.no_recovery {
        config.recovery.enabled = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        match run_startup_checks(&config).await {
            Ok(report) => {
                if config.encode.hardware_acceleration && !report.hardware_encoder_available {
                    warn!("Hardware acceleration requested but unavailable, encoding in software");
                    config.encode.hardware_acceleration = false;
                }
            }
            Err(e) => {
                error!("Startup check failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let agent = match Agent::new(config, Arc::new(StandaloneConnection::new())) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.cancel();
        }
    });

    match agent.run(args.source).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(AgentError::Fatal(reason)) => {
            error!("Exiting for restart: {}", reason);
            ExitCode::from(FATAL_EXIT)
        }
        Err(e) => {
            error!("Agent error: {}", e);
            ExitCode::FAILURE
        }
    }
}
