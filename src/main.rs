// ExecGuard - Main Entry Point
//
// Subcommands:
// - serve: run the execution service
// - exec: run one command on a service through the client library
// - health: query a service's HealthCheck
// - check-config: load and validate the configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use execguard::client::{ClientError, ExecClient};
use execguard::config::Config;
use execguard::engine::ProcessEngine;
use execguard::rpc;
use execguard::service::{CommandRequest, ExecutionService, Uptime};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// ExecGuard: secure remote command execution
#[derive(Parser, Debug)]
#[command(name = "execguard")]
#[command(author = "ExecGuard Contributors")]
#[command(version)]
#[command(about = "Policy-enforced, time-bounded remote command execution", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/execguard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the execution service
    Serve {
        /// Port to listen on (overrides configuration)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (overrides configuration)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Execute a command on a running service
    Exec {
        /// Command line to run
        command: String,

        /// Timeout in seconds (0 = service default)
        #[arg(short, long, default_value_t = 0)]
        timeout: i32,

        /// Skip pattern and allowlist checks
        #[arg(long)]
        no_validate: bool,

        /// Service address (overrides configuration)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Query a running service's health
    Health {
        /// Service address (overrides configuration)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = execguard::logging::init(&config.logging, args.verbose) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    match run(args.command, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::load_from_path(path)
        }
        None => Config::load(),
    }
}

async fn run(command: Commands, mut config: Config) -> Result<ExitCode> {
    match command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec {
            command,
            timeout,
            no_validate,
            addr,
        } => {
            if let Some(addr) = addr {
                config.client.addr = addr;
            }
            exec(config, command, timeout, !no_validate).await
        }
        Commands::Health { addr } => {
            if let Some(addr) = addr {
                config.client.addr = addr;
            }
            health(config).await
        }
        Commands::CheckConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", text);
            println!("# configuration OK");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let addr = config.socket_addr()?;
    let validator = config.policy_validator()?;
    let policy_mode = validator.mode();
    let engine = Arc::new(ProcessEngine::new(config.engine_config()));
    let service = Arc::new(ExecutionService::new(
        config.service_config(),
        validator,
        engine,
        Uptime::start(),
    ));

    info!(
        "ExecGuard v{} starting (policy: {:?}, max concurrent: {})",
        env!("CARGO_PKG_VERSION"),
        policy_mode,
        service.max_concurrent()
    );

    let listener = rpc::bind(addr).await?;
    rpc::serve(listener, service, shutdown_signal()).await
}

async fn exec(config: Config, command: String, timeout: i32, validate: bool) -> Result<ExitCode> {
    let client = ExecClient::connect(config.client)?;
    debug!("Calling {}", client.config().addr);
    let request = CommandRequest::new(command)
        .with_timeout(timeout)
        .with_validation(validate);

    // Ctrl-C aborts the call
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let result = client.execute_with_cancel(request, cancel).await;
    client.close().await;

    match result {
        Ok(response) => {
            print!("{}", response.output);
            if !response.success {
                eprintln!("{}", response.error);
            }
            info!(
                "exit code {} in {:.3}s",
                response.exit_code, response.execution_time
            );
            Ok(exit_code_for(response.exit_code))
        }
        Err(ClientError::Cancelled) => {
            warn!("Cancelled");
            Ok(ExitCode::from(130))
        }
        Err(e) => Err(e.into()),
    }
}

async fn health(config: Config) -> Result<ExitCode> {
    let client = ExecClient::connect(config.client)?;
    let status = client.health().await;
    client.close().await;

    let status = status?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(match status.status {
        execguard::HealthState::Unhealthy => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Map a remote exit code onto a local one
fn exit_code_for(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
