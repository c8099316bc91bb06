//! knox-ssh - Entry point
//!
//! Parses CLI arguments, validates configuration, runs the SSH gateway on a
//! runtime sized by `--workers` and handles graceful shutdown.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use knox_ssh::config::{Args, Config};
use knox_ssh::error::Result;
use knox_ssh::server::SshGateway;

fn main() -> Result<()> {
    // Logs go to stderr; audit events use the "audit" target
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let args = Args::parse();

    // Validate and create config
    let config = Config::from_args(args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!("knox-ssh v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Topology: {}, auth mode: {:?}, tunnel user: {}",
        config.topology, config.auth_mode, config.tunnel_user
    );
    if let Some(ref template) = config.login_command {
        info!("Login command: {:?}", template);
    }

    let gateway = SshGateway::new(config)?;
    gateway.start().await?;

    wait_for_shutdown().await?;

    gateway.stop().await;
    info!("knox-ssh stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }
    Ok(())
}
