//! permsync node - main binary
//!
//! Runs the permission engine against the configured storage backend and
//! invalidation transport, or performs one-shot maintenance:
//! - `export` / `import` for migrating data between backends
//! - `check` for evaluating a single permission from the shell

use anyhow::Result;
use clap::{Parser, Subcommand};
use permsync_node::{NodeConfig, PermsNode};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

/// permsync node CLI
#[derive(Parser)]
#[command(name = "permsync-node")]
#[command(about = "permsync permission engine host")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/permsync/node.toml", env = "PERMSYNC_CONFIG")]
    config: PathBuf,

    /// Override the configured log level with debug
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand (default: serve)
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted
    Serve,

    /// Write every stored subject to a JSON file
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace stored subjects with those in a JSON file
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Evaluate one permission, e.g. `check group:vip fly.use -c world=nether`
    Check {
        /// `user:<uuid>` or `group:<name>`
        subject: String,
        permission: String,
        /// Runtime context as `key=value,key=value`
        #[arg(short, long, default_value = "")]
        context: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = NodeConfig::load(&cli.config)?;
    config.validate()?;

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { config.node.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},permsync_engine={}", log_level, log_level).into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Loaded configuration from {:?}", cli.config);
    let node = PermsNode::new(config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&node).await?,
        Command::Export { output } => {
            let count = node.export(&output).await?;
            println!("exported {} subjects to {}", count, output.display());
        }
        Command::Import { input } => {
            let count = node.import(&input).await?;
            println!("imported {} subjects from {}", count, input.display());
        }
        Command::Check {
            subject,
            permission,
            context,
        } => {
            let result = node.check(&subject, &permission, &context).await?;
            println!("{} {} -> {:?}", subject, permission, result);
        }
    }

    node.shutdown().await?;
    info!("Node stopped gracefully");
    Ok(())
}

/// Run until Ctrl+C or SIGTERM
async fn serve(node: &PermsNode) -> Result<()> {
    info!("Starting permsync node v{}", env!("CARGO_PKG_VERSION"));
    let token = node.shutdown_token();

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!("Node error: {}", e);
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal (SIGTERM)");
        }
    }

    token.cancel();
    Ok(())
}

/// Cross-platform shutdown signal handling
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    // On non-Unix systems, only Ctrl+C is supported
    std::future::pending::<()>().await
}
