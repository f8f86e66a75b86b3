//! chatrelay - broadcast chat relay
//!
//! `serve` runs the relay; `chat`, `bot` and `bench` are clients for it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::{
    client::{bench, bot, interactive, BenchOptions, BotOptions},
    config::ConfigManager,
    management::ManagementServer,
    metrics::RelayMetrics,
    Config, RelayServer, ShutdownCoordinator,
};

/// CLI arguments for chatrelay
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(about = "chatrelay - broadcast chat relay over length-prefixed TCP frames")]
#[command(version)]
#[command(long_about = "
chatrelay - broadcast chat relay over length-prefixed TCP frames

Every message a client sends is relayed to every other connected client.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CHATRELAY_BIND_ADDR            - Relay bind address (e.g., 0.0.0.0:5656)
  CHATRELAY_SEND_RETRY_INTERVAL  - Send-loop wake-up interval (e.g., 1s, 250ms)
  CHATRELAY_TCP_NODELAY          - Disable Nagle on accepted sockets (true/false)
  CHATRELAY_SERVER_ADDR          - Relay address used by the clients
  CHATRELAY_NAME                 - Display name used by `chat`
  CHATRELAY_LOG_LEVEL            - Log level (trace, debug, info, warn, error)
  CHATRELAY_MANAGEMENT_ENABLED   - Enable the management API (true/false)
  CHATRELAY_MANAGEMENT_ADDR      - Management API address (e.g., 127.0.0.1:9090)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides monitoring.log_level
    #[arg(long, global = true, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, global = true, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server
    Serve {
        /// Bind address (overrides config file)
        #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:5656)")]
        bind: Option<String>,

        /// Port to bind to (overrides config file)
        #[arg(short, long, help = "Port to bind to")]
        port: Option<u16>,

        /// Serve the management API on this address
        #[arg(long, help = "Management API address (e.g., 127.0.0.1:9090)")]
        management_addr: Option<SocketAddr>,
    },

    /// Join the relay and chat from the terminal
    Chat {
        #[arg(short, long, help = "Relay address")]
        server: Option<SocketAddr>,

        #[arg(short, long, help = "Display name")]
        name: Option<String>,
    },

    /// Connect scripted bots that post messages
    Bot {
        #[arg(short, long, help = "Relay address")]
        server: Option<SocketAddr>,

        #[arg(long, default_value_t = 3, help = "Number of bots")]
        bots: usize,

        #[arg(long, default_value_t = 10, help = "Messages per bot")]
        messages: usize,

        #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration, help = "Delay between messages")]
        interval: Duration,

        #[arg(long, default_value = "bot", help = "Bot name prefix")]
        name_prefix: String,

        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, help = "Listen time after the last message")]
        linger: Duration,
    },

    /// Measure relay throughput with one sender and many receivers
    Bench {
        #[arg(short, long, help = "Relay address")]
        server: Option<SocketAddr>,

        #[arg(long, default_value_t = 4, help = "Number of receivers")]
        receivers: usize,

        #[arg(long, default_value_t = 1000, help = "Messages to send")]
        messages: usize,

        #[arg(long, default_value_t = 64, help = "Message text size in bytes")]
        payload_size: usize,

        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration, help = "Give up after this long")]
        timeout: Duration,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults.
    // Tracing is installed afterwards so monitoring.log_level can take effect.
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    let log_level = args.log_level.as_deref();
    match &args.command {
        Command::Serve {
            bind,
            port,
            management_addr,
        } => config.merge_with_cli_args(
            bind.as_deref(),
            *port,
            None,
            None,
            *management_addr,
            log_level,
        )?,
        Command::Chat { server, name } => {
            config.merge_with_cli_args(None, None, *server, name.as_deref(), None, log_level)?
        }
        Command::Bot { server, .. } | Command::Bench { server, .. } => {
            config.merge_with_cli_args(None, None, *server, None, None, log_level)?
        }
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config, args.verbose)?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Send retry interval: {:?}", config.server.send_retry_interval);
        info!("  Relay address for clients: {}", config.client.server_addr);
        info!(
            "  Management API: {}",
            if config.monitoring.management_api.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        return Ok(());
    }

    match args.command {
        Command::Serve { .. } => serve(config).await,
        Command::Chat { .. } => {
            interactive::run(config.client.server_addr, &config.client.name).await
        }
        Command::Bot {
            bots,
            messages,
            interval,
            name_prefix,
            linger,
            ..
        } => {
            let report = bot::run(BotOptions {
                server_addr: config.client.server_addr,
                bots,
                messages,
                interval,
                name_prefix,
                linger,
            })
            .await?;
            println!(
                "{} bots sent {} messages and received {}",
                report.bots, report.sent, report.received
            );
            Ok(())
        }
        Command::Bench {
            receivers,
            messages,
            payload_size,
            timeout,
            json,
            ..
        } => {
            let report = bench::run(BenchOptions {
                server_addr: config.client.server_addr,
                receivers,
                messages,
                payload_size,
                timeout,
            })
            .await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!(
                    "delivered {}/{} messages in {} ms ({:.0} msg/s, {:.0} B/s, {} out of order)",
                    report.messages_delivered,
                    report.messages_sent * report.receivers as u64,
                    report.elapsed_ms,
                    report.messages_per_second,
                    report.bytes_per_second,
                    report.out_of_order
                );
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting chatrelay v{}", env!("CARGO_PKG_VERSION"));

    let shutdown_coordinator = ShutdownCoordinator::new();
    let metrics = Arc::new(RelayMetrics::new()?);
    let server = Arc::new(RelayServer::new(config.server.clone(), metrics));

    server
        .start(config.server.bind_addr.port(), shutdown_coordinator.signal())
        .await?;

    let management_handle = if config.monitoring.management_api.enabled {
        info!(
            "Starting management API server on {}",
            config.monitoring.management_api.bind_addr
        );

        let management_server = ManagementServer::new(
            config.monitoring.management_api.bind_addr,
            Arc::clone(&server),
            config.monitoring.metrics_enabled,
        );
        let shutdown = shutdown_coordinator.signal();

        Some(tokio::spawn(async move {
            if let Err(e) = management_server.start(shutdown).await {
                error!("Management API server error: {:#}", e);
            }
        }))
    } else {
        info!("Management API server disabled");
        None
    };

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating shutdown...");
    server.stop().await;

    if let Some(handle) = management_handle {
        if let Err(e) = handle.await {
            error!("Management API task failed: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();

    Ok(())
}
