mod config_commands;
mod db_commands;
mod poll_commands;

use std::path::PathBuf;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    pollcast_config::PollcastConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "pollcast", about = "pollcast: one poll across many live channels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (overrides discovery of ./pollcast.toml and friends).
    #[arg(long, global = true, env = "POLLCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default when no subcommand is provided).
    Serve,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
    /// Drive polls on a running server.
    Polls {
        /// Server base URL (defaults to the configured bind address).
        #[arg(long, env = "POLLCAST_SERVER")]
        server: Option<String>,
        #[command(subcommand)]
        action: poll_commands::PollAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Config from `--config`, or from the standard locations.
fn load_config(cli: &Cli) -> anyhow::Result<(PollcastConfig, Option<String>)> {
    match &cli.config {
        Some(path) => {
            let config = pollcast_config::load_config(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok((config, Some(path.display().to_string())))
        },
        None => {
            let source = pollcast_config::find_config_file().map(|p| p.display().to_string());
            Ok((pollcast_config::discover_and_load(), source))
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let (config, source) = load_config(&cli)?;

    match cli.command {
        // Default: start the server when no subcommand is provided
        None | Some(Commands::Serve) => {
            info!(version = env!("CARGO_PKG_VERSION"), config = ?source, "pollcast starting");
            pollcast_gateway::start_gateway(config).await
        },
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, &config, source.as_deref())
        },
        Some(Commands::Db { action }) => db_commands::handle_db(action, &config).await,
        Some(Commands::Polls { server, action }) => {
            let server = server.unwrap_or_else(|| poll_commands::server_url(&config));
            poll_commands::handle_polls(action, &server).await
        },
    }
}
