mod token_commands;

use std::path::PathBuf;

use {
    clap::Parser,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tokenward", version, about = "Tokenward: OAuth token lifecycle manager")]
struct Cli {
    #[command(subcommand)]
    command: token_commands::TokenAction,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of discovering one.
    #[arg(long, global = true, env = "TOKENWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Identity whose credentials to operate on.
    #[arg(long, global = true, env = "TOKENWARD_IDENTITY", default_value = "default")]
    identity: String,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Logs go to stderr so command output stays pipeable.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "tokenward starting");

    let config = tokenward_config::load_or_discover(cli.config.as_deref())?;
    info!(
        providers = config.providers.providers.len(),
        connections = config.connections.len(),
        "config loaded"
    );

    let identity = tokenward_oauth::Identity::new(cli.identity);
    token_commands::handle(cli.command, &config, &identity).await
}
