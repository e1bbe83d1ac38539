mod config_commands;
mod shadow_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    mender_metrics::{MetricsRecorderConfig, init_metrics},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "mender", about = "Mender: verify Kubernetes remediations in a shadow sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (default: ./mender.toml, then ~/.config/mender/).
    #[arg(long, global = true, env = "MENDER_CONFIG")]
    config: Option<PathBuf>,

    /// Print collected metrics in Prometheus format to stderr on exit.
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Shadow environment lifecycle.
    Shadow {
        #[command(subcommand)]
        action: shadow_commands::ShadowAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

/// Initialise tracing. Logs go to stderr so stdout stays machine-readable.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "mender starting");

    match cli.command {
        Commands::Config { action } => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
        Commands::Shadow { action } => {
            let (config, path) = config_commands::load(cli.config.as_deref())?;
            if let Some(path) = path {
                info!(path = %path.display(), "loaded config");
            }
            config_commands::ensure_valid(&config)?;
            let metrics = init_metrics(MetricsRecorderConfig {
                enabled: config.metrics.enabled,
                global_labels: config.metrics.labels.clone(),
            })?;
            let result = shadow_commands::handle_shadow(action, &config).await;
            if cli.print_metrics {
                eprint!("{}", metrics.render());
            }
            result
        },
    }
}
