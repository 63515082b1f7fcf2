mod config;

use clap::{Args, Parser, Subcommand};
use config::{CommonConfig, Config};
use metrics_exporter_statsd::StatsdBuilder;
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "mediagate", about = "Media gateway racing upstream bot clients")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the gateway and admin listeners
    Run(ConfigArgs),
    /// Check a config file and exit
    Validate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_path: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Validate(args) => {
            let config = Config::from_file(&args.config_path)?;
            config.gateway.validate()?;
            config.gateway.engine.validate()?;
            println!("{} is valid", args.config_path.display());
            Ok(())
        }
        CliCommand::Run(args) => {
            let config = Config::from_file(&args.config_path)?;
            let _sentry = init_logging(&config.common);
            init_metrics(&config.common)?;

            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            runtime.block_on(gateway::run(config.gateway))?;
            Ok(())
        }
    }
}

/// Installs the fmt subscriber, plus the Sentry layer when a DSN is configured. The
/// returned guard flushes pending events on drop.
fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let guard = common.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), Box<dyn Error>> {
    let Some(metrics) = &common.metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port).build(Some("mediagate"))?;
    metrics::set_global_recorder(recorder).map_err(|e| e.to_string())?;

    shared::metrics_defs::describe_all(engine::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(gateway::metrics_defs::ALL_METRICS);
    tracing::info!(host = %metrics.statsd_host, port = metrics.statsd_port, "Metrics enabled");
    Ok(())
}
