mod config;

use clap::Parser;
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "redcap_bridge";

/// Registers REDCap participants in the Management Portal
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::discover(cli.config).and_then(|path| Config::from_file(&path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let logging = config.logging.unwrap_or_default();
    let dsn = match logging
        .sentry_dsn
        .as_deref()
        .map(str::parse::<sentry::types::Dsn>)
        .transpose()
    {
        Ok(dsn) => dsn,
        Err(e) => {
            eprintln!("Invalid Sentry DSN: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _sentry = dsn.map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        })
    });
    init_tracing(&logging);

    if let Some(metrics) = &config.metrics {
        if let Err(e) = init_metrics(metrics) {
            tracing::error!(error = %e, "Could not install the StatsD exporter");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Could not start the Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting redcap-bridge");
    match runtime.block_on(integrator::run(config.integrator)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Integrator stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();
}

#[derive(thiserror::Error, Debug)]
enum MetricsError {
    #[error("statsd exporter: {0}")]
    Exporter(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    shared::metrics_defs::describe_all(integrator::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to StatsD"
    );
    Ok(())
}
