mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use dispatcher::errors::DispatcherError;
use dispatcher::keys::{KeyError, KeystoreBuilder, generate_signing_key};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::{MetricDef, MetricType};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "workbench", about = "Authenticated service-call dispatcher")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "workbench.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the dispatcher and admin listeners
    Serve,
    /// Check the configuration and exit
    Validate,
    /// Print the URL a service name resolves to
    Resolve { address: String },
    /// Write a keystore with a fresh signing key pair and encryption key
    GenerateKeystore {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, env = "WORKBENCH_KEYSTORE_PASSWORD")]
        keystore_password: String,
        #[arg(long, default_value = "signing")]
        signing_alias: String,
        #[arg(long, env = "WORKBENCH_SIGNING_KEY_PASSWORD")]
        signing_password: String,
        #[arg(long, default_value = "encrypting")]
        encrypting_alias: String,
    },
    /// Write a fresh foundational API key file
    GenerateTokenKey {
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error(transparent)]
    Validation(#[from] dispatcher::config::ValidationError),
    #[error(transparent)]
    Services(#[from] resolver::config::ConfigError),
    #[error(transparent)]
    Resolver(#[from] resolver::ResolverError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not set up statsd: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "workbench exited with an error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        CliCommand::Serve => {
            let config = Config::from_file(&cli.config)?;
            let _sentry = init_logging(&config.common);
            init_metrics(&config.common)?;

            tracing::info!(config = %cli.config.display(), "starting workbench");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(dispatcher::run(config.dispatcher))?;
        }
        CliCommand::Validate => {
            let config = Config::from_file(&cli.config)?;
            config.dispatcher.validate()?;
            config.dispatcher.services.build_resolver()?;
            println!("{} is valid", cli.config.display());
        }
        CliCommand::Resolve { address } => {
            let config = Config::from_file(&cli.config)?;
            let resolver = config.dispatcher.services.build_resolver()?;
            println!("{}", resolver.resolve_address(&address)?);
        }
        CliCommand::GenerateKeystore {
            output,
            keystore_password,
            signing_alias,
            signing_password,
            encrypting_alias,
        } => {
            KeystoreBuilder::new()
                .key_pair(&signing_alias, &generate_signing_key(), &signing_password)?
                .secret_key(
                    &encrypting_alias,
                    &dispatcher::crypto::random_key(),
                    &keystore_password,
                )?
                .write(&output, &keystore_password)?;
            println!("wrote keystore to {}", output.display());
        }
        CliCommand::GenerateTokenKey { output } => {
            dispatcher::token::write_key_file(&output)?;
            println!("wrote foundational API key to {}", output.display());
        }
    }
    Ok(())
}

fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let filter = common
        .logging
        .as_ref()
        .map_or("info", |logging| logging.filter.as_str());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let guard = common
        .logging
        .as_ref()
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();
    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(metrics_config) = &common.metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
        .build(Some(&metrics_config.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|_| CliError::RecorderInstalled)?;

    for def in dispatcher::metrics_defs::ALL_METRICS
        .iter()
        .chain(resolver::metrics_defs::ALL_METRICS)
    {
        describe(def);
    }
    tracing::info!(
        host = %metrics_config.statsd_host,
        port = metrics_config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

fn describe(def: &MetricDef) {
    match def.metric_type {
        MetricType::Counter => metrics::describe_counter!(def.name, def.description),
        MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
        MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
    }
}
