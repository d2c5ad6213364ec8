use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tailsight::alerts::{
    ExpiringStore, InMemoryExpiringStore, LogMailer, Mailer, RedisExpiringStore, SmtpMailer,
};
use tailsight::analysis::{BroadcastTransport, HttpAnalysisClient, HttpRecommendationClient};
use tailsight::config::Config;
use tailsight::error::ConfigError;
use tailsight::storage::{InMemoryDirectory, InMemoryEventStore};
use tailsight::{Pipeline, PipelineParts};
use tokio_util::sync::CancellationToken;

/// Command-line arguments for the log tailing daemon
#[derive(Parser)]
#[command(
    name = "tailsight",
    about = "Log tailing daemon - event segmentation and threshold alerting",
    long_about = "Follows growing server log files, groups lines into event chunks, forwards \
                  them to an analysis service and mails deduplicated alerts when keywords or \
                  error volumes cross their thresholds."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long, help = "Validate the configuration file and exit")]
    check: bool,
}

impl Cli {
    /// Validate the CLI arguments
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            } else if self.check {
                return Err(format!(
                    "Configuration file not found: {}",
                    config_path.display()
                ));
            }
        } else if self.check {
            return Err("--check requires --config".to_string());
        }

        Ok(())
    }
}

/// Load the configuration, falling back to defaults when it is missing or invalid
fn load_config(config_path: Option<&PathBuf>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Ok(default_config())
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Ok(default_config())
                }
            }
        }
        None => {
            info!("Using default configuration");
            Ok(default_config())
        }
    }
}

fn default_config() -> Config {
    let mut config = Config::default();
    config.apply_overrides(|name| std::env::var(name).ok());
    config
}

/// Connect the real collaborators described by the configuration
async fn connect(config: &Config) -> anyhow::Result<(PipelineParts, Arc<BroadcastTransport>)> {
    let silence_store: Arc<dyn ExpiringStore> = match &config.alerts.redis_url {
        Some(url) => Arc::new(
            RedisExpiringStore::connect(url)
                .await
                .with_context(|| format!("Failed to connect to silence store at {}", url))?,
        ),
        None => {
            info!("No Redis URL configured, silence records are kept in memory");
            Arc::new(InMemoryExpiringStore::new())
        }
    };

    let mailer: Arc<dyn Mailer> = match &config.alerts.smtp {
        Some(smtp) => Arc::new(SmtpMailer::from_config(smtp)?),
        None => {
            warn!("No SMTP relay configured, alerts will only be logged");
            Arc::new(LogMailer::new())
        }
    };

    let timeout = Duration::from_secs(config.collaborators.timeout_seconds);
    let analysis = Arc::new(HttpAnalysisClient::new(
        config.collaborators.analysis_url.clone(),
        timeout,
    )?);
    let recommendations = Arc::new(HttpRecommendationClient::new(
        config.collaborators.recommendation_url.clone(),
        timeout,
    )?);
    let transport = Arc::new(BroadcastTransport::default());

    let parts = PipelineParts {
        directory: Arc::new(InMemoryDirectory::from_config(config)),
        store: Arc::new(InMemoryEventStore::new()),
        silence_store,
        mailer,
        analysis,
        recommendations,
        transport: transport.clone(),
    };
    Ok((parts, transport))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    if cli.check {
        // validate() guarantees a config path in check mode
        let path = cli.config.as_ref().context("--check requires --config")?;
        match Config::from_file(path) {
            Ok(config) => {
                println!(
                    "Configuration OK: {} server(s), analysis at {}",
                    config.servers.len(),
                    config.collaborators.analysis_url
                );
                return Ok(());
            }
            Err(e) => {
                error!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        }
    }

    info!("Starting tailsight");
    let config = load_config(cli.config.as_ref())?;
    let root = CancellationToken::new();

    let (parts, transport) = connect(&config).await?;
    let pipeline = Pipeline::new(config, parts, root.clone());

    // Live subscriber: echo pushed events at debug level
    let mut subscriber = transport.subscribe();
    let echo_token = root.child_token();
    let echo = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = echo_token.cancelled() => break,
                message = subscriber.recv() => match message {
                    Ok(message) => log::debug!(
                        "[{}] {} {}: {}",
                        message.topic,
                        message.event.level,
                        message.event.source,
                        message.event.message
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event echo lagged, {} event(s) skipped", missed)
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let signal_token = root.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal_token.cancel();
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    pipeline.start_servers().await;
    let mut handles = pipeline.spawn_background();
    handles.push(echo);

    info!("tailsight is running. Press Ctrl+C to stop.");
    root.cancelled().await;

    pipeline.shutdown(handles).await;
    info!("tailsight shutdown complete");
    Ok(())
}
