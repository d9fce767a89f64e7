use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camwatch::channel::{ChannelClient, ChannelEvent};
use camwatch::config::{AppConfig, ConfigStore};
use camwatch::events::SessionEventKind;
use camwatch::supervisor::{CameraSupervisor, HttpBackend};
use camwatch::utils::redact_url;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camwatch command line arguments
#[derive(Parser, Debug)]
#[command(name = "camwatch")]
#[command(version, about = "Playback supervisor for live HLS camera streams", long_about = None)]
struct CliArgs {
    /// Data directory path (default: /etc/camwatch)
    #[arg(short = 'd', long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the event channel and keep upstream streams healthy
    Watch {
        /// Event channel endpoint (overrides database config)
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,

        /// Event channel auth token (overrides database config)
        #[arg(long, value_name = "TOKEN", env = "CAMWATCH_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Backend base URL for stream control and error reports
        #[arg(long, value_name = "URL")]
        backend_url: Option<String>,

        /// Backend bearer token
        #[arg(long, value_name = "TOKEN", env = "CAMWATCH_BACKEND_TOKEN", hide_env_values = true)]
        backend_token: Option<String>,
    },

    /// Print the stored configuration as JSON (secrets omitted)
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camwatch v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("camwatch.db")).await?;

    match args.command {
        Command::ShowConfig => {
            let mut config = (*config_store.get()).clone();
            config.channel.auth_token = None;
            config.backend.api_token = None;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Watch {
            endpoint,
            token,
            backend_url,
            backend_token,
        } => {
            // CLI overrides are persisted, except secrets
            if endpoint.is_some() || backend_url.is_some() {
                config_store
                    .update(|config| {
                        if let Some(endpoint) = endpoint {
                            config.channel.endpoint = endpoint;
                        }
                        if let Some(url) = backend_url {
                            config.backend.base_url = url;
                        }
                    })
                    .await?;
            }

            let mut config = (*config_store.get()).clone();
            if token.is_some() {
                config.channel.auth_token = token;
            }
            if backend_token.is_some() {
                config.backend.api_token = backend_token;
            }

            watch(config).await
        }
    }
}

async fn watch(config: AppConfig) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut supervisor = CameraSupervisor::new(config.playback.clone());
    if config.backend.is_enabled() {
        let backend = Arc::new(HttpBackend::new(&config.backend)?);
        tracing::info!("Backend: {}", redact_url(&config.backend.base_url));
        supervisor = supervisor
            .with_stream_control(backend.clone())
            .with_error_reporter(backend);
    } else {
        tracing::warn!("No backend configured, frozen streams will not be restarted");
    }
    let supervisor = Arc::new(supervisor);

    let reporting = tokio::spawn(supervisor.clone().run_reporting(shutdown_tx.subscribe()));

    let mut session_events = supervisor.subscribe();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let session_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = session_events.recv() => match event {
                    Ok(event) => match event.kind {
                        SessionEventKind::Freeze { anomaly } => {
                            tracing::info!("[{}] freeze: {:?}", event.session_id, anomaly)
                        }
                        SessionEventKind::Recover => {
                            tracing::info!("[{}] recovered", event.session_id)
                        }
                        SessionEventKind::Error { reason } => {
                            tracing::warn!("[{}] error: {}", event.session_id, reason)
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Session log lagged by {} events", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    // Channel handlers run on the socket task; hand events to the supervisor
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let client = ChannelClient::new(config.channel.clone());
    let _subscription = client.on(move |event| {
        event_tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("supervisor stopped"))
    });

    let handler = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                tracing::debug!("Channel event: {}", event.event_type());
                if let Err(e) = supervisor.handle_channel_event(&event).await {
                    tracing::warn!("Failed to handle {} event: {}", event.event_type(), e);
                }
            }
        })
    };

    client.connect(|connected| {
        if connected {
            tracing::info!("Event channel online");
        } else {
            tracing::warn!("Event channel offline");
        }
    })?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    client.disconnect().await;
    let _ = shutdown_tx.send(());
    let _ = reporting.await;
    let _ = session_log.await;
    handler.abort();

    for camera_id in supervisor.camera_ids().await {
        if let Err(e) = supervisor.close(&camera_id).await {
            tracing::warn!("Failed to close camera {}: {}", camera_id, e);
        }
    }

    tracing::info!("camwatch shutdown complete");
    Ok(())
}

/// Initialize logging with CLI arguments
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camwatch=error",
        LogLevel::Warn => "camwatch=warn",
        LogLevel::Info => "camwatch=info",
        LogLevel::Verbose => "camwatch=debug,tokio_tungstenite=info",
        LogLevel::Debug => "camwatch=debug,tokio_tungstenite=debug",
        LogLevel::Trace => "camwatch=trace,tokio_tungstenite=debug,reqwest=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CAMWATCH_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/camwatch")
}
