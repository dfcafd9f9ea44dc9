use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whip_broadcast::config::ConfigStore;
use whip_broadcast::events::EventBus;
use whip_broadcast::state::AppState;
use whip_broadcast::web;
use whip_broadcast::webrtc::{IceServer, RtcPeerFactory};

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

/// WHIP broadcast server command line arguments
#[derive(Parser, Debug)]
#[command(name = "whip-broadcast")]
#[command(version, about = "WHIP ingest server with WebRTC viewer fanout", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory path (default: ./data)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Path prefix of the WHIP API (overrides database config)
    #[arg(long, value_name = "PREFIX")]
    prefix: Option<String>,

    /// Externally reachable base URL used in Location headers
    #[arg(long, value_name = "URL")]
    public_url: Option<String>,

    /// Key that unlocks ICE server Link headers
    #[arg(long, env = "API_KEY", value_name = "KEY")]
    api_key: Option<String>,

    /// ICE server as URL[;USERNAME;CREDENTIAL] (repeatable)
    #[arg(long = "ice-server", value_name = "SERVER")]
    ice_servers: Vec<IceServer>,

    /// Bounded wait for ICE gathering (ms)
    #[arg(long, env = "ICE_GATHERING_TIMEOUT", value_name = "MS")]
    ice_gathering_timeout: Option<u64>,

    /// Time a viewer gets to reach connected (ms)
    #[arg(long, value_name = "MS")]
    connection_timeout: Option<u64>,

    /// Preroll manifest URL applied to new channels
    #[arg(long, value_name = "URL")]
    preroll_url: Option<String>,

    /// Disable the viewer fanout endpoints
    #[arg(long)]
    no_broadcaster: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting WHIP broadcast v{}", env!("CARGO_PKG_VERSION"));

    // Determine data directory (CLI arg takes precedence)
    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("whip.db")).await?;
    apply_overrides(&config_store, &args);
    let config = config_store.get();

    let events = Arc::new(EventBus::new());
    spawn_event_logger(&events);

    let state = AppState::new(config_store, Arc::new(RtcPeerFactory::new()), events);

    let app = web::create_router(state.clone());

    let bind_ip: std::net::IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.web.bind_address, e))?;
    let addr = SocketAddr::new(bind_ip, config.web.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "WHIP endpoint at {}{}/whip",
        config.web.server_address(),
        config.web.normalized_prefix()
    );

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    state.cleanup().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Apply command line overrides for this process only
fn apply_overrides(store: &ConfigStore, args: &CliArgs) {
    let mut config = (*store.get()).clone();

    if let Some(address) = &args.address {
        config.web.bind_address = address.clone();
    }
    if let Some(port) = args.port {
        config.web.http_port = port;
    }
    if let Some(prefix) = &args.prefix {
        config.web.prefix = prefix.clone();
    }
    if let Some(url) = &args.public_url {
        config.web.public_url = Some(url.clone());
    }
    if let Some(key) = &args.api_key {
        config.whip.api_key = Some(key.clone());
    }
    if !args.ice_servers.is_empty() {
        config.whip.ice_servers = args.ice_servers.clone();
        config.broadcaster.ice_servers = args.ice_servers.clone();
    }
    if let Some(ms) = args.ice_gathering_timeout {
        config.webrtc.ice_gathering_timeout_ms = ms;
    }
    if let Some(ms) = args.connection_timeout {
        config.webrtc.connection_timeout_ms = ms;
    }
    if let Some(url) = &args.preroll_url {
        config.broadcaster.preroll_url = Some(url.clone());
    }
    if args.no_broadcaster {
        config.broadcaster.enabled = false;
    }

    store.set_runtime(config);
}

/// Log lifecycle events published on the bus
fn spawn_event_logger(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = event.event_name(), "{}", json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "whip_broadcast=error,tower_http=error",
        LogLevel::Warn => "whip_broadcast=warn,tower_http=warn",
        LogLevel::Info => "whip_broadcast=info,tower_http=info",
        LogLevel::Verbose => "whip_broadcast=debug,tower_http=info",
        LogLevel::Debug => "whip_broadcast=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "whip_broadcast=trace,tower_http=debug,webrtc=debug",
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
    if let Ok(path) = std::env::var("WHIP_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("data")
}
