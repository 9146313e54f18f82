//! FanBridge - one MQTT connection fanned out to WebSocket and SSE clients
//!
//! Usage:
//!   fanbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --broker-url <URL>    Broker URL (default: mqtt://localhost:1883)
//!   -t, --topic <TOPIC>       Topic bridged to downstream clients
//!   --http-bind <ADDR>        HTTP (SSE, health, metrics) bind address
//!   --ws-bind <ADDR>          WebSocket bind address (optional)
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use fanbridge::config::{Config, Settings};
use fanbridge::gateway::{self, HttpGateway, WebSocketGateway};
use fanbridge::{
    Broadcaster, BrokerConnection, ConnectionBridge, ConnectionHandler, Metrics,
    SubscriptionMultiplexer, TypedConsumer,
};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// FanBridge - shared MQTT connection for many downstream consumers
#[derive(Parser, Debug)]
#[command(name = "fanbridge")]
#[command(author = "FanBridge Contributors")]
#[command(version)]
#[command(about = "Single shared MQTT connection fanned out to WebSocket and SSE clients")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker URL, overrides MQTT_BROKER_URL and broker.url
    #[arg(short, long)]
    broker_url: Option<String>,

    /// Topic bridged to every downstream connection
    #[arg(short, long)]
    topic: Option<String>,

    /// HTTP bind address (Server-Sent Events, /health, /metrics)
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    /// WebSocket bind address (optional, enables the WebSocket gateway)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Directory containing environments/*.env files
    #[arg(long, default_value = ".")]
    env_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let settings = Settings::load(&args.env_dir)?;
    let mut config = match &args.config {
        Some(path) => Config::load_with_settings(path, &settings)?,
        None => Config::from_env_with_settings(&settings)?,
    };

    // CLI args override everything else
    if let Some(url) = &args.broker_url {
        config.broker.url = url.clone();
    }
    if let Some(topic) = &args.topic {
        config.gateway.topic = topic.clone();
    }
    if let Some(addr) = args.http_bind {
        config.gateway.http_bind = addr;
    }
    if args.ws_bind.is_some() {
        config.gateway.ws_bind = args.ws_bind;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting FanBridge");
    info!("  Broker: {} (client id '{}')", config.broker.url, config.broker.client_id);
    info!("  Topic: {}", config.gateway.topic);
    info!(
        "  Event stream: http://{}{}",
        config.gateway.http_bind, config.gateway.sse_path
    );
    match config.gateway.ws_bind {
        Some(addr) => info!("  WebSocket: ws://{}{}", addr, config.gateway.ws_path),
        None => info!("  WebSocket: disabled"),
    }

    let metrics = if config.metrics.enabled {
        info!("  Metrics: enabled (http://{}/metrics)", config.gateway.http_bind);
        Some(Arc::new(Metrics::new()))
    } else {
        info!("  Metrics: disabled");
        None
    };

    // Broker connection and multiplexer
    let (connection, events) = BrokerConnection::connect(&config.broker);
    let connection = match metrics {
        Some(ref metrics) => connection.with_metrics(metrics.clone()),
        None => connection,
    };
    let multiplexer =
        SubscriptionMultiplexer::start_with_metrics(Arc::new(connection), events, metrics.clone());

    // Consumer and bridge for the configured topic
    let consumer: Arc<TypedConsumer<serde_json::Value>> = Arc::new(TypedConsumer::new(
        multiplexer.clone(),
        config.gateway.topic.clone(),
    ));
    let mut broadcaster = Broadcaster::from_config(&config.broadcast);
    if let Some(ref metrics) = metrics {
        broadcaster = broadcaster.with_metrics(metrics.clone());
    }
    let bridge = ConnectionBridge::new(consumer, config.gateway.event_kind.clone())
        .with_broadcaster(Arc::new(broadcaster));
    bridge.attach_lifecycle(multiplexer.connection());
    let handler: Arc<dyn ConnectionHandler> = Arc::new(bridge);

    // Gateways
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let listener = gateway::bind(config.gateway.http_bind).await?;
    let mut http = HttpGateway::new(handler.clone(), config.gateway.sse_path.clone())
        .with_keep_alive(config.gateway.sse_keep_alive_duration());
    if let Some(ref metrics) = metrics {
        http = http.with_metrics(metrics.clone());
    }
    let http_task = tokio::spawn(http.serve(listener, shutdown_tx.subscribe()));

    let ws_task = match config.gateway.ws_bind {
        Some(addr) => {
            let listener = gateway::bind(addr).await?;
            let ws = WebSocketGateway::new(handler.clone(), config.gateway.ws_path.clone());
            Some(tokio::spawn(ws.serve(listener, shutdown_tx.subscribe())))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(());
    for task in std::iter::once(http_task).chain(ws_task) {
        match task.await {
            Ok(Err(e)) => error!("Gateway error: {}", e),
            Err(e) => error!("Gateway task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    multiplexer.shutdown().await;
    info!("FanBridge stopped");
    Ok(())
}
