use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use order_chat_core::{timing::HEARTBEAT_INTERVAL, SessionRecord, DEFAULT_SESSION_TTL};
use redis::aio::ConnectionManager;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{info, warn};

mod auth;
mod publisher;
mod registry;
mod routes;
mod store;
mod stream;
mod telemetry;

use registry::{
    ConnectionRegistry, RegistryConfig, DEFAULT_MAX_SINKS_PER_CONVERSATION, DEFAULT_SINK_BUFFER,
};
use store::{MemoryMessageStore, MemorySessionStore, RedisSessionStore, SharedSessionStore};

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    redis_url: Option<String>,
    heartbeat_interval: Duration,
    registry: RegistryConfig,
    shutdown_grace: Duration,
    dev_session: Option<String>,
}

#[derive(Debug, Parser)]
#[command(
    name = "order-chat-server",
    author,
    version,
    about = "Realtime relay for order chat conversations"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "ORDER_CHAT_LISTEN_ADDR", default_value = "127.0.0.1:8787")]
    listen_addr: String,

    /// Redis connection URI holding web sessions. Sessions stay in memory when unset.
    #[arg(long, env = "ORDER_CHAT_REDIS_URL")]
    redis_url: Option<String>,

    /// Interval between heartbeat frames on every open stream.
    #[arg(
        long,
        env = "ORDER_CHAT_HEARTBEAT_INTERVAL_MS",
        default_value_t = HEARTBEAT_INTERVAL.as_millis() as u64
    )]
    heartbeat_interval_ms: u64,

    /// Upper bound on concurrent streams per conversation.
    #[arg(
        long,
        env = "ORDER_CHAT_MAX_SINKS_PER_CONVERSATION",
        default_value_t = DEFAULT_MAX_SINKS_PER_CONVERSATION
    )]
    max_sinks_per_conversation: usize,

    /// Frames buffered per stream before the subscriber counts as stalled.
    #[arg(long, env = "ORDER_CHAT_SINK_BUFFER", default_value_t = DEFAULT_SINK_BUFFER)]
    sink_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "ORDER_CHAT_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Seed a session with this id (development mode only).
    #[arg(long, env = "ORDER_CHAT_DEV_SESSION")]
    dev_session: Option<String>,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.heartbeat_interval_ms == 0 {
            bail!("heartbeat interval must be positive");
        }
        if cli.sink_buffer == 0 || cli.max_sinks_per_conversation == 0 {
            bail!("sink buffer and per-conversation limit must be positive");
        }
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url.filter(|url| !url.is_empty()),
            heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
            registry: RegistryConfig {
                sink_buffer: cli.sink_buffer,
                max_sinks_per_conversation: cli.max_sinks_per_conversation,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            dev_session: cli.dev_session.filter(|id| !id.is_empty()),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
        max_sinks_per_conversation = config.registry.max_sinks_per_conversation,
        "starting order-chat server"
    );

    let result = run(config, telemetry.metrics_handle()).await;
    telemetry.shutdown();
    result
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let sessions = build_session_store(&config).await?;
    let registry = ConnectionRegistry::new(config.registry.clone());
    let state = Arc::new(
        routes::AppState::new(
            registry.clone(),
            config.heartbeat_interval,
            sessions,
            Arc::new(MemoryMessageStore::new()),
        )
        .with_metrics(metrics),
    );
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("order-chat listening on {}", config.listen_addr);

    // Event streams never finish on their own, so shutdown has to end them.
    let shutdown_registry = registry.clone();
    let graceful = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let closed = shutdown_registry.close_all();
        info!(closed, "closing open chat streams");
    });
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn build_session_store(config: &ServerConfig) -> Result<SharedSessionStore> {
    let dev_session = config.dev_session.as_deref().map(|session_id| {
        SessionRecord::issue("dev-staff", DEFAULT_SESSION_TTL)
            .with_id(session_id)
            .with_username("dev")
    });

    match &config.redis_url {
        Some(url) => {
            let client =
                redis::Client::open(url.as_str()).context("failed to create redis client")?;
            let manager = ConnectionManager::new(client)
                .await
                .context("failed to connect to redis")?;
            let store = RedisSessionStore::new(manager);
            if let Some(session) = &dev_session {
                store
                    .insert(session)
                    .await
                    .context("failed to seed development session")?;
                warn!(session_id = %session.session_id, "seeded development session");
            }
            Ok(Arc::new(store))
        }
        None => {
            warn!("no redis url configured; sessions are held in memory");
            let store = MemorySessionStore::new();
            if let Some(session) = dev_session {
                warn!(session_id = %session.session_id, "seeded development session");
                store.insert(session);
            }
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
