mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use realtime_api::backend::Permissions;
use realtime_api::handlers::frappe::{self, FrappeHandler};
use realtime_api::{
    create_router, AppState, BackendAuthenticator, BackendClient, HandlerRegistry,
    StaticHandlerSource, TenantHandler,
};
use realtime_cluster::sync::{BrokerState, EventRouter, NamespaceHub, PublishRequest, RedisPubSub};
use realtime_core::{bootstrap::load_config, logging, Config};

#[derive(Parser, Debug)]
#[command(name = "realtime")]
#[command(about = "Multi-tenant realtime event relay", long_about = None)]
struct Args {
    /// Config file (YAML, JSON or TOML). Must exist when given.
    #[arg(long, short)]
    config: Option<String>,
}

/// Broker side of the relay; everything is `None` when Redis is not configured
struct Broker {
    pubsub: Option<Arc<RedisPubSub>>,
    publish_tx: Option<mpsc::Sender<PublishRequest>>,
    state: watch::Receiver<BrokerState>,
}

impl Broker {
    /// Spawn the Pub/Sub tasks without waiting for the broker
    fn start(config: &Config, hub: &Arc<NamespaceHub>) -> Result<Self> {
        if !config.redis.is_enabled() {
            info!("Redis not configured, server push disabled");
            let (_, state) = watch::channel(BrokerState::Disabled);
            return Ok(Self {
                pubsub: None,
                publish_tx: None,
                state,
            });
        }

        let pubsub = Arc::new(
            RedisPubSub::new(&config.redis, EventRouter::new(hub.clone()))
                .context("Invalid Redis configuration")?,
        );
        let state = pubsub.state();
        let publish_tx = pubsub.clone().start();
        info!(channel = %config.redis.events_channel, "Redis Pub/Sub started");

        Ok(Self {
            pubsub: Some(pubsub),
            publish_tx: Some(publish_tx),
            state,
        })
    }

    fn shutdown(&self) {
        if let Some(pubsub) = &self.pubsub {
            pubsub.shutdown();
        }
    }
}

/// Handlers linked into this binary, keyed by application id
fn builtin_handlers(backend: BackendClient) -> StaticHandlerSource {
    let permissions: Arc<dyn Permissions> = Arc::new(backend);
    StaticHandlerSource::new().with_factory(frappe::APP_ID, move || {
        Ok(Arc::new(FrappeHandler::new(permissions.clone())) as Arc<dyn TenantHandler>)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Realtime relay starting...");

    // 3. Namespace hub and broker
    let hub = Arc::new(NamespaceHub::new());
    let broker = Broker::start(&config, &hub)?;

    // 4. Backend-facing services
    let backend = BackendClient::new(&config.backend).context("Failed to build backend HTTP client")?;
    let registry = Arc::new(HandlerRegistry::new(Arc::new(builtin_handlers(backend.clone()))));

    let state = AppState {
        hub,
        registry,
        authenticator: Arc::new(BackendAuthenticator::new(backend)),
        publish_tx: broker.publish_tx.clone(),
        broker_state: broker.state.clone(),
        editor_channel: config.redis.editor_channel.clone(),
        max_message_size: config.server.max_message_size,
    };

    // 5. Serve until a shutdown signal arrives
    let result = server::serve(
        &config.listen_target(),
        create_router(state),
        server::shutdown_signal(),
    )
    .await;

    broker.shutdown();
    info!("Realtime relay stopped");

    result
}
