use futures::stream::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use realtime_core::config::RedisConfig;
use realtime_core::resilience::retry::{retry_fixed, FixedRetry};

use super::router::EventRouter;
use crate::{Error, Result};

/// Broker connection state, observable by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    /// No broker configured
    Disabled,
    Connecting,
    Subscribed,
    /// Retries exhausted or subscription failed; serving without server push
    Degraded,
}

impl BrokerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Redis Pub/Sub client feeding backend events into the relay
///
/// - Connects with a fixed-count, fixed-delay retry; on exhaustion the relay
///   keeps serving sockets without server push
/// - Subscribes to the events channel and hands every payload to the
///   `EventRouter` in receive order
/// - Publishes client-originated side-channel messages (`open_in_editor`)
pub struct RedisPubSub {
    redis_client: RedisClient,
    router: EventRouter,
    events_channel: String,
    connect_retry: FixedRetry,
    op_timeout: Duration,
    state_tx: watch::Sender<BrokerState>,
    cancel_token: CancellationToken,
}

impl RedisPubSub {
    /// Create a new `RedisPubSub` service
    pub fn new(config: &RedisConfig, router: EventRouter) -> Result<Self> {
        if !config.is_enabled() {
            return Err(Error::Configuration("Redis URL is empty".to_string()));
        }
        let redis_client = RedisClient::open(config.url.as_str())?;
        let (state_tx, _) = watch::channel(BrokerState::Connecting);

        Ok(Self {
            redis_client,
            router,
            events_channel: config.events_channel.clone(),
            connect_retry: config.connect_retry(),
            op_timeout: config.timeout(),
            state_tx,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Shut down the Pub/Sub service (cancels subscriber and publisher tasks)
    pub fn shutdown(&self) {
        info!("Shutting down RedisPubSub service");
        self.cancel_token.cancel();
    }

    /// Watch the broker connection state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<BrokerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: BrokerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Broker state changed");
        }
    }

    /// Capacity for the publish channel. Requests are rejected when full.
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 1024;

    /// Start the Pub/Sub service
    ///
    /// Spawns the subscriber and publisher tasks and returns immediately, so
    /// the caller can bind its listener without waiting for the broker.
    pub fn start(self: Arc<Self>) -> mpsc::Sender<PublishRequest> {
        let (publish_tx, mut publish_rx) =
            mpsc::channel::<PublishRequest>(Self::PUBLISH_CHANNEL_CAPACITY);

        let publish_client = self.redis_client.clone();
        let op_timeout = self.op_timeout;
        let cancel_publisher = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut conn: Option<redis::aio::MultiplexedConnection> = None;

            loop {
                let req = tokio::select! {
                    () = cancel_publisher.cancelled() => {
                        info!("Redis publisher task cancelled");
                        return;
                    }
                    req = publish_rx.recv() => req,
                };
                let Some(req) = req else {
                    debug!("Redis publisher channel closed, exiting");
                    return;
                };

                if conn.is_none() {
                    conn = match timeout(op_timeout, publish_client.get_multiplexed_async_connection()).await {
                        Ok(Ok(c)) => Some(c),
                        Ok(Err(e)) => {
                            warn!(error = %e, channel = %req.channel, "Failed to get Redis connection for publishing");
                            None
                        }
                        Err(_) => {
                            warn!(channel = %req.channel, "Timed out getting Redis connection for publishing");
                            None
                        }
                    };
                }

                let Some(c) = conn.as_mut() else {
                    warn!(channel = %req.channel, "Dropping publish request, Redis unavailable");
                    continue;
                };

                match Self::publish_message(c, op_timeout, &req).await {
                    Ok(receivers) => {
                        debug!(channel = %req.channel, receivers = receivers, "Published to Redis");
                    }
                    Err(e) => {
                        warn!(error = %e, channel = %req.channel, "Failed to publish to Redis, dropping request");
                        conn = None;
                    }
                }
            }
        });

        tokio::spawn(async move {
            self.run_subscriber().await;
        });

        publish_tx
    }

    /// Connect, subscribe and forward messages until cancelled or degraded
    ///
    /// A lost connection re-enters the bounded connect loop. Exhausted
    /// retries or a failed subscribe leave the broker `Degraded` for good.
    async fn run_subscriber(&self) {
        loop {
            self.set_state(BrokerState::Connecting);

            let connect = retry_fixed(self.connect_retry, "redis connect", || self.connect_pubsub());
            let result = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Redis subscriber task cancelled");
                    return;
                }
                result = connect => result,
            };

            let mut pubsub = match result {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    error!(
                        attempts = e.attempts,
                        error = %e.last_error,
                        "Failed to connect to Redis, continuing without server push"
                    );
                    self.set_state(BrokerState::Degraded);
                    return;
                }
            };

            info!("Connected to Redis");

            match timeout(self.op_timeout, pubsub.subscribe(&self.events_channel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, channel = %self.events_channel, "Failed to subscribe to Redis channel");
                    self.set_state(BrokerState::Degraded);
                    return;
                }
                Err(_) => {
                    error!(channel = %self.events_channel, "Timed out subscribing to Redis channel");
                    self.set_state(BrokerState::Degraded);
                    return;
                }
            }

            self.set_state(BrokerState::Subscribed);
            info!(channel = %self.events_channel, "Subscribed to Redis channel");

            let mut stream = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Redis subscriber task cancelled");
                        return;
                    }
                    msg = stream.next() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };

                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel = %channel, "Invalid payload");
                        continue;
                    }
                };

                self.router.dispatch_payload(&channel, &payload);
            }

            warn!(channel = %self.events_channel, "Redis subscription ended (connection lost), reconnecting");
        }
    }

    async fn connect_pubsub(&self) -> Result<redis::aio::PubSub> {
        match timeout(self.op_timeout, self.redis_client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => Ok(pubsub),
            Ok(Err(e)) => Err(Error::Redis(e)),
            Err(_) => Err(Error::Timeout("getting Redis Pub/Sub connection".to_string())),
        }
    }

    async fn publish_message(
        conn: &mut redis::aio::MultiplexedConnection,
        op_timeout: Duration,
        req: &PublishRequest,
    ) -> Result<usize> {
        let receivers: usize = timeout(op_timeout, conn.publish(&req.channel, &req.payload))
            .await
            .map_err(|_| Error::Timeout(format!("publishing to {}", req.channel)))??;
        Ok(receivers)
    }
}

/// Request to publish a raw payload on a Redis channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NamespaceHub;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            // Nothing listens on port 1
            url: "redis://127.0.0.1:1".to_string(),
            connect_attempts: 2,
            connect_retry_delay_ms: 10,
            timeout_seconds: 1,
            ..RedisConfig::default()
        }
    }

    #[test]
    fn test_empty_url_is_rejected() {
        let router = EventRouter::new(Arc::new(NamespaceHub::new()));
        let config = RedisConfig {
            url: String::new(),
            ..RedisConfig::default()
        };

        assert!(matches!(
            RedisPubSub::new(&config, router),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_broker_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&BrokerState::Subscribed).unwrap(),
            "\"subscribed\""
        );
        assert_eq!(BrokerState::Degraded.to_string(), "degraded");
    }

    #[tokio::test]
    async fn test_unreachable_broker_degrades() {
        let router = EventRouter::new(Arc::new(NamespaceHub::new()));
        let pubsub = Arc::new(RedisPubSub::new(&unreachable_config(), router).unwrap());
        let mut state = pubsub.state();

        let publish_tx = pubsub.clone().start();

        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == BrokerState::Degraded),
        )
        .await
        .expect("broker should degrade")
        .unwrap();

        // Publishing while degraded is accepted and dropped
        publish_tx
            .send(PublishRequest {
                channel: "open_in_editor".to_string(),
                payload: "{}".to_string(),
            })
            .await
            .unwrap();

        pubsub.shutdown();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_pubsub_integration() {
        use realtime_core::models::{ConnectionId, Namespace, RoomName};

        let hub = Arc::new(NamespaceHub::new());
        let config = RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            ..RedisConfig::default()
        };
        let pubsub = Arc::new(RedisPubSub::new(&config, EventRouter::new(hub.clone())).unwrap());
        let mut state = pubsub.state();
        let publish_tx = pubsub.clone().start();

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == BrokerState::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        let conn_id = ConnectionId::from_string("conn1".to_string());
        let mut rx = hub.subscribe(Namespace::from("acme"), conn_id.clone(), None);
        hub.join_room(&conn_id, RoomName::from("docR"));

        publish_tx
            .send(PublishRequest {
                channel: "events".to_string(),
                payload: r#"{"namespace":"acme","room":"docR","event":"doc_updated","message":{"id":1}}"#
                    .to_string(),
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_type(), "doc_updated");

        pubsub.shutdown();
    }
}
