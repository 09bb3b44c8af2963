// Module: sync

pub mod events;
pub mod namespace_hub;
pub mod redis_pubsub;
pub mod router;

pub use events::{RelayMessage, SocketEvent};
pub use namespace_hub::{MessageReceiver, MessageSender, NamespaceHub, Subscriber, CLIENT_QUEUE_CAPACITY};
pub use redis_pubsub::{BrokerState, PublishRequest, RedisPubSub};
pub use router::EventRouter;
