pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    BrokerState, EventRouter, NamespaceHub, PublishRequest, RedisPubSub, RelayMessage, SocketEvent,
};
