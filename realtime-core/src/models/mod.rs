pub mod id;

pub use id::{ConnectionId, Namespace, RoomName};
