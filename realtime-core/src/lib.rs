pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod resilience;

pub use config::{Config, ListenTarget};
pub use error::{Error, Result};
