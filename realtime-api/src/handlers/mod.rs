//! Per-application event handlers
//!
//! Every application installed on a tenant may contribute a handler that
//! registers socket listeners on connect. Handlers are statically linked and
//! looked up by application id through a [`HandlerSource`]; the
//! [`HandlerRegistry`] memoizes each lookup for the process lifetime.

pub mod frappe;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::socket::Socket;

pub use frappe::FrappeHandler;

/// Installs an application's listeners on a freshly admitted socket
pub trait TenantHandler: Send + Sync {
    fn install(&self, socket: &Socket) -> anyhow::Result<()>;
}

/// Resolves an application id to its handler
#[cfg_attr(test, mockall::automock)]
pub trait HandlerSource: Send + Sync {
    /// `Ok(None)` when the application ships no realtime handler
    fn load(&self, app: &str) -> anyhow::Result<Option<Arc<dyn TenantHandler>>>;
}

pub type HandlerFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn TenantHandler>> + Send + Sync>;

/// Handler table filled at startup
#[derive(Default)]
pub struct StaticHandlerSource {
    factories: HashMap<String, HandlerFactory>,
}

impl StaticHandlerSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_factory<F>(mut self, app: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn TenantHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(app.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn with_handler(self, app: impl Into<String>, handler: Arc<dyn TenantHandler>) -> Self {
        self.with_factory(app, move || Ok(handler.clone()))
    }
}

impl HandlerSource for StaticHandlerSource {
    fn load(&self, app: &str) -> anyhow::Result<Option<Arc<dyn TenantHandler>>> {
        self.factories.get(app).map(|factory| factory()).transpose()
    }
}

/// Memoizing handler lookup
///
/// Each application id hits the source at most once. Absent handlers, load
/// errors and load panics are all cached as `None`.
pub struct HandlerRegistry {
    source: Arc<dyn HandlerSource>,
    cache: DashMap<String, Option<Arc<dyn TenantHandler>>>,
}

impl HandlerRegistry {
    pub fn new(source: Arc<dyn HandlerSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    pub fn resolve(&self, app: &str) -> Option<Arc<dyn TenantHandler>> {
        if let Some(cached) = self.cache.get(app) {
            return cached.clone();
        }

        // The shard stays locked while loading, so concurrent first lookups
        // of the same app still load once.
        self.cache
            .entry(app.to_string())
            .or_insert_with(|| self.load(app))
            .clone()
    }

    fn load(&self, app: &str) -> Option<Arc<dyn TenantHandler>> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.source.load(app))) {
            Ok(Ok(Some(handler))) => {
                info!(app = app, "Loaded realtime handler");
                Some(handler)
            }
            Ok(Ok(None)) => {
                debug!(app = app, "No realtime handler for app");
                None
            }
            Ok(Err(e)) => {
                warn!(app = app, error = %e, "Failed to load realtime handler");
                None
            }
            Err(_) => {
                warn!(app = app, "Realtime handler loader panicked");
                None
            }
        }
    }

    /// Install the handler of every listed app on a socket
    ///
    /// Failing handlers are logged and skipped. Returns how many installed.
    pub fn install_all(&self, socket: &Socket, apps: &[String]) -> usize {
        let mut installed = 0;

        for app in apps {
            let Some(handler) = self.resolve(app) else {
                continue;
            };

            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.install(socket))) {
                Ok(Ok(())) => installed += 1,
                Ok(Err(e)) => {
                    warn!(
                        app = %app,
                        namespace = %socket.namespace(),
                        connection_id = %socket.id(),
                        error = %e,
                        "Failed to set up event handlers"
                    );
                }
                Err(_) => {
                    warn!(
                        app = %app,
                        namespace = %socket.namespace(),
                        connection_id = %socket.id(),
                        "Event handler setup panicked"
                    );
                }
            }
        }

        installed
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
