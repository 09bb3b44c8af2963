//! Handshake authentication
//!
//! Runs before the WebSocket upgrade; a rejected handshake never reaches the
//! tenant handlers.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendClient, BackendCredentials, BackendError};

/// User type granted the `all` room
pub const SYSTEM_USER: &str = "System User";

/// Handshake data relevant to authentication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    /// Namespace without the leading `/`
    pub namespace: String,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub sid: Option<String>,
    pub authorization: Option<String>,
}

/// Authenticated session attached to a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user: String,
    pub user_type: String,
    pub installed_apps: Vec<String>,
    pub credentials: BackendCredentials,
}

impl AuthContext {
    pub fn new(user: impl Into<String>, user_type: impl Into<String>, installed_apps: Vec<String>) -> Self {
        Self {
            user: user.into(),
            user_type: user_type.into(),
            installed_apps,
            credentials: BackendCredentials::default(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: BackendCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn is_system_user(&self) -> bool {
        self.user_type == SYSTEM_USER
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid namespace")]
    InvalidNamespace,

    #[error("Invalid origin")]
    InvalidOrigin,

    #[error("No authentication method used")]
    MissingCredentials,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Backend unavailable: {0}")]
    Backend(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthContext, AuthError>;
}

/// Validates tenant, origin and session against the backend
pub struct BackendAuthenticator {
    backend: BackendClient,
}

impl BackendAuthenticator {
    #[must_use]
    pub const fn new(backend: BackendClient) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Authenticator for BackendAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthContext, AuthError> {
        let host = request.host.as_deref().unwrap_or_default();
        let host_name = host_hostname(host).ok_or(AuthError::InvalidNamespace)?;

        if request.namespace != host_name {
            debug!(namespace = %request.namespace, host = %host_name, "Namespace does not match host");
            return Err(AuthError::InvalidNamespace);
        }

        let origin_name = request.origin.as_deref().and_then(origin_hostname);
        if origin_name.as_deref() != Some(host_name.as_str()) {
            debug!(host = %host_name, origin = ?request.origin, "Origin does not match host");
            return Err(AuthError::InvalidOrigin);
        }

        let sid = request.sid.clone().filter(|s| !s.is_empty());
        let authorization = request.authorization.clone().filter(|s| !s.is_empty());
        if sid.is_none() && authorization.is_none() {
            return Err(AuthError::MissingCredentials);
        }

        let credentials = BackendCredentials {
            host: host.to_string(),
            sid,
            authorization,
        };

        let info = self
            .backend
            .get_user_info(&credentials)
            .await
            .map_err(|e| match e {
                BackendError::Rejected(status) => AuthError::Unauthorized(status.to_string()),
                other => AuthError::Backend(other.to_string()),
            })?;

        Ok(AuthContext::new(info.user, info.user_type, info.installed_apps).with_credentials(credentials))
    }
}

/// Hostname of a `Host` header value (`acme.localhost:8000` → `acme.localhost`)
fn host_hostname(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    origin_hostname(&format!("http://{host}"))
}

fn origin_hostname(origin: &str) -> Option<String> {
    url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}
