//! Backend HTTP client
//!
//! The backend web application owns sessions and document permissions. The
//! relay forwards the client's `Host`, `sid` cookie and `Authorization`
//! header so the backend resolves the right tenant and session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE, HOST};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use realtime_core::config::BackendConfig;

const GET_USER_INFO: &str = "frappe.realtime.get_user_info";
const CAN_SUBSCRIBE_DOC: &str = "frappe.realtime.can_subscribe_doc";
const CAN_SUBSCRIBE_DOCTYPE: &str = "frappe.realtime.can_subscribe_doctype";

#[derive(Debug, Error)]
pub enum BackendError {
    /// 4xx: the backend refused the session
    #[error("backend rejected request with status {0}")]
    Rejected(StatusCode),

    #[error("backend returned status {0}")]
    Status(StatusCode),

    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Credentials forwarded to the backend on every call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCredentials {
    pub host: String,
    pub sid: Option<String>,
    pub authorization: Option<String>,
}

/// Session details returned by `get_user_info`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    pub user: String,
    #[serde(default)]
    pub user_type: String,
    #[serde(default)]
    pub installed_apps: Vec<String>,
}

/// Whitelisted-method responses are wrapped in `{"message": ...}`
#[derive(Deserialize)]
struct MethodResponse<T> {
    message: T,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    client: Client,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn get_user_info(&self, credentials: &BackendCredentials) -> Result<UserInfo, BackendError> {
        self.call(GET_USER_INFO, credentials, &[]).await
    }

    pub async fn can_subscribe_doc(
        &self,
        credentials: &BackendCredentials,
        doctype: &str,
        docname: &str,
    ) -> Result<bool, BackendError> {
        self.call(
            CAN_SUBSCRIBE_DOC,
            credentials,
            &[("doctype", doctype), ("docname", docname)],
        )
        .await
    }

    pub async fn can_subscribe_doctype(
        &self,
        credentials: &BackendCredentials,
        doctype: &str,
    ) -> Result<bool, BackendError> {
        self.call(CAN_SUBSCRIBE_DOCTYPE, credentials, &[("doctype", doctype)])
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        credentials: &BackendCredentials,
        form: &[(&str, &str)],
    ) -> Result<T, BackendError> {
        let url = format!("{}/api/method/{method}", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header(HOST, &credentials.host)
            .form(form);
        if let Some(sid) = &credentials.sid {
            request = request.header(COOKIE, format!("sid={sid}"));
        }
        if let Some(authorization) = &credentials.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(method = method, status = %status, "Backend call finished");

        if status.is_client_error() {
            return Err(BackendError::Rejected(status));
        }
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }

        let body: MethodResponse<T> = response.json().await?;
        Ok(body.message)
    }
}

/// Document-level permission checks used by tenant handlers
#[async_trait]
pub trait Permissions: Send + Sync {
    async fn can_subscribe_doc(&self, credentials: &BackendCredentials, doctype: &str, docname: &str) -> bool;

    async fn can_subscribe_doctype(&self, credentials: &BackendCredentials, doctype: &str) -> bool;
}

/// Backend failures deny the subscription
#[async_trait]
impl Permissions for BackendClient {
    async fn can_subscribe_doc(&self, credentials: &BackendCredentials, doctype: &str, docname: &str) -> bool {
        match Self::can_subscribe_doc(self, credentials, doctype, docname).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, doctype = doctype, docname = docname, "Document permission check failed");
                false
            }
        }
    }

    async fn can_subscribe_doctype(&self, credentials: &BackendCredentials, doctype: &str) -> bool {
        match Self::can_subscribe_doctype(self, credentials, doctype).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, doctype = doctype, "Doctype permission check failed");
                false
            }
        }
    }
}
