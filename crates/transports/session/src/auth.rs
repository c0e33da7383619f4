//! Authentication check consulted before every connect

use crate::config::ClientConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[async_trait]
pub trait AuthCheck: Send + Sync {
    /// Whether the service currently has a logged-in user
    async fn is_logged_in(&self) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct LoggedIn {
    logged_in: bool,
}

#[derive(Debug, Serialize)]
struct SetAuth<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<&'a str>,
}

/// Queries the service's authentication endpoints
#[derive(Debug, Clone)]
pub struct HttpAuthCheck {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpAuthCheck {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    /// Install (or with `None`, clear) the service access token
    pub async fn set_auth(&self, access_token: Option<&str>) -> Result<()> {
        let url = self.config.http_url("/api/v1/set_auth")?;
        let response = self
            .client
            .post(url.clone())
            .json(&SetAuth { access_token })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::NotAuthenticated(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        info!(token = access_token.is_some(), "Credentials installed");
        Ok(())
    }
}

#[async_trait]
impl AuthCheck for HttpAuthCheck {
    async fn is_logged_in(&self) -> Result<bool> {
        let url = self.config.http_url("/api/v1/logged_in")?;
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::NotAuthenticated(format!("{} returned {}", url, status)));
        }
        let body: LoggedIn = response.json().await?;
        debug!(logged_in = body.logged_in, "Authentication checked");
        Ok(body.logged_in)
    }
}

/// Fixed answer, switchable at runtime
#[derive(Debug)]
pub struct StaticAuth(AtomicBool);

impl StaticAuth {
    pub fn new(logged_in: bool) -> Self {
        Self(AtomicBool::new(logged_in))
    }

    pub fn set(&self, logged_in: bool) {
        self.0.store(logged_in, Ordering::SeqCst);
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl AuthCheck for StaticAuth {
    async fn is_logged_in(&self) -> Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_auth_body() {
        let body = serde_json::to_string(&SetAuth {
            access_token: Some("t0k"),
        })
        .unwrap();
        assert_eq!(body, r#"{"access_token":"t0k"}"#);
        assert_eq!(serde_json::to_string(&SetAuth { access_token: None }).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_static_auth_toggles() {
        let auth = StaticAuth::default();
        assert!(auth.is_logged_in().await.unwrap());
        auth.set(false);
        assert!(!auth.is_logged_in().await.unwrap());
    }
}
