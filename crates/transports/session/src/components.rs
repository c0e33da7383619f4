//! Component status feed
//!
//! The service streams the install/download state of its components as
//! server-sent events; every `data:` line carries the full status list.
//! [`ComponentFeed`] shares one such request between any number of
//! subscribers: it is opened for the first subscriber, re-opened every two
//! seconds after a failure, and dropped once the last subscriber leaves.

use crate::config::ClientConfig;
use crate::{Error, Result};
use dh2d_primitives::{EventBus, Scope, SharedStream, Subscription, Upstream, ValueEvent};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub status: DownloadState,
    /// 0.0 ..= 1.0
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Latest available version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub local_version_command: String,
    #[serde(default)]
    pub install_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_if_missing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// Installed version, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadStatus>,
    pub component: Component,
}

impl ComponentStatus {
    pub fn is_installed(&self) -> bool {
        self.local_version.is_some()
    }

    /// Installed and different from the latest known version
    pub fn update_available(&self) -> bool {
        match (&self.local_version, &self.component.version) {
            (Some(local), Some(latest)) => local != latest,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentAction {
    Update,
    CancelUpdate,
}

#[derive(Serialize)]
struct ActionBody {
    action: ComponentAction,
}

/// Shared component status feed plus the component actions
#[derive(Clone)]
pub struct ComponentFeed {
    client: reqwest::Client,
    config: ClientConfig,
    stream: SharedStream<Vec<ComponentStatus>>,
}

impl ComponentFeed {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        let stream = {
            let client = client.clone();
            let config = config.clone();
            SharedStream::new(move || start_feed(client.clone(), config.clone()))
        };
        Self {
            client,
            config,
            stream,
        }
    }

    /// Receive every status list; the first subscriber opens the feed
    pub fn on_update<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Vec<ComponentStatus>) + Send + Sync + 'static,
    {
        self.stream.on_value(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.stream.subscriber_count()
    }

    /// Whether the feed request is currently open
    pub fn is_running(&self) -> bool {
        self.stream.is_running()
    }

    /// Start installing or updating `name`
    pub async fn update(&self, name: &str) -> Result<()> {
        self.act(name, ComponentAction::Update).await
    }

    /// Cancel a running install or update of `name`
    pub async fn cancel_update(&self, name: &str) -> Result<()> {
        self.act(name, ComponentAction::CancelUpdate).await
    }

    async fn act(&self, name: &str, action: ComponentAction) -> Result<()> {
        let mut url = self.config.http_url("/api/v1/component")?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("cannot add a path to {}", self.config.endpoint)))?
            .push(name);

        let response = self
            .client
            .post(url.clone())
            .json(&ActionBody { action })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("{} returned {}", url, response.status()).into());
        }
        info!(component = name, ?action, "Component action accepted");
        Ok(())
    }
}

async fn start_feed(
    client: reqwest::Client,
    config: ClientConfig,
) -> dh2d_primitives::Result<Upstream<Vec<ComponentStatus>>> {
    let url = config.http_url("/api/v1/components")?;
    let values = EventBus::new();
    let scope = Scope::new();
    let task = tokio::spawn(follow_feed(client, url, values.clone(), scope.clone()));

    Ok(Upstream::new(values, move || async move {
        scope.trigger();
        let _ = task.await;
    }))
}

/// Keep the feed open until `scope` triggers
async fn follow_feed(
    client: reqwest::Client,
    url: Url,
    values: EventBus<ValueEvent, Vec<ComponentStatus>>,
    scope: Scope,
) {
    info!(%url, "Opening component feed");
    loop {
        match scope.until_triggered(read_feed(&client, &url, &values)).await {
            Err(_) => break,
            Ok(Ok(())) => debug!("Component feed ended"),
            Ok(Err(e)) => warn!(error = %e, "Component feed failed"),
        }
        if scope.until_triggered(tokio::time::sleep(RETRY_DELAY)).await.is_err() {
            break;
        }
    }
    info!(%url, "Component feed closed");
}

async fn read_feed(
    client: &reqwest::Client,
    url: &Url,
    values: &EventBus<ValueEvent, Vec<ComponentStatus>>,
) -> Result<()> {
    let response = client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(anyhow::anyhow!("{} returned {}", url, response.status()).into());
    }

    let mut body = response.bytes_stream();
    let mut lines = SseLines::default();
    while let Some(chunk) = body.next().await {
        for data in lines.push(&chunk?) {
            match serde_json::from_str::<Vec<ComponentStatus>>(&data) {
                Ok(statuses) => values.emit(ValueEvent::Value, &statuses),
                Err(e) => warn!(error = %e, "Dropping malformed component update"),
            }
        }
    }
    Ok(())
}

/// Splits a byte stream into server-sent event `data` payloads
#[derive(Debug, Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
