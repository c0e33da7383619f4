//! Offer/answer exchange with the service

use super::{MediaTransport, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

/// Exchanges a local description for the remote one
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn exchange(&self, url: &Url, offer: SessionDescription) -> Result<SessionDescription>;
}

/// POSTs the offer as JSON and reads the answer from the response body
#[derive(Debug, Clone, Default)]
pub struct HttpNegotiator {
    client: reqwest::Client,
}

impl HttpNegotiator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn exchange(&self, url: &Url, offer: SessionDescription) -> Result<SessionDescription> {
        debug!(%url, "Posting offer");
        let response = self.client.post(url.clone()).json(&offer).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Negotiation(format!("{} returned {}", url, status)));
        }
        Ok(response.json::<SessionDescription>().await?)
    }
}

/// Run one offer/answer round for `transport` against `url`
pub async fn negotiate(
    transport: &dyn MediaTransport,
    negotiator: &dyn Negotiator,
    url: &Url,
) -> Result<()> {
    let offer = transport.create_offer().await?;
    let answer = negotiator.exchange(url, offer).await?;
    transport.apply_answer(answer).await
}
