//! Read-only access to another node's blocklist.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::BlocklistPage;

/// Default per-request timeout for peer calls
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer whose blocklist can be paged through, newest entries first
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Base URL identifying the peer in logs and cursors
    fn url(&self) -> &str;

    /// One page of the peer's blocklist
    async fn fetch_blocklist(&self, offset: usize, limit: usize)
        -> Result<BlocklistPage, PeerError>;
}

/// `GET {url}/blocklist?offset=&limit=`
pub struct HttpPeerClient {
    client: reqwest::Client,
    url: String,
}

impl HttpPeerClient {
    /// Build a client for the peer at `url`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;
        let url = url.into().trim_end_matches('/').to_string();
        Ok(Self { client, url })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_blocklist(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<BlocklistPage, PeerError> {
        let response = self
            .client
            .get(format!("{}/blocklist", self.url))
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<BlocklistPage>()
            .await
            .map_err(|e| PeerError::Decode(e.to_string()))
    }
}

/// Peer errors
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Network failure before a response arrived
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// Non-success status
    #[error("peer returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// Response body did not parse
    #[error("could not decode peer response: {0}")]
    Decode(String),
}
