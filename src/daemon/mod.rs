//! Enforcement daemon client.
//!
//! The daemon is the service that actually refuses to serve blocked
//! content. We only ever tell it what to add to its blocklist and read the
//! list back. Its bulk endpoint rejects a whole batch when any member is
//! malformed, and the batch engine relies on telling that apart from the
//! daemon simply being unreachable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::Hash;

/// Blocklist endpoint
const BLOCKLIST_PATH: &str = "/skynet/blocklist";
/// Readiness endpoint
const READY_PATH: &str = "/daemon/ready";

/// Enforcement daemon capability
#[async_trait]
pub trait EnforcementDaemon: Send + Sync {
    /// Add a batch of hashes to the daemon's blocklist
    ///
    /// On success returns the hashes the daemon reported as structurally
    /// invalid (the rest of the batch is enforced).
    async fn submit_block_batch(&self, hashes: &[Hash]) -> Result<Vec<Hash>, DaemonError>;

    /// The daemon's full blocklist
    async fn fetch_blocklist(&self) -> Result<Vec<Hash>, DaemonError>;

    /// Whether the daemon answers and reports itself ready
    async fn is_up(&self) -> bool;
}

/// Daemon connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Base URL, e.g. `http://127.0.0.1:9980`
    pub url: String,
    /// API password sent as basic auth
    pub api_password: Option<String>,
    /// The daemon refuses requests without its agent string
    pub user_agent: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9980".to_string(),
            api_password: None,
            user_agent: "Sia-Agent".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct BlocklistUpdate<'a> {
    add: &'a [Hash],
    remove: &'a [Hash],
    #[serde(rename = "isHash")]
    is_hash: bool,
}

#[derive(Deserialize)]
struct BlocklistUpdateResponse {
    #[serde(default)]
    invalids: Vec<InvalidEntry>,
}

#[derive(Deserialize)]
struct InvalidEntry {
    input: String,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct BlocklistResponse {
    #[serde(default)]
    blocklist: Vec<Hash>,
}

#[derive(Deserialize)]
struct ReadyResponse {
    #[serde(default)]
    ready: bool,
}

/// HTTP client for the daemon's API
pub struct HttpDaemon {
    client: reqwest::Client,
    config: DaemonConfig,
}

impl HttpDaemon {
    /// Build a client
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DaemonError::Unreachable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let builder = self.client.request(method, url);
        match &self.config.api_password {
            Some(password) => builder.basic_auth("", Some(password)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<ResponseBody, DaemonError> {
        let response = builder
            .send()
            .await
            .map_err(|e| DaemonError::Unreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DaemonError::Unreachable(e.to_string()))?;

        if status.is_success() {
            return Ok(ResponseBody(body.to_vec()));
        }

        let text = String::from_utf8_lossy(&body).into_owned();
        if status == StatusCode::BAD_REQUEST {
            Err(DaemonError::Rejected(text))
        } else {
            Err(DaemonError::Status {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

/// A successful response body
struct ResponseBody(Vec<u8>);

impl ResponseBody {
    fn is_empty(&self) -> bool {
        self.0.iter().all(u8::is_ascii_whitespace)
    }

    fn json<T: DeserializeOwned>(&self) -> Result<T, DaemonError> {
        serde_json::from_slice(&self.0).map_err(|e| DaemonError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EnforcementDaemon for HttpDaemon {
    async fn submit_block_batch(&self, hashes: &[Hash]) -> Result<Vec<Hash>, DaemonError> {
        let update = BlocklistUpdate {
            add: hashes,
            remove: &[],
            is_hash: true,
        };
        let body = self
            .send(self.request(Method::POST, BLOCKLIST_PATH).json(&update))
            .await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }

        let response: BlocklistUpdateResponse = body.json()?;
        let mut invalid = Vec::with_capacity(response.invalids.len());
        for entry in response.invalids {
            match Hash::from_hex(&entry.input) {
                Ok(hash) => {
                    debug!(hash = %hash, reason = %entry.error, "Daemon reported invalid hash");
                    invalid.push(hash);
                }
                Err(e) => {
                    warn!(input = %entry.input, error = %e, "Daemon reported an unparseable invalid entry");
                }
            }
        }
        Ok(invalid)
    }

    async fn fetch_blocklist(&self) -> Result<Vec<Hash>, DaemonError> {
        let body = self.send(self.request(Method::GET, BLOCKLIST_PATH)).await?;
        let response: BlocklistResponse = body.json()?;
        Ok(response.blocklist)
    }

    async fn is_up(&self) -> bool {
        match self.send(self.request(Method::GET, READY_PATH)).await {
            Ok(body) => body.json::<ReadyResponse>().map(|r| r.ready).unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "Daemon readiness check failed");
                false
            }
        }
    }
}

/// Daemon errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Network failure before a response arrived
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    /// The daemon refused the batch contents
    #[error("daemon rejected batch: {0}")]
    Rejected(String),
    /// Any other non-success status
    #[error("daemon returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// Response body did not parse
    #[error("could not decode daemon response: {0}")]
    Decode(String),
}

impl DaemonError {
    /// Whether the failure is caused by what was in the batch
    ///
    /// Only content errors justify shrinking a batch; everything else means
    /// the daemon cannot be reached and the run should stop.
    #[must_use]
    pub const fn is_content_error(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
