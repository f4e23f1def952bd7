//! Debugger endpoint discovery.
//!
//! PPSSPP instances register with a public match service. Querying it from
//! the same network returns the local address and port of each reachable
//! instance, which are turned into WebSocket URIs and tried in order.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default discovery endpoint.
pub const DISCOVERY_URL: &str = "http://report.ppsspp.org/match/list";

/// Path of the debugger WebSocket on a PPSSPP instance.
pub const DEBUGGER_PATH: &str = "/debugger";

/// One debugger instance from the discovery listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Host address.
    pub ip: String,
    /// Port.
    pub p: u16,
}

impl Candidate {
    /// Create a candidate.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            p: port,
        }
    }

    /// WebSocket URI of this candidate's debugger.
    pub fn uri(&self) -> String {
        format!("ws://{}:{}{DEBUGGER_PATH}", self.ip, self.p)
    }
}

/// Produces the ordered list of endpoints `auto_connect` tries.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Fetch the current listing.
    async fn candidates(&self) -> Result<Vec<Candidate>>;
}

/// A fixed listing.
#[async_trait]
impl CandidateSource for Vec<Candidate> {
    async fn candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self.clone())
    }
}

/// Queries the HTTP match service.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: Client,
    url: String,
}

impl HttpDiscovery {
    /// Create a discovery client for `url`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ppdbg/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// The endpoint queried.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CandidateSource for HttpDiscovery {
    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ClientError::Http(format!(
                "request failed with status {status}"
            )));
        }

        let listing: Vec<Candidate> = response
            .json()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        debug!(url = %self.url, count = listing.len(), "Discovery listing received");
        Ok(listing)
    }
}
