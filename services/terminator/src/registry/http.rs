//! HTTP node registry client (Docker Cloud infra API).
//!
//! - `GET  /api/infra/v1/node/?state=<state>` lists nodes, paginated via
//!   `meta.next`
//! - `DELETE /api/infra/v1/node/<uuid>/` terminates a node; the registry
//!   answers `202 Accepted`, and `404` means the node is already gone
//!
//! The registry's node UUID is the correlation key: it is the value the
//! registry copies onto the instance's correlation tag at provisioning time.

use std::time::Duration;

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, NodeId};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{NodeRecord, NodeRegistry, NodeState};
use crate::error::ProviderError;

/// Upper bound on pages followed in one listing.
const DEFAULT_MAX_PAGES: usize = 100;

/// Settings for [`HttpNodeRegistry`].
#[derive(Clone)]
pub struct HttpNodeRegistryConfig {
    pub base_url: Url,
    /// Sent verbatim as the `Authorization` header.
    pub auth: String,
    pub timeout: Duration,
    pub max_pages: usize,
}

impl HttpNodeRegistryConfig {
    pub fn new(base_url: Url, auth: impl Into<String>) -> Self {
        Self {
            base_url,
            auth: auth.into(),
            timeout: Duration::from_secs(30),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl std::fmt::Debug for HttpNodeRegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNodeRegistryConfig")
            .field("base_url", &self.base_url.as_str())
            .field("auth", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

/// Node registry backed by the Docker Cloud infra HTTP API.
pub struct HttpNodeRegistry {
    client: reqwest::Client,
    base_url: Url,
    auth: String,
    max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default)]
    objects: Vec<WireNode>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    uuid: Option<String>,
    state: Option<String>,
    nickname: Option<String>,
    region: Option<String>,
}

impl WireNode {
    fn into_record(self) -> Option<NodeRecord> {
        let Some(uuid) = self.uuid else {
            warn!(nickname = ?self.nickname, "Registry returned node without uuid, skipping");
            return None;
        };

        let id = match NodeId::parse(&uuid) {
            Ok(id) => id,
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Registry returned invalid node uuid, skipping");
                return None;
            }
        };

        Some(NodeRecord {
            id,
            correlation_key: CorrelationKey::parse(&uuid).ok(),
            state: self
                .state
                .as_deref()
                .map(NodeState::from_wire)
                .unwrap_or_else(|| NodeState::Other(String::new())),
            nickname: self.nickname,
            region: self.region,
        })
    }
}

impl HttpNodeRegistry {
    /// Create a new registry client.
    pub fn new(config: HttpNodeRegistryConfig) -> Result<Self, ProviderError> {
        if config.base_url.cannot_be_a_base() {
            return Err(ProviderError::Connectivity(format!(
                "registry URL cannot be a base: {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connectivity(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url,
            auth: config.auth,
            max_pages: config.max_pages.max(1),
        })
    }

    /// `/api/infra/v1/node/<segments>/` under the base URL.
    fn node_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["api", "infra", "v1", "node"])
                .extend(segments)
                .push("");
        }
        url
    }

    async fn get_page(&self, url: Url) -> Result<NodesResponse, ProviderError> {
        debug!(url = %url, "Fetching registry nodes");

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.auth.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(remote_error(status, &body));
        }

        let page: NodesResponse = serde_json::from_str(&body)?;
        if let Some(error) = page.error {
            return Err(ProviderError::remote(Some(status.as_u16()), error));
        }

        Ok(page)
    }
}

/// Build a `Remote` error from a non-success response, preferring the
/// registry's own `error` message over the status reason.
fn remote_error(status: StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });

    ProviderError::remote(Some(status.as_u16()), message)
}

#[async_trait]
impl NodeRegistry for HttpNodeRegistry {
    async fn list_by_state(&self, state: &NodeState) -> Result<Vec<NodeRecord>, ProviderError> {
        let mut url = self.node_url(&[]);
        url.query_pairs_mut().append_pair("state", state.as_str());

        let mut records = Vec::new();
        for page_number in 1..=self.max_pages {
            let page = self.get_page(url.clone()).await?;
            records.extend(page.objects.into_iter().filter_map(WireNode::into_record));

            let Some(next) = page.meta.and_then(|m| m.next) else {
                return Ok(records);
            };

            url = self.base_url.join(&next).map_err(|e| {
                ProviderError::Decode(format!("invalid meta.next link {next:?}: {e}"))
            })?;

            if page_number == self.max_pages {
                warn!(
                    state = %state,
                    max_pages = self.max_pages,
                    "Registry listing truncated at page limit"
                );
            }
        }

        Ok(records)
    }

    async fn delete_by_correlation_key(&self, key: &CorrelationKey) -> Result<(), ProviderError> {
        let url = self.node_url(&[key.as_str()]);
        debug!(url = %url, correlation_key = %key, "Deleting registry node");

        let response = self
            .client
            .delete(url)
            .header(AUTHORIZATION, self.auth.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!(correlation_key = %key, "Registry node already gone");
            return Ok(());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(remote_error(status, &body));
        }

        Ok(())
    }
}
