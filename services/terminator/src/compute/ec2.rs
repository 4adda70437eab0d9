//! EC2 compute provider over the EC2 query API.
//!
//! Requests are form-encoded `POST /` calls signed with SigV4; responses are
//! XML. Only three actions are used:
//!
//! - `DescribeInstances` filtered by the correlation tag and state
//! - `DescribeInstances` filtered by one correlation key
//! - `TerminateInstances`, which is idempotent on the EC2 side

use std::time::Duration;

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, InstanceId};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::sigv4::{self, Credentials, FORM_CONTENT_TYPE};
use super::{ComputeInstance, ComputeProvider, LifecycleState};
use crate::error::ProviderError;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";

/// EC2 accepts at most 1000 instance ids per `TerminateInstances` call.
const TERMINATE_BATCH_SIZE: usize = 1000;

/// Upper bound on `DescribeInstances` pages followed in one query.
const MAX_PAGES: usize = 100;

/// Error code EC2 returns when an instance id no longer exists.
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// Error codes EC2 uses for throttling and transient server faults.
const RETRYABLE_CODES: [&str; 6] = [
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "InternalError",
    "Unavailable",
    "ServiceUnavailable",
];

/// Retries after the first attempt of one query API call.
const MAX_RETRIES: u32 = 3;

/// Backoff before the first retry; doubled for each further retry.
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// States an instance can still be terminated from.
const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// Settings for [`Ec2ComputeProvider`].
#[derive(Debug, Clone)]
pub struct Ec2Config {
    pub region: String,
    /// Overrides `https://ec2.<region>.amazonaws.com`.
    pub endpoint: Option<Url>,
    pub credentials: Credentials,
    /// Tag whose value is the correlation key.
    pub correlation_tag: String,
    pub timeout: Duration,
}

impl Ec2Config {
    fn endpoint_url(&self) -> Result<Url, ProviderError> {
        match &self.endpoint {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("https://ec2.{}.amazonaws.com/", self.region)).map_err(
                |e| ProviderError::Connectivity(format!("invalid EC2 endpoint for region: {e}")),
            ),
        }
    }
}

/// Compute provider backed by EC2.
pub struct Ec2ComputeProvider {
    client: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: Credentials,
    correlation_tag: String,
}

// =============================================================================
// Wire types
// =============================================================================

/// EC2 list wrapper: `<fooSet><item>..</item><item>..</item></fooSet>`.
#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemSet<Reservation>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    #[serde(default)]
    instances_set: ItemSet<WireInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstance {
    instance_id: String,
    instance_state: WireInstanceState,
    #[serde(default)]
    tag_set: ItemSet<WireTag>,
}

#[derive(Debug, Deserialize)]
struct WireInstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireTag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Errors")]
    errors: ErrorList,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// A query API failure with EC2's error code, when one was returned.
struct ApiError {
    code: Option<String>,
    error: ProviderError,
}

impl ApiError {
    fn is_retryable(&self) -> bool {
        if let Some(code) = &self.code {
            if RETRYABLE_CODES.contains(&code.as_str()) {
                return true;
            }
        }
        match &self.error {
            ProviderError::Connectivity(_) => true,
            ProviderError::Remote {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    fn is_not_found(&self) -> bool {
        self.code.as_deref() == Some(INSTANCE_NOT_FOUND)
    }
}

impl From<ProviderError> for ApiError {
    fn from(error: ProviderError) -> Self {
        Self { code: None, error }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::from(err).into()
    }
}

// =============================================================================
// Client
// =============================================================================

impl Ec2ComputeProvider {
    /// Create a new EC2 client.
    pub fn new(config: Ec2Config) -> Result<Self, ProviderError> {
        let endpoint = config.endpoint_url()?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ProviderError::Connectivity(format!(
                    "EC2 endpoint has no host: {endpoint}"
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connectivity(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            host,
            region: config.region,
            credentials: config.credentials,
            correlation_tag: config.correlation_tag,
        })
    }

    /// Send a signed query API call and return the raw XML body.
    ///
    /// Throttling, 5xx and connectivity failures are retried up to
    /// [`MAX_RETRIES`] times with exponential backoff.
    async fn call(&self, action: &str, params: &[(String, String)]) -> Result<String, ApiError> {
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("Action", action);
            form.append_pair("Version", API_VERSION);
            for (name, value) in params {
                form.append_pair(name, value);
            }
            form.finish()
        };

        let mut backoff = RETRY_BASE_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.send_once(action, &body).await {
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        action,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e.error,
                        "EC2 call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    /// Sign and send one request. Signed fresh per attempt so retries carry
    /// a current `x-amz-date`.
    async fn send_once(&self, action: &str, body: &str) -> Result<String, ApiError> {
        let signed = sigv4::sign_form_post(
            &self.credentials,
            &self.region,
            SERVICE,
            &self.host,
            body,
            chrono::Utc::now(),
        );

        debug!(action, endpoint = %self.endpoint, "Calling EC2");

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("x-amz-date", signed.amz_date)
            .header("authorization", signed.authorization);
        if let Some(token) = signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.body(body.to_string()).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }

        Err(match quick_xml::de::from_str::<ErrorResponse>(&text) {
            Ok(parsed) => match parsed.errors.errors.into_iter().next() {
                Some(detail) => ApiError {
                    error: ProviderError::remote(
                        Some(status.as_u16()),
                        format!("{}: {}", detail.code, detail.message),
                    ),
                    code: Some(detail.code),
                },
                None => ProviderError::remote(Some(status.as_u16()), "empty error list").into(),
            },
            Err(_) => ProviderError::remote(
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("unexpected status"),
            )
            .into(),
        })
    }

    /// Run `DescribeInstances` with `filters`, following `nextToken`.
    async fn describe_instances(
        &self,
        filters: &[(&str, Vec<&str>)],
    ) -> Result<Vec<WireInstance>, ProviderError> {
        let mut base = Vec::new();
        for (i, (name, values)) in filters.iter().enumerate() {
            let n = i + 1;
            base.push((format!("Filter.{n}.Name"), name.to_string()));
            for (j, value) in values.iter().enumerate() {
                base.push((format!("Filter.{n}.Value.{}", j + 1), value.to_string()));
            }
        }

        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut params = base.clone();
            if let Some(token) = &next_token {
                params.push(("NextToken".to_string(), token.clone()));
            }

            let xml = self
                .call("DescribeInstances", &params)
                .await
                .map_err(|e| e.error)?;
            let page: DescribeInstancesResponse = quick_xml::de::from_str(&xml)?;

            instances.extend(
                page.reservation_set
                    .items
                    .into_iter()
                    .flat_map(|r| r.instances_set.items),
            );

            next_token = page.next_token.filter(|t| !t.is_empty());
            if next_token.is_none() {
                return Ok(instances);
            }
        }

        warn!(max_pages = MAX_PAGES, "DescribeInstances truncated at page limit");
        Ok(instances)
    }

    /// One `TerminateInstances` call for at most [`TERMINATE_BATCH_SIZE`] ids.
    async fn terminate_batch(&self, batch: &[InstanceId]) -> Result<(), ApiError> {
        let params: Vec<_> = batch
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("InstanceId.{}", i + 1), id.to_string()))
            .collect();

        self.call("TerminateInstances", &params).await.map(|_| ())
    }

    /// Convert a wire instance, skipping ones whose tag or id is unusable.
    fn to_instance(&self, wire: WireInstance) -> Option<ComputeInstance> {
        let tag_value = wire
            .tag_set
            .items
            .into_iter()
            .find(|t| t.key == self.correlation_tag)?
            .value;

        let correlation_key = match CorrelationKey::try_from(tag_value) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    instance_id = %wire.instance_id,
                    tag = %self.correlation_tag,
                    error = %e,
                    "Instance has invalid correlation tag, skipping"
                );
                return None;
            }
        };

        let id = match InstanceId::try_from(wire.instance_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "EC2 returned invalid instance id, skipping");
                return None;
            }
        };

        Some(ComputeInstance {
            id,
            correlation_key,
            lifecycle_state: LifecycleState::from_wire(&wire.instance_state.name),
        })
    }
}

#[async_trait]
impl ComputeProvider for Ec2ComputeProvider {
    async fn find_terminal_instances(&self) -> Result<Vec<ComputeInstance>, ProviderError> {
        let wire = self
            .describe_instances(&[
                ("tag-key", vec![self.correlation_tag.as_str()]),
                ("instance-state-name", vec!["terminated", "shutting-down"]),
            ])
            .await?;

        Ok(wire
            .into_iter()
            .filter_map(|w| self.to_instance(w))
            .filter(|i| i.lifecycle_state.is_terminal())
            .collect())
    }

    async fn find_instances_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Vec<ComputeInstance>, ProviderError> {
        let tag_filter = format!("tag:{}", self.correlation_tag);
        let wire = self
            .describe_instances(&[
                (tag_filter.as_str(), vec![key.as_str()]),
                ("instance-state-name", LIVE_STATES.to_vec()),
            ])
            .await?;

        Ok(wire
            .into_iter()
            .filter_map(|w| self.to_instance(w))
            .filter(|i| &i.correlation_key == key)
            .collect())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ProviderError> {
        for batch in ids.chunks(TERMINATE_BATCH_SIZE) {
            match self.terminate_batch(batch).await {
                Ok(()) => {
                    info!(
                        instance_ids = ?batch.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
                        "EC2 termination requested"
                    );
                }
                Err(e) if e.is_not_found() && batch.len() == 1 => {
                    info!(instance_id = %batch[0], "EC2 instance already gone");
                }
                // One missing id fails the whole call. Retry per id so the
                // ids that do exist are still terminated.
                Err(e) if e.is_not_found() => {
                    debug!(
                        batch_size = batch.len(),
                        "Batch hit a missing instance, terminating one at a time"
                    );
                    for id in batch {
                        match self.terminate_batch(std::slice::from_ref(id)).await {
                            Ok(()) => info!(instance_id = %id, "EC2 termination requested"),
                            Err(e) if e.is_not_found() => {
                                info!(instance_id = %id, "EC2 instance already gone");
                            }
                            Err(e) => return Err(e.error),
                        }
                    }
                }
                Err(e) => return Err(e.error),
            }
        }

        Ok(())
    }
}
