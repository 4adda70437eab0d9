//! Configuration for the terminator service.
//!
//! All settings come from environment variables. [`Config::from_lookup`]
//! takes the lookup function explicitly so tests never touch the process
//! environment.

use std::time::Duration;

use nodereap_reconcile::{RetryPolicy, DEFAULT_RETRY_BACKOFF};
use thiserror::Error;
use url::Url;

use crate::compute::Credentials;

pub const DEFAULT_REGISTRY_URL: &str = "https://cloud.docker.com";
pub const DEFAULT_CORRELATION_TAG: &str = "Docker-Cloud-UUID";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;
pub const DEFAULT_ERROR_BUFFER: usize = 256;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Invalid or missing configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: &'static str },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Terminator configuration (env-driven).
#[derive(Clone)]
pub struct Config {
    /// Interval between polls, shared by every poller.
    pub poll_interval: Duration,

    /// Node registry base URL.
    pub registry_url: Url,

    /// Value sent as the registry `Authorization` header.
    pub registry_auth: String,

    pub credentials: Credentials,
    pub region: String,

    /// Overrides the regional EC2 endpoint.
    pub ec2_endpoint: Option<Url>,

    /// Instance tag whose value is the correlation key.
    pub correlation_tag: String,

    /// Capacity of each key channel between a poller and its loop.
    pub channel_capacity: usize,

    /// Capacity of the error sink.
    pub error_buffer: usize,

    pub http_timeout: Duration,

    /// 0 disables retry of failed actions.
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,

    /// Also terminate instances of nodes the registry reports Terminated.
    pub sweep_registry_terminated: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("poll_interval", &self.poll_interval)
            .field("registry_url", &self.registry_url.as_str())
            .field("registry_auth", &"<redacted>")
            .field("credentials", &self.credentials)
            .field("region", &self.region)
            .field("ec2_endpoint", &self.ec2_endpoint.as_ref().map(Url::as_str))
            .field("correlation_tag", &self.correlation_tag)
            .field("channel_capacity", &self.channel_capacity)
            .field("error_buffer", &self.error_buffer)
            .field("http_timeout", &self.http_timeout)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("sweep_registry_terminated", &self.sweep_registry_terminated)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` and validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let poll_interval = env
            .required("NODEREAP_POLL_INTERVAL")
            .and_then(|v| parse_var("NODEREAP_POLL_INTERVAL", &v, parse_duration))?;

        let registry_url = parse_var(
            "NODEREAP_REGISTRY_URL",
            &env.optional("NODEREAP_REGISTRY_URL")
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            parse_url,
        )?;

        let registry_auth = env.required("NODEREAP_REGISTRY_AUTH")?;

        let credentials = Credentials {
            access_key_id: env.required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: env.required("AWS_SECRET_ACCESS_KEY")?,
            session_token: env.optional("AWS_SESSION_TOKEN").filter(|t| !t.is_empty()),
        };
        let region = env.required("AWS_REGION")?;

        let ec2_endpoint = env
            .optional("NODEREAP_EC2_ENDPOINT")
            .map(|v| parse_var("NODEREAP_EC2_ENDPOINT", &v, parse_url))
            .transpose()?;

        let correlation_tag = env
            .optional("NODEREAP_CORRELATION_TAG")
            .unwrap_or_else(|| DEFAULT_CORRELATION_TAG.to_string());

        let channel_capacity = env
            .parsed("NODEREAP_CHANNEL_CAPACITY", parse_number::<usize>)?
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let error_buffer = env
            .parsed("NODEREAP_ERROR_BUFFER", parse_number::<usize>)?
            .unwrap_or(DEFAULT_ERROR_BUFFER);

        let http_timeout = env
            .parsed("NODEREAP_HTTP_TIMEOUT_SECS", parse_number::<u64>)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT);

        let retry_max_attempts = env
            .parsed("NODEREAP_RETRY_MAX_ATTEMPTS", parse_number::<u32>)?
            .unwrap_or(0);
        let retry_backoff = env
            .parsed("NODEREAP_RETRY_BACKOFF_SECS", parse_number::<u64>)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_BACKOFF);

        let sweep_registry_terminated = env
            .parsed("NODEREAP_SWEEP_REGISTRY_TERMINATED", parse_bool)?
            .unwrap_or(false);

        let log_level = env
            .optional("NODEREAP_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());

        let config = Self {
            poll_interval,
            registry_url,
            registry_auth,
            credentials,
            region,
            ec2_endpoint,
            correlation_tag,
            channel_capacity,
            error_buffer,
            http_timeout,
            retry_max_attempts,
            retry_backoff,
            sweep_registry_terminated,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that parsing alone does not enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                var: "NODEREAP_POLL_INTERVAL",
            });
        }

        let non_empty = [
            ("NODEREAP_REGISTRY_AUTH", &self.registry_auth),
            ("AWS_ACCESS_KEY_ID", &self.credentials.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &self.credentials.secret_access_key),
            ("AWS_REGION", &self.region),
            ("NODEREAP_CORRELATION_TAG", &self.correlation_tag),
        ];
        for (var, value) in non_empty {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { var });
            }
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero {
                var: "NODEREAP_CHANNEL_CAPACITY",
            });
        }
        if self.error_buffer == 0 {
            return Err(ConfigError::Zero {
                var: "NODEREAP_ERROR_BUFFER",
            });
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::Zero {
                var: "NODEREAP_HTTP_TIMEOUT_SECS",
            });
        }
        if self.retry_max_attempts > 0 && self.retry_backoff.is_zero() {
            return Err(ConfigError::Zero {
                var: "NODEREAP_RETRY_BACKOFF_SECS",
            });
        }

        Ok(())
    }

    /// Retry policy for failed termination actions.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_max_attempts {
            0 => RetryPolicy::Never,
            n => RetryPolicy::bounded(n, self.retry_backoff),
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var)
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing { var })
    }

    fn parsed<T>(
        &self,
        var: &'static str,
        parse: fn(&str) -> Result<T, String>,
    ) -> Result<Option<T>, ConfigError> {
        self.optional(var)
            .map(|value| parse_var(var, &value, parse))
            .transpose()
    }
}

fn parse_var<T>(
    var: &'static str,
    value: &str,
    parse: fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    parse(value).map_err(|reason| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    })
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    s.trim().parse().map_err(|e: T::Err| e.to_string())
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

fn parse_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme {other:?}")),
    }
}

/// Parse a human-readable duration such as `30s`, `5m`, `250ms` or `1m 30s`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim()).map_err(|e| e.to_string())
}
