//! Error types shared by the collaborators and the reconciliation loops.

use std::fmt;

use nodereap_id::CorrelationKey;
use thiserror::Error;

/// Failure talking to the node registry or the compute provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The collaborator could not be reached (DNS, TCP, TLS, timeout).
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The collaborator answered with a body we could not decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// The collaborator answered with an error payload or unexpected status.
    #[error("remote error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Remote {
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    /// Stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::Decode(_) => "decode",
            Self::Remote { .. } => "remote",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::remote(Some(status.as_u16()), err.to_string())
        } else {
            Self::Connectivity(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<quick_xml::DeError> for ProviderError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Component a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    RegistryPoller,
    ComputePoller,
    Coordinator,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryPoller => "registry_poller",
            Self::ComputePoller => "compute_poller",
            Self::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation that was attempted when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListByState,
    FindTerminalInstances,
    TerminateByCorrelationKey,
    DeleteByCorrelationKey,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListByState => "ListByState",
            Self::FindTerminalInstances => "FindTerminalInstances",
            Self::TerminateByCorrelationKey => "TerminateByCorrelationKey",
            Self::DeleteByCorrelationKey => "DeleteByCorrelationKey",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure delivered to the error sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed in {origin}{}{}: {cause}",
    .key.as_ref().map(|k| format!(" for {k}")).unwrap_or_default(),
    .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct Failure {
    pub origin: Component,
    pub operation: Operation,
    pub key: Option<CorrelationKey>,
    pub detail: Option<String>,
    #[source]
    pub cause: ProviderError,
}

impl Failure {
    pub fn new(origin: Component, operation: Operation, cause: ProviderError) -> Self {
        Self {
            origin,
            operation,
            key: None,
            detail: None,
            cause,
        }
    }

    pub fn with_key(mut self, key: CorrelationKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
