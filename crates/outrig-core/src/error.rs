use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// JSON body returned by a plugin for any non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub message: String,
    pub status_code: u16,
}

impl ErrorEnvelope {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status_code)
    }
}

impl std::error::Error for ErrorEnvelope {}

/// Failures talking to a plugin over the wire.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid location `{location}`: {reason}")]
    InvalidLocation { location: String, reason: String },
    #[error("unsupported connection type `{0}`")]
    UnsupportedConnectionType(String),
    #[error("timed out after {0:?} waiting for plugin")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("plugin returned status {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode request payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode plugin response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl WireError {
    pub(crate) fn transport(err: impl fmt::Display) -> Self {
        WireError::Transport(err.to_string())
    }

    /// Status code reported by the plugin, if the failure came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            WireError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Which kind of provider holds a capability type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderKind {
    Internal,
    External,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Internal => f.write_str("internal"),
            ProviderKind::External => f.write_str("external"),
        }
    }
}

/// A plugin that could not be signalled during shutdown.
#[derive(Debug)]
pub struct ShutdownFailure {
    pub plugin: String,
    pub reason: String,
}

impl fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to signal plugin {}: {}", self.plugin, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{existing} plugin for type {capability:?} already registered")]
    Conflict {
        capability: String,
        existing: ProviderKind,
    },
    #[error("no plugin found for type {0:?}")]
    NotFound(String),
    #[error("plugin {0} declares no capability types")]
    NoCapabilities(String),
    #[error("failed to start plugin {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for plugin {id} to start: {source}")]
    Handshake {
        id: String,
        #[source]
        source: WireError,
    },
    #[error("{}", join_failures(.0))]
    Shutdown(Vec<ShutdownFailure>),
}

fn join_failures(failures: &[ShutdownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no plugins found in {}", .0.display())]
    NoPluginsFound(PathBuf),
    #[error("failed to discover plugins in {}: {source}", dir.display())]
    Discovery {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("could not determine connection type: {0}")]
    ConnectionProbe(#[source] std::io::Error),
}

/// Why a single candidate was left out of a registration batch.
#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    #[error("capabilities query failed: {0}")]
    Capabilities(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CandidateError {
    pub fn reason(&self) -> &'static str {
        match self {
            CandidateError::Capabilities(_)
            | CandidateError::Registry(RegistryError::NoCapabilities(_)) => "capabilities",
            CandidateError::Registry(RegistryError::Conflict { .. }) => "conflict",
            CandidateError::Registry(RegistryError::Handshake { .. }) => "handshake",
            CandidateError::Registry(_) => "spawn",
        }
    }
}

/// Work was stopped more often than it was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("work counter underflow: stop_work called with no work in flight")]
pub struct WorkUnderflow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_error_joins_every_failure() {
        let err = RegistryError::Shutdown(vec![
            ShutdownFailure {
                plugin: "a".into(),
                reason: "ESRCH".into(),
            },
            ShutdownFailure {
                plugin: "b".into(),
                reason: "EPERM".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("plugin a: ESRCH"));
        assert!(text.contains("plugin b: EPERM"));
    }

    #[test]
    fn envelope_uses_camel_case_status() {
        let envelope: ErrorEnvelope =
            serde_json::from_str(r#"{"message":"boom","statusCode":418}"#).unwrap();
        assert_eq!(envelope, ErrorEnvelope::new(418, "boom"));
    }
}
