// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Error types for TunnelWorm

use thiserror::Error;

use crate::types::{ErrorKind, ProxyFailure, RuleId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("Proxy rejected the tunnel ({failure}): {message}")]
    ProxyRejected {
        failure: ProxyFailure,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Forward {rule} could not be activated: {message}")]
    ForwardBindFailed { rule: RuleId, message: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a proxy rejection error
    pub fn proxy_rejected(failure: ProxyFailure, message: impl Into<String>) -> Self {
        Self::ProxyRejected {
            failure,
            message: message.into(),
        }
    }

    /// Machine-distinguishable kind carried by status notifications
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Toml(_) | Error::TomlSerialize(_) => ErrorKind::Config,
            Error::ProxyUnreachable(_) => ErrorKind::ProxyUnreachable,
            Error::ProxyRejected { .. } => ErrorKind::ProxyRejected,
            Error::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Error::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Error::TransportLost(_) => ErrorKind::TransportLost,
            Error::ForwardBindFailed { .. } => ErrorKind::ForwardBindFailed,
            Error::Channel(_) => ErrorKind::Channel,
            Error::Io(_) => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same attempt could succeed.
    /// Rejected credentials and bad configuration never do.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::AuthenticationFailed(_)
                | Error::Config(_)
                | Error::Toml(_)
                | Error::TomlSerialize(_)
                | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_is_not_retryable() {
        let err = Error::AuthenticationFailed("bad password".to_string());
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(Error::TransportUnavailable("refused".to_string()).is_retryable());
        assert!(Error::ProxyUnreachable("timeout".to_string()).is_retryable());
        assert!(Error::proxy_rejected(ProxyFailure::HostUnreachable, "no route").is_retryable());
    }

    #[test]
    fn test_proxy_rejected_message_names_failure() {
        let err = Error::proxy_rejected(ProxyFailure::ConnectionRefused, "reply code 5");
        assert_eq!(err.kind(), ErrorKind::ProxyRejected);
        assert!(err.to_string().contains("connection refused"));
    }
}
