// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Common types for TunnelWorm

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ForwardRule;
use crate::error::Error;

/// Stable identity of a forwarding rule
pub type RuleId = Uuid;

/// Type of port forwarding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ForwardKind {
    /// Local port forwarding (bind local port, forward to remote)
    Local,
    /// Remote port forwarding (bind remote port, forward to local)
    Remote,
    /// Dynamic port forwarding (SOCKS proxy)
    Dynamic,
}

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Socks4,
    Socks5,
}

/// Status of the tunnel session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected, // no transport, nothing in flight
    Connecting,   // proxy traversal + SSH handshake + auth
    Established,  // transport authenticated, forwards active
    Reconnecting, // transport lost, backoff attempts running
    Failed,       // last attempt failed, waiting for the caller
}

impl ConnectionStatus {
    /// Check if `connect()` may start a new attempt from this status
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Established => "Established",
            ConnectionStatus::Reconnecting => "Reconnecting",
            ConnectionStatus::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// Machine-distinguishable failure kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    ProxyUnreachable,
    ProxyRejected,
    AuthenticationFailed,
    TransportUnavailable,
    TransportLost,
    ForwardBindFailed,
    Channel,
    Io,
    Cancelled,
}

/// Why a proxy refused to open the tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyFailure {
    /// SOCKS5 0x01 / SOCKS4 0x5B, or an HTTP status without a more specific meaning
    GeneralFailure,
    /// SOCKS5 0x02 / HTTP 403
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    /// Proxy credentials missing or rejected (SOCKS5 auth, SOCKS4 identd, HTTP 407)
    AuthenticationFailed,
    /// No authentication method offered by us is acceptable to the proxy
    NoAcceptableMethods,
    /// Malformed or unexpected reply
    Protocol,
}

impl fmt::Display for ProxyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProxyFailure::GeneralFailure => "general failure",
            ProxyFailure::NotAllowed => "not allowed by ruleset",
            ProxyFailure::NetworkUnreachable => "network unreachable",
            ProxyFailure::HostUnreachable => "host unreachable",
            ProxyFailure::ConnectionRefused => "connection refused",
            ProxyFailure::TtlExpired => "TTL expired",
            ProxyFailure::CommandNotSupported => "command not supported",
            ProxyFailure::AddressTypeNotSupported => "address type not supported",
            ProxyFailure::AuthenticationFailed => "authentication failed",
            ProxyFailure::NoAcceptableMethods => "no acceptable authentication methods",
            ProxyFailure::Protocol => "protocol error",
        };
        f.write_str(label)
    }
}

/// Events emitted by the tunnel session core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// The connection status transitioned
    StatusChanged {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        timestamp: DateTime<Utc>,
    },

    /// A reconnection attempt is waiting for its backoff delay
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A forwarding rule is live
    ForwardActivated {
        rule_id: RuleId,
        bound_port: u16,
        timestamp: DateTime<Utc>,
    },

    /// A forwarding rule could not be activated (session unaffected)
    ForwardFailed {
        rule_id: RuleId,
        error_kind: ErrorKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A forwarding rule was torn down at the caller's request
    ForwardRemoved {
        rule_id: RuleId,
        timestamp: DateTime<Utc>,
    },

    /// The configured rule set changed; consumers may persist it
    RulesChanged {
        rules: Vec<ForwardRule>,
        timestamp: DateTime<Utc>,
    },
}

impl TunnelEvent {
    pub fn status_changed(status: ConnectionStatus, cause: Option<&Error>) -> Self {
        TunnelEvent::StatusChanged {
            status,
            reason: cause.map(|e| e.to_string()),
            error_kind: cause.map(Error::kind),
            timestamp: Utc::now(),
        }
    }

    pub fn forward_failed(rule_id: RuleId, cause: &Error) -> Self {
        TunnelEvent::ForwardFailed {
            rule_id,
            error_kind: cause.kind(),
            reason: cause.to_string(),
            timestamp: Utc::now(),
        }
    }
}
