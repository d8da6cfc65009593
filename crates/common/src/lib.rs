// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// TunnelWorm - Common Library
// Shared data model, guarded secrets, error taxonomy and events

pub mod config;
pub mod credential;
pub mod error;
pub mod network;
pub mod rules;
pub mod types;

pub use config::{
    ForwardRule, HostAuth, HostConfig, ProxyConfig, ProxyCredentials, ReconnectPolicy,
    SessionOptions, TunnelProfile,
};
pub use credential::GuardedSecret;
pub use error::{Error, Result};
pub use network::{bind_target, format_host_port, is_loopback_address};
pub use rules::ForwardRuleSet;
pub use types::{
    ConnectionStatus, ErrorKind, ForwardKind, ProxyFailure, ProxyKind, RuleId, TunnelEvent,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
