// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Configuration structures for TunnelWorm

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credential::GuardedSecret;
use crate::error::{Error, Result};
use crate::types::{ForwardKind, ProxyKind, RuleId};

/// Everything a configuration source hands to the core before `connect()`
#[derive(Debug, Clone, Default)]
pub struct TunnelProfile {
    pub host: HostConfig,
    pub proxy: ProxyConfig,
    pub forwards: Vec<ForwardRule>,
    pub options: SessionOptions,
}

impl TunnelProfile {
    /// Validate the host, the proxy (if enabled) and every rule
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        self.proxy.validate()?;
        for rule in &self.forwards {
            rule.validate()?;
        }
        Ok(())
    }
}

/// SSH server and credentials
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    pub auth: HostAuth,
    /// Expected server key fingerprint (`SHA256:...`); any key is accepted when unset
    pub host_key_fingerprint: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            auth: HostAuth::Password {
                password: GuardedSecret::new(""),
            },
            host_key_fingerprint: None,
        }
    }
}

/// How the client proves its identity to the SSH server
#[derive(Debug, Clone)]
pub enum HostAuth {
    Password {
        password: GuardedSecret,
    },
    PrivateKey {
        key_path: PathBuf,
        passphrase: Option<GuardedSecret>,
    },
}

impl HostConfig {
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: GuardedSecret,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: HostAuth::Password { password },
            host_key_fingerprint: None,
        }
    }

    pub fn with_private_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
        passphrase: Option<GuardedSecret>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: HostAuth::PrivateKey {
                key_path: key_path.into(),
                passphrase,
            },
            host_key_fingerprint: None,
        }
    }

    /// Validate the host configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("Host cannot be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config("Username cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("Port must be greater than 0".to_string()));
        }
        if let HostAuth::PrivateKey { key_path, .. } = &self.auth {
            if key_path.as_os_str().is_empty() {
                return Err(Error::Config(
                    "Key path required for key authentication".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Upstream proxy the SSH connection is routed through
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

#[derive(Debug, Clone)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: GuardedSecret,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: true,
            kind,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: GuardedSecret) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password,
        });
        self
    }

    /// Validate the proxy configuration; a disabled proxy is always valid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config("Proxy host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config(
                "Proxy port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One port forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Stable identity across edits; hand-written rules get a fresh one
    #[serde(default = "Uuid::new_v4")]
    pub id: RuleId,
    #[serde(rename = "type")]
    pub kind: ForwardKind,
    /// Listen address for Local/Dynamic, bridge target for Remote (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub local_address: String,
    pub local_port: u16,
    /// Target for Local, server-side listen address for Remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

impl ForwardRule {
    /// `-L local_port:remote_address:remote_port`
    pub fn local(local_port: u16, remote_address: impl Into<String>, remote_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ForwardKind::Local,
            local_address: default_bind_address(),
            local_port,
            remote_address: Some(remote_address.into()),
            remote_port: Some(remote_port),
        }
    }

    /// `-R remote_address:remote_port:127.0.0.1:local_port`
    pub fn remote(remote_address: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ForwardKind::Remote,
            local_address: default_bind_address(),
            local_port,
            remote_address: Some(remote_address.into()),
            remote_port: Some(remote_port),
        }
    }

    /// `-D local_port`
    pub fn dynamic(local_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ForwardKind::Dynamic,
            local_address: default_bind_address(),
            local_port,
            remote_address: None,
            remote_port: None,
        }
    }

    pub fn with_local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = address.into();
        self
    }

    /// Validate the rule
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(Error::Config(format!(
                "Local port required for {} forwarding",
                kind_label(self.kind)
            )));
        }
        if self.local_address.trim().is_empty() {
            return Err(Error::Config("Local address cannot be empty".to_string()));
        }
        match self.kind {
            ForwardKind::Local | ForwardKind::Remote => {
                match self.remote_address.as_deref() {
                    Some(addr) if !addr.trim().is_empty() => {}
                    _ => return Err(Error::Config("Remote address required".to_string())),
                }
                match self.remote_port {
                    Some(port) if port != 0 => {}
                    _ => return Err(Error::Config("Remote port required".to_string())),
                }
            }
            ForwardKind::Dynamic => {}
        }
        Ok(())
    }

    /// Remote target as `(address, port)`; only meaningful for validated Local/Remote rules
    pub fn remote_target(&self) -> Option<(&str, u16)> {
        match (self.remote_address.as_deref(), self.remote_port) {
            (Some(addr), Some(port)) => Some((addr, port)),
            _ => None,
        }
    }
}

fn kind_label(kind: ForwardKind) -> &'static str {
    match kind {
        ForwardKind::Local => "local",
        ForwardKind::Remote => "remote",
        ForwardKind::Dynamic => "dynamic",
    }
}

/// Session behavior and timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Timeout for proxy traversal plus SSH handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    /// Unanswered keepalives before the transport counts as lost
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    /// SSH window size in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Maximum SSH packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Disable Nagle on the transport socket
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// How long in-flight splices may drain after their rule is removed
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Capped exponential backoff for automatic reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    /// Consecutive failed attempts before giving up
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

// Default value functions
fn default_ssh_port() -> u16 {
    22
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_keepalive() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_window_size() -> u32 {
    2097152 // 2 MiB
}

fn default_max_packet_size() -> u32 {
    65535
}

fn default_nodelay() -> bool {
    true
}

fn default_drain_grace() -> u64 {
    2000
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
            keepalive_max: default_keepalive_max(),
            window_size: default_window_size(),
            max_packet_size: default_max_packet_size(),
            nodelay: default_nodelay(),
            drain_grace_ms: default_drain_grace(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            max_attempts: default_reconnect_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before attempt `attempt` (1-based): `min(initial * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostConfig {
        HostConfig::with_password("example.com", 22, "user", GuardedSecret::new("pw"))
    }

    #[test]
    fn test_host_validation() {
        assert!(host().validate().is_ok());

        let mut invalid = host();
        invalid.host = "".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = host();
        invalid.username = "  ".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = host();
        invalid.port = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_key_auth_requires_path() {
        let config = HostConfig::with_private_key("example.com", 22, "user", "", None);
        assert!(config.validate().is_err());

        let config =
            HostConfig::with_private_key("example.com", 22, "user", "/home/user/.ssh/id_ed25519", None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_proxy_is_not_validated() {
        let proxy = ProxyConfig::default();
        assert!(!proxy.enabled);
        assert!(proxy.validate().is_ok());

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "", 1080);
        assert!(proxy.validate().is_err());

        let proxy = ProxyConfig::new(ProxyKind::Http, "proxy.local", 0);
        assert!(proxy.validate().is_err());

        let proxy = ProxyConfig::new(ProxyKind::Http, "proxy.local", 3128);
        assert!(proxy.validate().is_ok());
    }

    #[test]
    fn test_rule_validation() {
        assert!(ForwardRule::local(5432, "db.internal", 5432).validate().is_ok());
        assert!(ForwardRule::remote("0.0.0.0", 8080, 3000).validate().is_ok());
        assert!(ForwardRule::dynamic(1080).validate().is_ok());

        assert!(ForwardRule::dynamic(0).validate().is_err());
        assert!(ForwardRule::local(5432, "", 5432).validate().is_err());
        assert!(ForwardRule::local(5432, "db.internal", 0).validate().is_err());

        let mut rule = ForwardRule::remote("0.0.0.0", 8080, 3000);
        rule.remote_address = None;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_ids_are_unique() {
        let a = ForwardRule::dynamic(1080);
        let b = ForwardRule::dynamic(1080);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ReconnectPolicy {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_session_options_defaults_from_empty_toml() {
        let options: SessionOptions = toml::from_str("").unwrap();
        assert_eq!(options, SessionOptions::default());
        assert_eq!(options.keepalive_interval(), Some(Duration::from_secs(30)));
        assert_eq!(options.reconnect.max_attempts, 5);
    }
}
