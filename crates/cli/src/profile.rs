// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// TunnelWorm - CLI Profile Module
// TOML profile file; secrets come from the environment or a prompt, never from the file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use dialoguer::Password;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tunnelworm_common::{
    ForwardRule, GuardedSecret, HostAuth, HostConfig, ProxyConfig, ProxyKind, SessionOptions,
    TunnelProfile,
};
use tunnelworm_core::key_is_encrypted;

/// Where secrets come from when a profile is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Secrets {
    /// Environment first, then an interactive prompt (also for encrypted keys)
    Prompt,
    /// Environment only; a missing password is an error
    Environment,
    /// Empty placeholders, for validation without credentials
    Placeholder,
}

/// On-disk profile
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileFile {
    pub host: HostSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub options: SessionOptions,
    #[serde(default, rename = "forward")]
    pub forwards: Vec<ForwardRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostSection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Private key; password authentication is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Environment variable holding the password or key passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            key_path: None,
            secret_env: None,
            host_key_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Environment variable holding the proxy password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}

impl ProfileFile {
    /// Load a profile from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse profile {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Get the path to the default profile file
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnelworm").join("profile.toml"))
    }

    /// Resolve secrets and build what the core consumes
    pub fn into_profile(self, secrets: Secrets) -> Result<TunnelProfile> {
        let host = self.host.resolve(secrets)?;
        let proxy = match self.proxy {
            Some(proxy) => proxy.resolve(secrets)?,
            None => ProxyConfig::default(),
        };

        Ok(TunnelProfile {
            host,
            proxy,
            forwards: self.forwards,
            options: self.options,
        })
    }
}

impl HostSection {
    fn resolve(self, secrets: Secrets) -> Result<HostConfig> {
        let secret = read_env_secret(self.secret_env.as_deref(), secrets)?;

        let mut config = match self.key_path {
            Some(key_path) => {
                let key_path = PathBuf::from(shellexpand::tilde(&key_path).to_string());
                let passphrase = match secret {
                    Some(passphrase) => Some(passphrase),
                    None if secrets == Secrets::Prompt && key_is_encrypted(&key_path) => Some(
                        prompt_secret(&format!("Passphrase for {}", key_path.display()))?,
                    ),
                    // An unencrypted key needs no passphrase
                    None => None,
                };
                HostConfig::with_private_key(&self.host, self.port, &self.username, key_path, passphrase)
            }
            None => {
                let password = match secret {
                    Some(password) => password,
                    None if secrets == Secrets::Prompt => prompt_secret(&format!(
                        "Password for {}@{}",
                        self.username, self.host
                    ))?,
                    None if secrets == Secrets::Placeholder => GuardedSecret::new(""),
                    None => bail!(
                        "No password for {}@{}: set secret_env in the profile",
                        self.username,
                        self.host
                    ),
                };
                HostConfig::with_password(&self.host, self.port, &self.username, password)
            }
        };
        config.host_key_fingerprint = self.host_key_fingerprint;
        Ok(config)
    }
}

impl ProxySection {
    fn resolve(self, secrets: Secrets) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::new(self.kind, &self.host, self.port);
        config.enabled = self.enabled;

        if let Some(username) = self.username {
            let password = match read_env_secret(self.password_env.as_deref(), secrets)? {
                Some(password) => password,
                None if secrets == Secrets::Prompt => {
                    prompt_secret(&format!("Proxy password for {}@{}", username, self.host))?
                }
                None => GuardedSecret::new(""),
            };
            config = config.with_credentials(username, password);
        }
        Ok(config)
    }
}

fn read_env_secret(var: Option<&str>, secrets: Secrets) -> Result<Option<GuardedSecret>> {
    let Some(var) = var else {
        return Ok(None);
    };
    match secrets {
        Secrets::Placeholder => Ok(Some(GuardedSecret::new(""))),
        Secrets::Environment => {
            let value = std::env::var(var)
                .with_context(|| format!("Environment variable {} is not set", var))?;
            Ok(Some(GuardedSecret::from(value)))
        }
        Secrets::Prompt => match std::env::var(var) {
            Ok(value) => Ok(Some(GuardedSecret::from(value))),
            Err(_) => {
                // the caller prompts instead
                debug!("{} is not set", var);
                Ok(None)
            }
        },
    }
}

fn prompt_secret(prompt: &str) -> Result<GuardedSecret> {
    let value = Password::new()
        .with_prompt(prompt)
        .interact()
        .context("Failed to read password input")?;
    Ok(GuardedSecret::from(value))
}

/// True when `auth` will use a key file
pub fn uses_key(auth: &HostAuth) -> bool {
    matches!(auth, HostAuth::PrivateKey { .. })
}
