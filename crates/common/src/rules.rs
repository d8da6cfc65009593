// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Persisted form of the forwarding rule set

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ForwardRule;
use crate::error::Result;

/// Ordered list of forwarding rules as written to disk.
///
/// Serialized as an array of `[[forward]]` tables so the file stays hand-editable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRuleSet {
    #[serde(default, rename = "forward")]
    pub rules: Vec<ForwardRule>,
}

impl ForwardRuleSet {
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        Self { rules }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse and validate a persisted rule set
    pub fn from_toml(content: &str) -> Result<Self> {
        let set: ForwardRuleSet = toml::from_str(content)?;
        for rule in &set.rules {
            rule.validate()?;
        }
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl From<Vec<ForwardRule>> for ForwardRuleSet {
    fn from(rules: Vec<ForwardRule>) -> Self {
        Self::new(rules)
    }
}
