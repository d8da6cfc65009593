// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// OpenSSH-style forward specifications (-L, -R, -D)

use anyhow::{anyhow, bail, Context, Result};

use tunnelworm_common::ForwardRule;

/// `-L [bind_address:]port:host:hostport`
pub fn parse_local(spec: &str) -> Result<ForwardRule> {
    let parts = split_spec(spec)?;
    let rule = match parts.as_slice() {
        [port, host, host_port] => ForwardRule::local(parse_port(port)?, host.clone(), parse_port(host_port)?),
        [bind, port, host, host_port] => {
            ForwardRule::local(parse_port(port)?, host.clone(), parse_port(host_port)?)
                .with_local_address(bind.clone())
        }
        _ => bail!("Expected [bind_address:]port:host:hostport, got '{}'", spec),
    };
    rule.validate()?;
    Ok(rule)
}

/// `-R [bind_address:]port:host:hostport`; the server listens, `host:hostport` is reached locally
pub fn parse_remote(spec: &str) -> Result<ForwardRule> {
    let parts = split_spec(spec)?;
    let (bind, port, host, host_port) = match parts.as_slice() {
        [port, host, host_port] => ("127.0.0.1", port, host, host_port),
        [bind, port, host, host_port] => (bind.as_str(), port, host, host_port),
        _ => bail!("Expected [bind_address:]port:host:hostport, got '{}'", spec),
    };
    let rule = ForwardRule::remote(bind, parse_port(port)?, parse_port(host_port)?)
        .with_local_address(host.clone());
    rule.validate()?;
    Ok(rule)
}

/// `-D [bind_address:]port`
pub fn parse_dynamic(spec: &str) -> Result<ForwardRule> {
    let parts = split_spec(spec)?;
    let rule = match parts.as_slice() {
        [port] => ForwardRule::dynamic(parse_port(port)?),
        [bind, port] => ForwardRule::dynamic(parse_port(port)?).with_local_address(bind.clone()),
        _ => bail!("Expected [bind_address:]port, got '{}'", spec),
    };
    rule.validate()?;
    Ok(rule)
}

/// Split on ':' outside of square brackets; brackets are stripped from IPv6 literals
fn split_spec(spec: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;

    for c in spec.trim().chars() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            ':' if !in_brackets => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if in_brackets {
        bail!("Unterminated '[' in '{}'", spec);
    }
    parts.push(current);

    if parts.iter().any(|p| p.is_empty()) {
        return Err(anyhow!("Empty field in '{}'", spec));
    }
    Ok(parts)
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("Invalid port '{}'", value))
}
