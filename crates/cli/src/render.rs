// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Terminal output for status events and rule sets

use colored::{ColoredString, Colorize};

use tunnelworm_common::{
    is_loopback_address, ConnectionStatus, ForwardKind, ForwardRule, TunnelEvent,
};

pub fn status_label(status: ConnectionStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        ConnectionStatus::Established => label.green().bold(),
        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => label.cyan(),
        ConnectionStatus::Disconnected => label.yellow(),
        ConnectionStatus::Failed => label.red().bold(),
    }
}

/// One-line description of a rule, OpenSSH flag style
pub fn describe_rule(rule: &ForwardRule) -> String {
    match (rule.kind, rule.remote_target()) {
        (ForwardKind::Local, Some((host, port))) => format!(
            "-L {}:{} → {}:{}",
            rule.local_address, rule.local_port, host, port
        ),
        (ForwardKind::Remote, Some((host, port))) => format!(
            "-R {}:{} → {}:{}",
            host, port, rule.local_address, rule.local_port
        ),
        (ForwardKind::Dynamic, _) => format!("-D {}:{} (SOCKS)", rule.local_address, rule.local_port),
        (kind, None) => format!("{:?} {}:{}", kind, rule.local_address, rule.local_port),
    }
}

pub fn print_rules(rules: &[ForwardRule]) {
    if rules.is_empty() {
        println!("{}", "No forward rules.".yellow());
        return;
    }
    for rule in rules {
        println!("  {}  {}", rule.id.to_string().dimmed(), describe_rule(rule));
    }
}

/// Warn about listeners reachable from other machines
pub fn warn_exposed(rules: &[ForwardRule]) {
    for rule in rules {
        if rule.kind != ForwardKind::Remote && !is_loopback_address(&rule.local_address) {
            println!(
                "{}",
                format!(
                    "⚠️  {} binds to {} (accessible from local network/VMs)",
                    describe_rule(rule),
                    rule.local_address
                )
                .yellow()
            );
        }
    }
}

pub fn print_event(event: &TunnelEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        TunnelEvent::StatusChanged { status, reason, .. } => match reason {
            Some(reason) => println!("Tunnel {} ({})", status_label(*status), reason.dimmed()),
            None => println!("Tunnel {}", status_label(*status)),
        },
        TunnelEvent::ReconnectScheduled {
            attempt,
            max_attempts,
            delay_ms,
            ..
        } => println!(
            "{}",
            format!(
                "Reconnecting in {:.1}s (attempt {}/{})",
                *delay_ms as f64 / 1000.0,
                attempt,
                max_attempts
            )
            .cyan()
        ),
        TunnelEvent::ForwardActivated {
            rule_id,
            bound_port,
            ..
        } => println!(
            "{}",
            format!("✓ Forward {} active on port {}", rule_id, bound_port).green()
        ),
        TunnelEvent::ForwardFailed {
            rule_id, reason, ..
        } => eprintln!("{}", format!("✗ Forward {} failed: {}", rule_id, reason).red()),
        TunnelEvent::ForwardRemoved { rule_id, .. } => {
            println!("{}", format!("Forward {} removed", rule_id).dimmed())
        }
        TunnelEvent::RulesChanged { rules, .. } => {
            println!("{}", format!("{} forward rule(s) configured", rules.len()).dimmed())
        }
    }
}
