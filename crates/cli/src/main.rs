// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// TunnelWorm - CLI
// Drives one tunnel session from a TOML profile

mod console;
mod forward_spec;
mod profile;
mod render;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{Confirm, Input};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelworm_common::{ConnectionStatus, ForwardRule, ForwardRuleSet, TunnelEvent};
use tunnelworm_core::TunnelHandle;

use profile::{ProfileFile, Secrets};

#[derive(Parser)]
#[command(name = "tunnelworm")]
#[command(about = "SSH tunnel with proxy traversal and live port forwarding", long_about = None)]
#[command(version)]
struct Cli {
    /// Profile file (default: <config dir>/tunnelworm/profile.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and forward until Ctrl+C
    Connect {
        /// Extra local forward, [bind_address:]port:host:hostport
        #[arg(short = 'L', long = "local")]
        local: Vec<String>,

        /// Extra remote forward, [bind_address:]port:host:hostport
        #[arg(short = 'R', long = "remote")]
        remote: Vec<String>,

        /// Extra SOCKS forward, [bind_address:]port
        #[arg(short = 'D', long = "dynamic")]
        dynamic: Vec<String>,

        /// Write the rule set here whenever it changes
        #[arg(long)]
        save_rules: Option<PathBuf>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Do not read commands from stdin
        #[arg(long)]
        no_console: bool,

        /// Never prompt; secrets must come from the environment
        #[arg(short = 'y', long)]
        non_interactive: bool,
    },

    /// Validate the profile and show what would be forwarded
    Check,

    /// Print the profile's forward rules in their persisted form
    Rules,

    /// Write a starter profile
    Init {
        /// Overwrite an existing profile
        #[arg(long)]
        force: bool,

        /// Skip interactive prompts (use defaults)
        #[arg(short = 'y', long)]
        non_interactive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelworm=info,tunnelworm_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Connect {
            local,
            remote,
            dynamic,
            save_rules,
            json,
            no_console,
            non_interactive,
        } => {
            let mut extra = Vec::new();
            for spec in &local {
                extra.push(forward_spec::parse_local(spec).with_context(|| format!("-L {}", spec))?);
            }
            for spec in &remote {
                extra.push(forward_spec::parse_remote(spec).with_context(|| format!("-R {}", spec))?);
            }
            for spec in &dynamic {
                extra.push(forward_spec::parse_dynamic(spec).with_context(|| format!("-D {}", spec))?);
            }

            let secrets = if non_interactive {
                Secrets::Environment
            } else {
                Secrets::Prompt
            };
            let options = RunOptions {
                save_rules,
                json,
                console: !no_console,
            };
            connect(config, secrets, extra, options).await?;
        }
        Commands::Check => check_profile(config)?,
        Commands::Rules => {
            let file = ProfileFile::load(config)?;
            let set = ForwardRuleSet::new(file.forwards);
            if set.is_empty() {
                eprintln!("{}", "No forward rules in profile".yellow());
                return Ok(());
            }
            for rule in &set.rules {
                rule.validate()?;
            }
            print!("{}", set.to_toml()?);
        }
        Commands::Init {
            force,
            non_interactive,
        } => init_profile(config, force, non_interactive)?,
    }

    Ok(())
}

struct RunOptions {
    save_rules: Option<PathBuf>,
    json: bool,
    console: bool,
}

async fn connect(
    config: Option<&Path>,
    secrets: Secrets,
    extra: Vec<ForwardRule>,
    options: RunOptions,
) -> Result<()> {
    let profile = ProfileFile::load(config)?.into_profile(secrets)?;
    profile.validate().context("Invalid profile")?;

    println!(
        "{}",
        format!(
            "Connecting to {}@{}:{}",
            profile.host.username, profile.host.host, profile.host.port
        )
        .green()
        .bold()
    );
    if profile.proxy.enabled {
        println!(
            "  via {:?} proxy {}:{}",
            profile.proxy.kind, profile.proxy.host, profile.proxy.port
        );
    }

    render::warn_exposed(&profile.forwards);
    render::warn_exposed(&extra);

    let handle = TunnelHandle::spawn(profile);
    let (printer_done, printer_stop) = oneshot::channel();
    let printer = tokio::spawn(print_events(
        handle.subscribe(),
        printer_stop,
        options.json,
        options.save_rules.clone(),
    ));

    for rule in extra {
        handle.add_forward(rule).await?;
    }
    handle.connect().await.context("Failed to start connection")?;

    if options.console {
        println!(
            "{}",
            "Type 'help' for commands. Press Ctrl+C to disconnect.".dimmed()
        );
        tokio::spawn(console::run(handle.clone()));
    } else {
        println!("{}", "Press Ctrl+C to disconnect.".dimmed());
    }

    let outcome = wait_for_end(&handle, options.console).await;

    if let Err(e) = handle.shutdown().await {
        // already stopped from the console
        tracing::debug!("Shutdown: {}", e);
    }
    let _ = printer_done.send(());
    let _ = printer.await;

    match outcome {
        Outcome::Interrupted | Outcome::Stopped => {
            println!("{}", "✓ Tunnel closed".green().bold());
            Ok(())
        }
        Outcome::Ended(status) => bail!("Tunnel ended: {}", status),
    }
}

enum Outcome {
    Interrupted,
    /// The state machine was shut down (console `quit`)
    Stopped,
    /// Failed, or gave up reconnecting
    Ended(ConnectionStatus),
}

async fn wait_for_end(handle: &TunnelHandle, console: bool) -> Outcome {
    let mut status = handle.watch_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("Interrupted, disconnecting");
                return Outcome::Interrupted;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Outcome::Stopped;
                }
                let current = *status.borrow_and_update();
                // With a console the user may reconnect by hand
                if !console
                    && matches!(current, ConnectionStatus::Failed | ConnectionStatus::Disconnected)
                {
                    return Outcome::Ended(current);
                }
            }
        }
    }
}

/// Print events until `stop` fires, then flush what is already queued
async fn print_events(
    mut events: broadcast::Receiver<TunnelEvent>,
    mut stop: oneshot::Receiver<()>,
    json: bool,
    save_rules: Option<PathBuf>,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = &mut stop => break,
        };
        match received {
            Ok(event) => handle_event(&event, json, save_rules.as_deref()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }

    while let Ok(event) = events.try_recv() {
        handle_event(&event, json, save_rules.as_deref());
    }
}

fn handle_event(event: &TunnelEvent, json: bool, save_rules: Option<&Path>) {
    render::print_event(event, json);

    if let (TunnelEvent::RulesChanged { rules, .. }, Some(path)) = (event, save_rules) {
        let set = ForwardRuleSet::new(rules.clone());
        match set.save(path) {
            Ok(()) => info!("Saved {} rule(s) to {}", set.len(), path.display()),
            Err(e) => warn!("Failed to save rules to {}: {}", path.display(), e),
        }
    }
}

fn check_profile(config: Option<&Path>) -> Result<()> {
    let profile = ProfileFile::load(config)?.into_profile(Secrets::Placeholder)?;
    profile.validate()?;

    println!("{}", "✓ Profile is valid".green().bold());
    println!(
        "  Remote: {}@{}:{}",
        profile.host.username, profile.host.host, profile.host.port
    );
    let auth = if profile::uses_key(&profile.host.auth) {
        "Private key"
    } else {
        "Password"
    };
    println!("  Auth: {}", auth);
    if let Some(fingerprint) = &profile.host.host_key_fingerprint {
        println!("  Host key: {}", fingerprint);
    }
    if profile.proxy.enabled {
        println!(
            "  Proxy: {:?} {}:{}",
            profile.proxy.kind, profile.proxy.host, profile.proxy.port
        );
    }
    let reconnect = &profile.options.reconnect;
    if reconnect.enabled {
        println!(
            "  Reconnect: up to {} attempts, {}ms → {}ms",
            reconnect.max_attempts, reconnect.initial_delay_ms, reconnect.max_delay_ms
        );
    }
    println!();
    println!("{}", "Forwards:".bold());
    render::print_rules(&profile.forwards);
    render::warn_exposed(&profile.forwards);
    Ok(())
}

fn init_profile(config: Option<&Path>, force: bool, non_interactive: bool) -> Result<()> {
    let path = match config {
        Some(path) => path.to_path_buf(),
        None => ProfileFile::default_path()?,
    };

    if path.exists() && !force {
        let overwrite = !non_interactive
            && Confirm::new()
                .with_prompt(format!("{} exists. Overwrite?", path.display()))
                .default(false)
                .interact()
                .context("Failed to read confirmation")?;
        if !overwrite {
            println!("{}", "Profile left unchanged".dimmed());
            return Ok(());
        }
    }

    let mut file = ProfileFile::default();
    file.host.username = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    file.host.host = "ssh.example.com".to_string();
    file.host.secret_env = Some("TUNNELWORM_PASSWORD".to_string());
    file.forwards.push(ForwardRule::dynamic(1080));

    if !non_interactive {
        file.host.host = Input::new()
            .with_prompt("SSH host")
            .default(file.host.host)
            .interact_text()
            .context("Failed to read input")?;
        file.host.port = Input::new()
            .with_prompt("SSH port")
            .default(file.host.port)
            .interact_text()
            .context("Failed to read input")?;
        file.host.username = Input::new()
            .with_prompt("Username")
            .default(file.host.username)
            .interact_text()
            .context("Failed to read input")?;
        let key_path: String = Input::new()
            .with_prompt("Private key (empty for password)")
            .allow_empty(true)
            .interact_text()
            .context("Failed to read input")?;
        if !key_path.trim().is_empty() {
            file.host.key_path = Some(key_path.trim().to_string());
            file.host.secret_env = None;
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = toml::to_string_pretty(&file).context("Failed to encode profile")?;
    fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{}", "✓ Profile created".green().bold());
    println!("  Saved to: {}", path.display().to_string().dimmed());
    println!(
        "Next: {}",
        format!("tunnelworm --config {} connect", path.display()).yellow()
    );
    Ok(())
}
