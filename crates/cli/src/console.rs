// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Line-oriented console for editing forwards while the tunnel runs

use std::io::BufRead;

use anyhow::{anyhow, bail, Result};
use colored::Colorize;
use tokio::sync::mpsc;

use tunnelworm_common::{ForwardRule, RuleId};
use tunnelworm_core::TunnelHandle;

use crate::forward_spec::{parse_dynamic, parse_local, parse_remote};
use crate::render::{print_rules, warn_exposed};

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Status,
    Rules,
    Add(ForwardRule),
    Remove(RuleId),
    Connect,
    Disconnect,
    Quit,
    Help,
}

const HELP: &str = "\
Commands:
  status                      show the connection status
  rules                       list forward rules
  add -L [bind:]port:host:hostport
  add -R [bind:]port:host:hostport
  add -D [bind:]port
  remove <rule-id>            remove a forward rule
  connect | disconnect
  quit";

fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "status" => ConsoleCommand::Status,
        "rules" | "list" => ConsoleCommand::Rules,
        "add" => {
            let flag = words.next().ok_or_else(|| anyhow!("add needs -L, -R or -D"))?;
            let spec = words.next().ok_or_else(|| anyhow!("add {} needs a spec", flag))?;
            let rule = match flag {
                "-L" => parse_local(spec)?,
                "-R" => parse_remote(spec)?,
                "-D" => parse_dynamic(spec)?,
                other => bail!("Unknown forward type '{}'", other),
            };
            ConsoleCommand::Add(rule)
        }
        "remove" | "rm" => {
            let id = words.next().ok_or_else(|| anyhow!("remove needs a rule id"))?;
            ConsoleCommand::Remove(id.parse().map_err(|_| anyhow!("Invalid rule id '{}'", id))?)
        }
        "connect" => ConsoleCommand::Connect,
        "disconnect" => ConsoleCommand::Disconnect,
        "quit" | "exit" => ConsoleCommand::Quit,
        "help" | "?" => ConsoleCommand::Help,
        other => bail!("Unknown command '{}' (try 'help')", other),
    };
    Ok(Some(command))
}

/// Read commands from stdin until `quit` or end of input.
/// `quit` shuts the tunnel down; end of input leaves it running.
pub async fn run(handle: TunnelHandle) {
    let mut lines = spawn_stdin_reader();

    while let Some(line) = lines.recv().await {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e.to_string().red());
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            if let Err(e) = handle.shutdown().await {
                tracing::debug!("Shutdown: {}", e);
            }
            break;
        }
        if let Err(e) = execute(&handle, command).await {
            eprintln!("{}", e.to_string().red());
        }
    }
}

/// Blocking stdin on its own thread so a pending read never holds up exit
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Console input closed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

async fn execute(handle: &TunnelHandle, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Status => println!("Status: {}", handle.status().to_string().cyan()),
        ConsoleCommand::Rules => print_rules(&handle.rules().await?),
        ConsoleCommand::Add(rule) => {
            warn_exposed(std::slice::from_ref(&rule));
            let id = handle.add_forward(rule).await?;
            println!("{}", format!("✓ Added forward {}", id).green());
        }
        ConsoleCommand::Remove(id) => {
            handle.remove_forward(id).await?;
            println!("{}", format!("✓ Removed forward {}", id).green());
        }
        ConsoleCommand::Connect => handle.connect().await?,
        ConsoleCommand::Disconnect => handle.disconnect().await?,
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
