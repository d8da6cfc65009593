// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Local forwarding: accept on a local port, tunnel each connection to the remote target

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelworm_common::{bind_target, Error, ForwardRule, Result};

use super::splice::{spawn_connection, splice};
use super::BindingContext;
use crate::transport::Transport;

/// Bind the listening socket of a Local or Dynamic rule
pub(crate) async fn bind_listener(rule: &ForwardRule) -> Result<TcpListener> {
    let bind_addr = bind_target(&rule.local_address, rule.local_port);

    match TcpListener::bind(&bind_addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(Error::ForwardBindFailed {
            rule: rule.id,
            message: format!(
                "Permission denied binding to {}. Port {} is privileged (<=1024) and requires elevated permissions",
                bind_addr, rule.local_port
            ),
        }),
        Err(e) => Err(Error::ForwardBindFailed {
            rule: rule.id,
            message: format!("Failed to bind to {}: {}", bind_addr, e),
        }),
    }
}

/// Accept loop of a Local rule; returns (dropping the listener) once `stop` fires
pub(crate) async fn run_local_listener(
    listener: TcpListener,
    rule: ForwardRule,
    ctx: BindingContext,
    stop: CancellationToken,
) {
    let Some((remote_host, remote_port)) = rule
        .remote_target()
        .map(|(host, port)| (host.to_string(), port))
    else {
        error!(rule = %rule.id, "Local forward without a remote target");
        return;
    };

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(rule = %rule.id, "Accepted connection from {}", peer_addr);
                let transport = ctx.transport.clone();
                let splices = ctx.splices.clone();
                let host = remote_host.clone();
                spawn_connection(&ctx.tracker, &ctx.splices, async move {
                    handle_local_connection(stream, peer_addr, transport, &host, remote_port, splices)
                        .await
                });
            }
            Err(e) => {
                warn!(rule = %rule.id, "Failed to accept connection: {}", e);
            }
        }
    }

    info!(rule = %rule.id, "Stopped listening on {}:{}", rule.local_address, rule.local_port);
}

async fn handle_local_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    remote_host: &str,
    remote_port: u16,
    splices: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    let channel = match transport
        .open_direct_tcpip(remote_host, remote_port, peer_addr)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open channel to {}:{} for {}: {}",
                remote_host, remote_port, peer_addr, e
            );
            return;
        }
    };

    if let Err(e) = splice(stream, channel, splices).await {
        debug!("Forward connection ended: {}", e);
    }
}
