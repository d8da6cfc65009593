// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Remote forwarding: the server listens, inbound channels are bridged to a local address

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use tunnelworm_common::{format_host_port, Error, ForwardRule, RuleId, TunnelEvent};

use super::splice::{spawn_connection, splice};
use super::{report_activated, report_failed};
use crate::transport::{InboundConnection, Transport};

/// Where inbound connections for one server-side listener go
#[derive(Clone)]
pub(crate) struct RemoteRoute {
    pub rule_id: RuleId,
    pub bind_address: String,
    pub bound_port: u16,
    pub local_address: String,
    pub local_port: u16,
    pub tracker: TaskTracker,
    pub splices: CancellationToken,
}

pub(crate) type RouteTable = Arc<RwLock<Vec<RemoteRoute>>>;

/// A `tcpip-forward` request still waiting for the server
pub(crate) struct PendingForward {
    pub rule: ForwardRule,
    pub transport: Arc<dyn Transport>,
    pub routes: RouteTable,
    pub events: broadcast::Sender<TunnelEvent>,
    pub tracker: TaskTracker,
    pub splices: CancellationToken,
    pub timeout: Duration,
}

/// Ask the server to listen for a Remote rule and install its route.
///
/// Runs off the state machine; `stop` abandons the request.
pub(crate) async fn request_forward(pending: PendingForward, stop: CancellationToken) {
    let PendingForward {
        rule,
        transport,
        routes,
        events,
        tracker,
        splices,
        timeout,
    } = pending;
    let Some((address, port)) = rule.remote_target() else {
        report_failed(&events, rule.id, Error::Config("Remote address required".to_string()));
        return;
    };

    let request = tokio::time::timeout(timeout, transport.request_remote_forward(address, port));
    let result = tokio::select! {
        _ = stop.cancelled() => {
            debug!(rule = %rule.id, "Remote forward request abandoned");
            return;
        }
        result = request => match result {
            Ok(result) => result,
            Err(_) => Err(Error::Channel(format!(
                "Server did not answer the forward request for {} within {:?}",
                format_host_port(address, port),
                timeout
            ))),
        },
    };

    match result {
        Ok(bound_port) => {
            routes.write().await.push(RemoteRoute {
                rule_id: rule.id,
                bind_address: address.to_string(),
                bound_port,
                local_address: rule.local_address.clone(),
                local_port: rule.local_port,
                tracker,
                splices,
            });
            info!(
                rule = %rule.id,
                "Remote forward active on {}",
                format_host_port(address, bound_port)
            );
            report_activated(&events, rule.id, bound_port);
        }
        Err(e) => report_failed(&events, rule.id, e),
    }
}

/// Drop the route of `rule_id` and ask the server to stop listening, without waiting for it
pub(crate) async fn release_forward(
    routes: &RouteTable,
    rule_id: RuleId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
) {
    let route = {
        let mut routes = routes.write().await;
        let position = routes.iter().position(|route| route.rule_id == rule_id);
        position.map(|position| routes.remove(position))
    };
    let Some(route) = route else {
        return;
    };

    tokio::spawn(async move {
        let cancel = transport.cancel_remote_forward(&route.bind_address, route.bound_port);
        match tokio::time::timeout(timeout, cancel).await {
            Ok(Ok(())) => debug!(rule = %rule_id, "Remote forward cancelled"),
            Ok(Err(e)) => debug!(rule = %rule_id, "Cancelling remote forward failed: {}", e),
            Err(_) => debug!(rule = %rule_id, "Cancelling remote forward timed out"),
        }
    });
}

/// Pick the route for an inbound channel: exact address and port first, then port alone
pub(crate) fn find_route<'a>(
    routes: &'a [RemoteRoute],
    connected_address: &str,
    connected_port: u16,
) -> Option<&'a RemoteRoute> {
    routes
        .iter()
        .find(|r| r.bound_port == connected_port && r.bind_address == connected_address)
        .or_else(|| routes.iter().find(|r| r.bound_port == connected_port))
}

/// Dispatch server-initiated channels to their rule until the transport or `stop` ends
pub(crate) async fn route_inbound(
    mut inbound: mpsc::Receiver<InboundConnection>,
    routes: RouteTable,
    stop: CancellationToken,
) {
    loop {
        let connection = tokio::select! {
            _ = stop.cancelled() => break,
            connection = inbound.recv() => match connection {
                Some(connection) => connection,
                None => break,
            },
        };

        let route = {
            let routes = routes.read().await;
            find_route(&routes, &connection.connected_address, connection.connected_port).cloned()
        };

        match route {
            Some(route) => {
                debug!(
                    rule = %route.rule_id,
                    "Bridging {}:{} from {}:{} to {}",
                    connection.connected_address,
                    connection.connected_port,
                    connection.originator_address,
                    connection.originator_port,
                    format_host_port(&route.local_address, route.local_port)
                );
                let RemoteRoute {
                    local_address,
                    local_port,
                    tracker,
                    splices,
                    ..
                } = route;
                spawn_connection(
                    &tracker,
                    &splices,
                    bridge(connection, local_address, local_port, splices.clone()),
                );
            }
            None => {
                warn!(
                    "No remote forward for inbound connection on {}:{}; dropping it",
                    connection.connected_address, connection.connected_port
                );
            }
        }
    }

    info!("Stopped routing inbound forwarded connections");
}

async fn bridge(
    connection: InboundConnection,
    local_address: String,
    local_port: u16,
    splices: CancellationToken,
) {
    let target = format_host_port(&local_address, local_port);
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to connect to local target {}: {}", target, e);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    if let Err(e) = splice(stream, connection.stream, splices).await {
        debug!("Remote forward connection ended: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn route(address: &str, port: u16) -> RemoteRoute {
        RemoteRoute {
            rule_id: Uuid::new_v4(),
            bind_address: address.to_string(),
            bound_port: port,
            local_address: "127.0.0.1".to_string(),
            local_port: 3000,
            tracker: TaskTracker::new(),
            splices: CancellationToken::new(),
        }
    }

    #[test]
    fn test_find_route_prefers_exact_address() {
        let routes = vec![route("0.0.0.0", 8080), route("10.0.0.1", 8080), route("0.0.0.0", 9090)];

        let found = find_route(&routes, "10.0.0.1", 8080).unwrap();
        assert_eq!(found.rule_id, routes[1].rule_id);

        // Servers may report the connected address differently from the request
        let found = find_route(&routes, "192.168.1.5", 9090).unwrap();
        assert_eq!(found.rule_id, routes[2].rule_id);

        assert!(find_route(&routes, "0.0.0.0", 7070).is_none());
    }
}
