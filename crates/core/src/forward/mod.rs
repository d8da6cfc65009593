// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Forward multiplexer
// One independent binding per rule on top of a single transport

mod local;
mod remote;
mod socks;
pub mod splice;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use tunnelworm_common::{Error, ForwardKind, ForwardRule, Result, RuleId, TunnelEvent};

use crate::transport::{InboundConnection, Transport};
use remote::{PendingForward, RouteTable};

/// What an accept loop needs to serve its connections
#[derive(Clone)]
pub(crate) struct BindingContext {
    pub transport: Arc<dyn Transport>,
    /// Fires when the drain grace is over and open splices must close
    pub splices: CancellationToken,
    pub tracker: TaskTracker,
}

/// A live rule
struct ActiveBinding {
    rule: ForwardRule,
    /// Stops the accept loop, or abandons a pending Remote request
    stop: CancellationToken,
    /// Accept loop (Local/Dynamic) or server request (Remote); once it has
    /// finished after `stop`, the port is free and no route can appear
    task: JoinHandle<()>,
    splices: CancellationToken,
    tracker: TaskTracker,
}

/// In-flight connections left behind by a shutdown
pub struct Draining {
    bindings: Vec<(TaskTracker, CancellationToken)>,
    grace: Duration,
}

impl Draining {
    /// Wait for every remaining splice, cutting them off after the grace period
    pub async fn wait(self) {
        let grace = self.grace;
        let drains = self
            .bindings
            .into_iter()
            .map(|(tracker, splices)| tokio::spawn(splice::drain(tracker, splices, grace)));
        for drain in drains.collect::<Vec<_>>() {
            let _ = drain.await;
        }
    }
}

/// Live mapping from rule to binding for one transport
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    bindings: HashMap<RuleId, ActiveBinding>,
    routes: RouteTable,
    router_stop: CancellationToken,
    router_task: JoinHandle<()>,
    events: broadcast::Sender<TunnelEvent>,
    drain_grace: Duration,
    /// Bound on server round trips (`tcpip-forward` and its cancellation)
    request_timeout: Duration,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundConnection>,
        events: broadcast::Sender<TunnelEvent>,
        drain_grace: Duration,
        request_timeout: Duration,
    ) -> Self {
        let routes: RouteTable = Arc::new(RwLock::new(Vec::new()));
        let router_stop = CancellationToken::new();
        let router_task = tokio::spawn(remote::route_inbound(
            inbound,
            routes.clone(),
            router_stop.clone(),
        ));

        Self {
            transport,
            bindings: HashMap::new(),
            routes,
            router_stop,
            router_task,
            events,
            drain_grace,
            request_timeout,
        }
    }

    /// Activate `rule`, reporting the outcome as `ForwardActivated` / `ForwardFailed`.
    ///
    /// Failure only affects this rule. Local and Dynamic listeners are bound before
    /// this returns; a Remote rule waits for the server in the background.
    pub async fn activate(&mut self, rule: &ForwardRule) {
        if self.bindings.contains_key(&rule.id) {
            return;
        }

        match self.bind(rule).await {
            Ok(binding) => {
                self.bindings.insert(rule.id, binding);
            }
            Err(e) => report_failed(&self.events, rule.id, e),
        }
    }

    async fn bind(&self, rule: &ForwardRule) -> Result<ActiveBinding> {
        rule.validate()?;

        let stop = CancellationToken::new();
        let splices = CancellationToken::new();
        let tracker = TaskTracker::new();

        let task = match rule.kind {
            ForwardKind::Local | ForwardKind::Dynamic => {
                let listener = local::bind_listener(rule).await?;
                let bound_port = listener.local_addr()?.port();
                info!(
                    rule = %rule.id,
                    bind = %format!("{}:{}", rule.local_address, bound_port),
                    "{:?} forward listening",
                    rule.kind
                );
                let ctx = BindingContext {
                    transport: self.transport.clone(),
                    splices: splices.clone(),
                    tracker: tracker.clone(),
                };
                let task = match rule.kind {
                    ForwardKind::Dynamic => tokio::spawn(socks::run_socks_listener(
                        listener,
                        rule.clone(),
                        ctx,
                        stop.clone(),
                    )),
                    _ => tokio::spawn(local::run_local_listener(
                        listener,
                        rule.clone(),
                        ctx,
                        stop.clone(),
                    )),
                };
                report_activated(&self.events, rule.id, bound_port);
                task
            }
            ForwardKind::Remote => {
                let pending = PendingForward {
                    rule: rule.clone(),
                    transport: self.transport.clone(),
                    routes: self.routes.clone(),
                    events: self.events.clone(),
                    tracker: tracker.clone(),
                    splices: splices.clone(),
                    timeout: self.request_timeout,
                };
                tokio::spawn(remote::request_forward(pending, stop.clone()))
            }
        };

        Ok(ActiveBinding {
            rule: rule.clone(),
            stop,
            task,
            splices,
            tracker,
        })
    }

    /// Tear down one rule. The listener is closed when this returns; in-flight
    /// connections drain in the background. Returns whether the rule was active.
    pub async fn deactivate(&mut self, id: RuleId) -> bool {
        let Some(binding) = self.bindings.remove(&id) else {
            return false;
        };
        let (tracker, splices) = self.release(binding).await;

        let grace = self.drain_grace;
        tokio::spawn(splice::drain(tracker, splices, grace));
        true
    }

    /// Close every listener and stop routing; the returned handle drains what is left
    pub async fn shutdown(mut self) -> Draining {
        self.router_stop.cancel();
        let _ = (&mut self.router_task).await;

        let mut draining = Vec::with_capacity(self.bindings.len());
        let bindings: Vec<ActiveBinding> = self.bindings.drain().map(|(_, b)| b).collect();
        for binding in bindings {
            draining.push(self.release(binding).await);
        }

        Draining {
            bindings: draining,
            grace: self.drain_grace,
        }
    }

    async fn release(&self, binding: ActiveBinding) -> (TaskTracker, CancellationToken) {
        binding.stop.cancel();
        let _ = binding.task.await;

        if binding.rule.kind == ForwardKind::Remote {
            remote::release_forward(
                &self.routes,
                binding.rule.id,
                self.transport.clone(),
                self.request_timeout,
            )
            .await;
        }

        debug!(rule = %binding.rule.id, "Forward released");
        (binding.tracker, binding.splices)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.router_stop.cancel();
        for binding in self.bindings.values() {
            binding.stop.cancel();
            binding.splices.cancel();
        }
    }
}

pub(crate) fn report_activated(events: &broadcast::Sender<TunnelEvent>, rule_id: RuleId, bound_port: u16) {
    // No subscribers is fine
    let _ = events.send(TunnelEvent::ForwardActivated {
        rule_id,
        bound_port,
        timestamp: Utc::now(),
    });
}

pub(crate) fn report_failed(events: &broadcast::Sender<TunnelEvent>, rule_id: RuleId, err: Error) {
    let err = match err {
        Error::ForwardBindFailed { .. } => err,
        other => Error::ForwardBindFailed {
            rule: rule_id,
            message: other.to_string(),
        },
    };
    warn!(rule = %rule_id, "Forward activation failed: {}", err);
    let _ = events.send(TunnelEvent::forward_failed(rule_id, &err));
}
