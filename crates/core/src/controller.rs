// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Connection state machine
// A single actor task owns the profile, the transport and the multiplexer; every
// status transition happens inside it

use std::mem;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelworm_common::{
    ConnectionStatus, Error, ForwardRule, Result, RuleId, TunnelEvent, TunnelProfile,
};

use crate::connector::{Connection, Connector, SshConnector};
use crate::forward::Multiplexer;
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 100;
const COMMAND_CAPACITY: usize = 32;

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    AddForward(ForwardRule, oneshot::Sender<Result<RuleId>>),
    RemoveForward(RuleId, oneshot::Sender<Result<()>>),
    Configure(Box<TunnelProfile>, oneshot::Sender<Result<()>>),
    Rules(oneshot::Sender<Vec<ForwardRule>>),
    Shutdown(oneshot::Sender<()>),
}

/// Results of work spawned by the actor, tagged with the generation that spawned it
enum Internal {
    AttemptFinished {
        generation: u64,
        result: Result<Connection>,
    },
    TransportLost {
        generation: u64,
    },
    BackoffElapsed {
        generation: u64,
    },
}

enum Phase {
    Idle,
    /// `attempt` is 0 for the caller's connect, 1.. for reconnection attempts
    Connecting {
        attempt: u32,
        cancel: CancellationToken,
    },
    /// Backoff before reconnection attempt `attempt`
    Waiting {
        attempt: u32,
        cancel: CancellationToken,
    },
    Established {
        transport: Arc<dyn Transport>,
        mux: Multiplexer,
        watch: CancellationToken,
    },
}

/// Control surface of a tunnel session.
///
/// Cheap to clone; every clone talks to the same state machine.
#[derive(Clone)]
pub struct TunnelHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelHandle {
    /// Start a state machine that connects over SSH (through the proxy when enabled)
    pub fn spawn(profile: TunnelProfile) -> Self {
        Self::spawn_with_connector(profile, Arc::new(SshConnector))
    }

    pub fn spawn_with_connector(profile: TunnelProfile, connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let controller = TunnelController {
            connector,
            profile,
            status: status_tx,
            events: events.clone(),
            commands: commands_rx,
            internal_tx,
            internal_rx,
            generation: 0,
            phase: Phase::Idle,
        };
        tokio::spawn(controller.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            events,
        }
    }

    /// Start connecting. Rejects an invalid host or proxy without changing state;
    /// ignored while a transport exists or is being built.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Tear everything down; idempotent
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Add a rule; it is activated immediately when the session is established.
    /// Activation failures are reported as `ForwardFailed` events.
    pub async fn add_forward(&self, rule: ForwardRule) -> Result<RuleId> {
        self.request(|reply| Command::AddForward(rule, reply)).await?
    }

    pub async fn remove_forward(&self, id: RuleId) -> Result<()> {
        self.request(|reply| Command::RemoveForward(id, reply)).await?
    }

    /// Replace host, proxy, options and rules; only while Disconnected or Failed
    pub async fn configure(&self, profile: TunnelProfile) -> Result<()> {
        self.request(|reply| Command::Configure(Box::new(profile), reply))
            .await?
    }

    /// Current rule set, in order
    pub async fn rules(&self) -> Result<Vec<ForwardRule>> {
        self.request(Command::Rules).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Disconnect and stop the state machine; later calls return `Error::Cancelled`
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)
    }
}

struct TunnelController {
    connector: Arc<dyn Connector>,
    profile: TunnelProfile,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<TunnelEvent>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    /// Bumped whenever spawned work is superseded; stale results are dropped
    generation: u64,
    phase: Phase,
}

impl TunnelController {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        // every handle is gone
                        self.disconnect().await;
                        break;
                    }
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
            }
        }
        debug!("Tunnel controller stopped");
    }

    /// Returns false once the state machine should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::AddForward(rule, reply) => {
                let _ = reply.send(self.add_forward(rule).await);
            }
            Command::RemoveForward(id, reply) => {
                let _ = reply.send(self.remove_forward(id).await);
            }
            Command::Configure(profile, reply) => {
                let _ = reply.send(self.configure(*profile));
            }
            Command::Rules(reply) => {
                let _ = reply.send(self.profile.forwards.clone());
            }
            Command::Shutdown(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::AttemptFinished { generation, result } => {
                let attempt = match &self.phase {
                    Phase::Connecting { attempt, .. } if generation == self.generation => *attempt,
                    _ => {
                        if let Ok(connection) = result {
                            debug!("Discarding stale connection");
                            tokio::spawn(async move { connection.transport.close().await });
                        }
                        return;
                    }
                };
                match result {
                    Ok(connection) => self.on_established(connection).await,
                    Err(err) => self.on_attempt_failed(attempt, err),
                }
            }
            Internal::TransportLost { generation } => {
                if generation == self.generation && matches!(self.phase, Phase::Established { .. }) {
                    self.on_transport_lost().await;
                }
            }
            Internal::BackoffElapsed { generation } => {
                if generation != self.generation {
                    return;
                }
                if let Phase::Waiting { attempt, .. } = self.phase {
                    info!(
                        "Reconnection attempt {}/{}",
                        attempt, self.profile.options.reconnect.max_attempts
                    );
                    self.start_attempt(attempt);
                }
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        let current = self.current_status();
        if !current.can_connect() {
            debug!("connect() ignored while {}", current);
            return Ok(());
        }

        self.profile.host.validate()?;
        self.profile.proxy.validate()?;

        info!(
            "Connecting to {}@{}:{}",
            self.profile.host.username, self.profile.host.host, self.profile.host.port
        );
        self.set_status(ConnectionStatus::Connecting, None);
        self.start_attempt(0);
        Ok(())
    }

    fn start_attempt(&mut self, attempt: u32) {
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();

        let connector = self.connector.clone();
        // Each attempt gets its own copy of the secrets, wiped when it ends
        let host = self.profile.host.clone();
        let proxy = self.profile.proxy.clone();
        let options = self.profile.options.clone();
        let internal = self.internal_tx.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let timeout = options.connect_timeout();
            let attempt = async {
                match tokio::time::timeout(timeout, connector.connect(&host, &proxy, &options)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransportUnavailable(format!(
                        "Connection attempt timed out after {:?}",
                        timeout
                    ))),
                }
            };

            tokio::select! {
                _ = token.cancelled() => debug!("Connection attempt cancelled"),
                result = attempt => {
                    let _ = internal.send(Internal::AttemptFinished { generation, result });
                }
            }
        });

        self.phase = Phase::Connecting { attempt, cancel };
    }

    async fn on_established(&mut self, connection: Connection) {
        let Connection { transport, inbound } = connection;

        self.generation += 1;
        let generation = self.generation;
        let watch = CancellationToken::new();
        {
            let transport = transport.clone();
            let watch = watch.clone();
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watch.cancelled() => {}
                    _ = transport.closed() => {
                        let _ = internal.send(Internal::TransportLost { generation });
                    }
                }
            });
        }

        info!("Tunnel established to {}:{}", self.profile.host.host, self.profile.host.port);
        self.set_status(ConnectionStatus::Established, None);

        let mut mux = Multiplexer::new(
            transport.clone(),
            inbound,
            self.events.clone(),
            self.profile.options.drain_grace(),
            self.profile.options.connect_timeout(),
        );
        for rule in &self.profile.forwards {
            // failures are reported per rule
            mux.activate(rule).await;
        }

        self.phase = Phase::Established {
            transport,
            mux,
            watch,
        };
    }

    fn on_attempt_failed(&mut self, attempt: u32, err: Error) {
        error!("Connection attempt failed: {}", err);
        self.phase = Phase::Idle;

        if attempt == 0 || !err.is_retryable() {
            self.set_status(ConnectionStatus::Failed, Some(&err));
            return;
        }

        let max_attempts = self.profile.options.reconnect.max_attempts;
        if attempt >= max_attempts {
            warn!("Giving up after {} reconnection attempts", attempt);
            self.set_status(ConnectionStatus::Disconnected, Some(&err));
            return;
        }

        self.schedule_reconnect(attempt + 1);
    }

    async fn on_transport_lost(&mut self) {
        if let Phase::Established {
            transport,
            mux,
            watch,
        } = mem::replace(&mut self.phase, Phase::Idle)
        {
            watch.cancel();
            // Listeners close now; what is in flight drains alongside the reconnect
            let draining = mux.shutdown().await;
            tokio::spawn(async move {
                draining.wait().await;
                transport.close().await;
            });
        }

        let err = Error::TransportLost(format!(
            "Connection to {}:{} closed",
            self.profile.host.host, self.profile.host.port
        ));
        warn!("{}", err);

        let policy = &self.profile.options.reconnect;
        if policy.enabled && policy.max_attempts > 0 {
            self.set_status(ConnectionStatus::Reconnecting, Some(&err));
            self.schedule_reconnect(1);
        } else {
            self.set_status(ConnectionStatus::Disconnected, Some(&err));
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let policy = &self.profile.options.reconnect;
        let delay = policy.delay_for(attempt);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, attempt, policy.max_attempts
        );
        self.emit(TunnelEvent::ReconnectScheduled {
            attempt,
            max_attempts: policy.max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        });

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = internal.send(Internal::BackoffElapsed { generation });
                }
            }
        });

        self.phase = Phase::Waiting { attempt, cancel };
    }

    async fn disconnect(&mut self) {
        self.generation += 1;

        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Connecting { cancel, .. } | Phase::Waiting { cancel, .. } => cancel.cancel(),
            Phase::Established {
                transport,
                mux,
                watch,
            } => {
                watch.cancel();
                let draining = mux.shutdown().await;
                draining.wait().await;
                transport.close().await;
            }
        }

        if self.current_status() != ConnectionStatus::Disconnected {
            info!("Tunnel disconnected");
            self.set_status(ConnectionStatus::Disconnected, None);
        }
    }

    async fn add_forward(&mut self, rule: ForwardRule) -> Result<RuleId> {
        rule.validate()?;
        if self.profile.forwards.iter().any(|r| r.id == rule.id) {
            return Err(Error::Config(format!("Forward rule {} already exists", rule.id)));
        }

        let id = rule.id;
        self.profile.forwards.push(rule.clone());
        info!(rule = %id, "Added {:?} forward on port {}", rule.kind, rule.local_port);
        self.emit_rules_changed();

        if let Phase::Established { mux, .. } = &mut self.phase {
            mux.activate(&rule).await;
        }
        Ok(id)
    }

    async fn remove_forward(&mut self, id: RuleId) -> Result<()> {
        let Some(position) = self.profile.forwards.iter().position(|r| r.id == id) else {
            return Err(Error::Config(format!("Unknown forward rule {}", id)));
        };
        self.profile.forwards.remove(position);

        if let Phase::Established { mux, .. } = &mut self.phase {
            mux.deactivate(id).await;
        }

        info!(rule = %id, "Removed forward");
        self.emit(TunnelEvent::ForwardRemoved {
            rule_id: id,
            timestamp: Utc::now(),
        });
        self.emit_rules_changed();
        Ok(())
    }

    fn configure(&mut self, profile: TunnelProfile) -> Result<()> {
        let current = self.current_status();
        if !current.can_connect() {
            return Err(Error::Config(format!(
                "Cannot reconfigure the tunnel while {}",
                current
            )));
        }
        for rule in &profile.forwards {
            rule.validate()?;
        }

        let rules_changed = self.profile.forwards != profile.forwards;
        self.profile = profile;
        debug!("Tunnel reconfigured");
        if rules_changed {
            self.emit_rules_changed();
        }
        Ok(())
    }

    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, status: ConnectionStatus, cause: Option<&Error>) {
        let previous = self.status.send_replace(status);
        if previous == status {
            return;
        }
        match cause {
            Some(err) => info!("Tunnel status: {} -> {} ({})", previous, status, err),
            None => info!("Tunnel status: {} -> {}", previous, status),
        }
        self.emit(TunnelEvent::status_changed(status, cause));
    }

    fn emit_rules_changed(&self) {
        self.emit(TunnelEvent::RulesChanged {
            rules: self.profile.forwards.clone(),
            timestamp: Utc::now(),
        });
    }

    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("No subscribers for tunnel event: {}", e);
        }
    }
}
