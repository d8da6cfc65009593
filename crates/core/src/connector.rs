// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Connection attempts: proxy traversal followed by the SSH handshake

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use tunnelworm_common::{HostConfig, ProxyConfig, Result, SessionOptions};

use crate::proxy;
use crate::transport::{InboundConnection, Transport, TransportSession};

/// An authenticated transport plus the queue of server-initiated channels
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<InboundConnection>,
}

/// Produces authenticated transports for the state machine
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &HostConfig,
        proxy: &ProxyConfig,
        options: &SessionOptions,
    ) -> Result<Connection>;
}

/// Connects over TCP (optionally through the configured proxy) and speaks SSH via russh
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &HostConfig,
        proxy: &ProxyConfig,
        options: &SessionOptions,
    ) -> Result<Connection> {
        let stream =
            proxy::open_stream(&host.host, host.port, proxy, options.connect_timeout()).await?;

        // disable nagle for lower latency
        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        let (session, inbound) = TransportSession::authenticate(stream, host, options).await?;
        Ok(Connection {
            transport: Arc::new(session),
            inbound,
        })
    }
}
