// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Dynamic forwarding: a SOCKS4/4a/5 server whose destinations are reached through the tunnel

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelworm_common::{Error, ForwardRule, Result};

use super::splice::{spawn_connection, splice};
use super::BindingContext;
use crate::transport::Transport;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// Greeting plus CONNECT request must arrive within this
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// SOCKS5 reply codes
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

// SOCKS4 reply codes
const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocksVersion {
    V4,
    V5,
}

/// A CONNECT request read from a SOCKS client
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SocksRequest {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

/// Accept loop of a Dynamic rule
pub(crate) async fn run_socks_listener(
    listener: TcpListener,
    rule: ForwardRule,
    ctx: BindingContext,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let transport = ctx.transport.clone();
                let splices = ctx.splices.clone();
                spawn_connection(&ctx.tracker, &ctx.splices, async move {
                    if let Err(err) = handle_socks_client(stream, peer_addr, transport, splices).await {
                        debug!("SOCKS client {} failed: {}", peer_addr, err);
                    }
                });
            }
            Err(e) => {
                warn!(rule = %rule.id, "Dynamic SOCKS listener accept error: {}", e);
            }
        }
    }

    info!(rule = %rule.id, "Stopped SOCKS listener on {}:{}", rule.local_address, rule.local_port);
}

async fn handle_socks_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    splices: CancellationToken,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let request = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_request(&mut stream)).await {
        Ok(request) => request?,
        Err(_) => {
            return Err(Error::Channel(format!(
                "SOCKS handshake from {} timed out after {:?}",
                peer_addr, HANDSHAKE_TIMEOUT
            )))
        }
    };
    let Some(request) = request else {
        return Ok(());
    };
    debug!(
        "SOCKS {:?} CONNECT {}:{} from {}",
        request.version, request.host, request.port, peer_addr
    );

    let channel = match transport
        .open_direct_tcpip(&request.host, request.port, peer_addr)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            warn!(
                dest = %format!("{}:{}", request.host, request.port),
                "Failed to open SOCKS target: {}", err
            );
            let code = match err {
                Error::Channel(_) => REPLY_CONNECTION_REFUSED,
                _ => REPLY_GENERAL_FAILURE,
            };
            send_reply(&mut stream, request.version, code).await?;
            return Ok(());
        }
    };

    send_reply(&mut stream, request.version, REPLY_SUCCEEDED).await?;
    splice(stream, channel, splices).await?;
    Ok(())
}

/// Read the greeting and CONNECT request.
///
/// Returns `None` when the client asked for something unsupported; the refusal has
/// already been written in that case.
pub(crate) async fn read_request<S>(stream: &mut S) -> Result<Option<SocksRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    match version {
        SOCKS5_VERSION => read_socks5_request(stream).await,
        SOCKS4_VERSION => read_socks4_request(stream).await,
        other => {
            debug!("Unsupported SOCKS version {:#x}", other);
            Ok(None)
        }
    }
}

async fn read_socks5_request<S>(stream: &mut S) -> Result<Option<SocksRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        stream.write_all(&[SOCKS5_VERSION, 0xFF]).await?;
        return Ok(None);
    }
    stream.write_all(&[SOCKS5_VERSION, 0x00]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION || request[1] != CMD_CONNECT {
        send_reply(stream, SocksVersion::V5, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    let host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => {
            send_reply(stream, SocksVersion::V5, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };
    let port = stream.read_u16().await?;

    Ok(Some(SocksRequest {
        version: SocksVersion::V5,
        host,
        port,
    }))
}

async fn read_socks4_request<S>(stream: &mut S) -> Result<Option<SocksRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut addr = [0u8; 4];
    stream.read_exact(&mut addr).await?;
    let _user_id = read_nul_terminated(stream).await?;

    if command != CMD_CONNECT {
        send_reply(stream, SocksVersion::V4, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    // SOCKS4a: 0.0.0.x (x != 0) means a domain name follows the user id
    let host = if addr[..3] == [0, 0, 0] && addr[3] != 0 {
        read_nul_terminated(stream).await?
    } else {
        Ipv4Addr::from(addr).to_string()
    };

    Ok(Some(SocksRequest {
        version: SocksVersion::V4,
        host,
        port,
    }))
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        if bytes.len() >= 255 {
            return Err(Error::Channel("SOCKS4 field too long".to_string()));
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Write a reply; `status` uses SOCKS5 codes and is folded to granted/rejected for SOCKS4
pub(crate) async fn send_reply<W>(stream: &mut W, version: SocksVersion, status: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => {
            stream
                .write_all(&[SOCKS5_VERSION, status, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?
        }
        SocksVersion::V4 => {
            let code = if status == REPLY_SUCCEEDED {
                SOCKS4_GRANTED
            } else {
                SOCKS4_REJECTED
            };
            stream.write_all(&[0x00, code, 0, 0, 0, 0, 0, 0]).await?
        }
    }
    Ok(())
}
