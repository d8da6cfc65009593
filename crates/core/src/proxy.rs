// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Proxy traversal
// Produces the byte stream the SSH handshake runs over, either directly or through
// an HTTP CONNECT, SOCKS4 or SOCKS5 proxy

use std::net::{IpAddr, SocketAddrV4};
use std::time::Duration;

use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, info};

use tunnelworm_common::{format_host_port, Error, ProxyConfig, ProxyFailure, ProxyKind, Result};

/// Open a stream to `dest_host:dest_port`, through the proxy when it is enabled.
///
/// `timeout` bounds the TCP connect and, separately, the proxy handshake.
pub async fn open_stream(
    dest_host: &str,
    dest_port: u16,
    proxy: &ProxyConfig,
    timeout: Duration,
) -> Result<TcpStream> {
    if !proxy.enabled {
        let addr = format_host_port(dest_host, dest_port);
        debug!("Connecting directly to {}", addr);
        return match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::TransportUnavailable(format!(
                "Failed to connect to {}: {}",
                addr, e
            ))),
            Err(_) => Err(Error::TransportUnavailable(format!(
                "Connection to {} timed out after {:?}",
                addr, timeout
            ))),
        };
    }

    let proxy_addr = format_host_port(&proxy.host, proxy.port);
    info!(
        "Connecting to {} via {:?} proxy {}",
        format_host_port(dest_host, dest_port),
        proxy.kind,
        proxy_addr
    );

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&proxy_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::ProxyUnreachable(format!(
                "Failed to connect to proxy {}: {}",
                proxy_addr, e
            )))
        }
        Err(_) => {
            return Err(Error::ProxyUnreachable(format!(
                "Connection to proxy {} timed out after {:?}",
                proxy_addr, timeout
            )))
        }
    };

    match tokio::time::timeout(timeout, handshake(stream, dest_host, dest_port, proxy)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ProxyUnreachable(format!(
            "Proxy {} did not complete the handshake within {:?}",
            proxy_addr, timeout
        ))),
    }
}

/// Run the proxy handshake for `proxy.kind` over an already connected stream
pub async fn handshake<S>(stream: S, dest_host: &str, dest_port: u16, proxy: &ProxyConfig) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy.kind {
        ProxyKind::Http => http_connect(stream, dest_host, dest_port, proxy).await,
        ProxyKind::Socks4 => socks4_connect(stream, dest_host, dest_port, proxy).await,
        ProxyKind::Socks5 => socks5_connect(stream, dest_host, dest_port, proxy).await,
    }
}

async fn http_connect<S>(mut stream: S, dest_host: &str, dest_port: u16, proxy: &ProxyConfig) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match &proxy.credentials {
        Some(creds) => {
            let password = creds.password.expose();
            http_connect_tokio_with_basic_auth(
                &mut stream,
                dest_host,
                dest_port,
                &creds.username,
                &password,
            )
            .await
        }
        None => http_connect_tokio(&mut stream, dest_host, dest_port).await,
    };

    match result {
        Ok(()) => {
            debug!("HTTP proxy tunnel established");
            Ok(stream)
        }
        Err(e) => {
            // The client only takes 200 as success; the rest of 2xx also opens the tunnel.
            // The response head has been consumed either way.
            let message = e.to_string();
            match http_status(&message) {
                Some(code) if (200..300).contains(&code) => {
                    debug!("HTTP proxy tunnel established (status {})", code);
                    Ok(stream)
                }
                code => Err(Error::proxy_rejected(http_failure(code), message)),
            }
        }
    }
}

/// Status code in an HTTP CONNECT error: the last three-digit number, since the
/// message may also mention the expected 200
fn http_status(message: &str) -> Option<u16> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| part.len() == 3)
        .last()
        .and_then(|part| part.parse::<u16>().ok())
}

fn http_failure(code: Option<u16>) -> ProxyFailure {
    match code {
        Some(407) | Some(401) => ProxyFailure::AuthenticationFailed,
        Some(403) => ProxyFailure::NotAllowed,
        Some(502) | Some(503) => ProxyFailure::HostUnreachable,
        Some(504) => ProxyFailure::TtlExpired,
        Some(_) => ProxyFailure::GeneralFailure,
        None => ProxyFailure::Protocol,
    }
}

async fn socks4_connect<S>(stream: S, dest_host: &str, dest_port: u16, proxy: &ProxyConfig) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS4 carries only IPv4 destinations
    let target = resolve_ipv4(dest_host, dest_port).await?;
    let result = match &proxy.credentials {
        Some(creds) if !creds.username.is_empty() => {
            Socks4Stream::connect_with_userid_and_socket(stream, target, &creds.username).await
        }
        _ => Socks4Stream::connect_with_socket(stream, target).await,
    };

    result
        .map(|s| {
            debug!("SOCKS4 proxy tunnel established to {}", target);
            s.into_inner()
        })
        .map_err(socks_error)
}

async fn socks5_connect<S>(stream: S, dest_host: &str, dest_port: u16, proxy: &ProxyConfig) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = (dest_host, dest_port);
    let result = match &proxy.credentials {
        Some(creds) => {
            let password = creds.password.expose();
            Socks5Stream::connect_with_password_and_socket(stream, target, &creds.username, &password)
                .await
        }
        None => Socks5Stream::connect_with_socket(stream, target).await,
    };

    result
        .map(|s| {
            debug!("SOCKS5 proxy tunnel established to {}:{}", dest_host, dest_port);
            s.into_inner()
        })
        .map_err(socks_error)
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(SocketAddrV4::new(v4, port)),
            IpAddr::V6(_) => Err(Error::proxy_rejected(
                ProxyFailure::AddressTypeNotSupported,
                format!("SOCKS4 cannot reach IPv6 destination {}", host),
            )),
        };
    }

    let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        Error::proxy_rejected(
            ProxyFailure::HostUnreachable,
            format!("Failed to resolve {} for SOCKS4: {}", host, e),
        )
    })?;

    addrs
        .filter_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4),
            std::net::SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            Error::proxy_rejected(
                ProxyFailure::AddressTypeNotSupported,
                format!("{} has no IPv4 address for SOCKS4", host),
            )
        })
}

fn socks_error(err: tokio_socks::Error) -> Error {
    use tokio_socks::Error as S;

    let failure = match &err {
        S::Io(e) => return Error::ProxyUnreachable(format!("Proxy connection failed: {}", e)),
        S::ProxyServerUnreachable => {
            return Error::ProxyUnreachable("Proxy server unreachable".to_string())
        }
        S::GeneralSocksServerFailure => ProxyFailure::GeneralFailure,
        S::ConnectionNotAllowedByRuleset => ProxyFailure::NotAllowed,
        S::NetworkUnreachable => ProxyFailure::NetworkUnreachable,
        S::HostUnreachable => ProxyFailure::HostUnreachable,
        S::ConnectionRefused => ProxyFailure::ConnectionRefused,
        S::TtlExpired => ProxyFailure::TtlExpired,
        S::CommandNotSupported => ProxyFailure::CommandNotSupported,
        S::AddressTypeNotSupported => ProxyFailure::AddressTypeNotSupported,
        S::NoAcceptableAuthMethods => ProxyFailure::NoAcceptableMethods,
        S::PasswordAuthFailure(_)
        | S::IdentdAuthFailure
        | S::InvalidUserIdAuthFailure
        | S::InvalidAuthValues(_) => ProxyFailure::AuthenticationFailed,
        _ => ProxyFailure::Protocol,
    };
    Error::proxy_rejected(failure, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tunnelworm_common::{ErrorKind, GuardedSecret};

    /// Read one SOCKS5 greeting and CONNECT request, answer with `reply`
    async fn fake_socks5(mut server: DuplexStream, reply: u8) -> Vec<u8> {
        let mut header = [0u8; 2];
        server.read_exact(&mut header).await.unwrap();
        let mut methods = vec![0u8; header[1] as usize];
        server.read_exact(&mut methods).await.unwrap();

        if methods.contains(&0x02) {
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut ver_ulen = [0u8; 2];
            server.read_exact(&mut ver_ulen).await.unwrap();
            let mut user = vec![0u8; ver_ulen[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            server.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            server.read_exact(&mut pass).await.unwrap();
            server.write_all(&[0x01, 0x00]).await.unwrap();
        } else {
            server.write_all(&[0x05, 0x00]).await.unwrap();
        }

        let mut request = [0u8; 4];
        server.read_exact(&mut request).await.unwrap();
        let mut dest = match request[3] {
            0x01 => vec![0u8; 4],
            0x04 => vec![0u8; 16],
            _ => {
                let mut len = [0u8; 1];
                server.read_exact(&mut len).await.unwrap();
                vec![0u8; len[0] as usize]
            }
        };
        server.read_exact(&mut dest).await.unwrap();
        let mut port = [0u8; 2];
        server.read_exact(&mut port).await.unwrap();

        server
            .write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        if reply == 0x00 {
            server.write_all(b"SSH-2.0-fake\r\n").await.unwrap();
        }
        dest
    }

    #[tokio::test]
    async fn test_socks5_success_yields_stream() {
        let (client, server) = duplex(1024);
        let proxy_task = tokio::spawn(fake_socks5(server, 0x00));

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "proxy.local", 1080);
        let mut stream = handshake(client, "ssh.example.com", 22, &proxy).await.unwrap();

        let mut banner = [0u8; 14];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-fake\r\n");
        assert_eq!(proxy_task.await.unwrap(), b"ssh.example.com".to_vec());
    }

    #[tokio::test]
    async fn test_socks5_rejection_maps_reply_code() {
        let cases = [
            (0x01, ProxyFailure::GeneralFailure),
            (0x02, ProxyFailure::NotAllowed),
            (0x04, ProxyFailure::HostUnreachable),
            (0x05, ProxyFailure::ConnectionRefused),
        ];

        for (code, expected) in cases {
            let (client, server) = duplex(1024);
            tokio::spawn(fake_socks5(server, code));

            let proxy = ProxyConfig::new(ProxyKind::Socks5, "proxy.local", 1080);
            match handshake(client, "10.0.0.5", 22, &proxy).await {
                Err(Error::ProxyRejected { failure, .. }) => assert_eq!(failure, expected),
                other => panic!("code {:#x}: unexpected result {:?}", code, other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_socks5_with_credentials() {
        let (client, server) = duplex(1024);
        tokio::spawn(fake_socks5(server, 0x00));

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "proxy.local", 1080)
            .with_credentials("alice", GuardedSecret::new("s3cret"));
        assert!(handshake(client, "10.0.0.5", 22, &proxy).await.is_ok());
    }

    #[tokio::test]
    async fn test_socks4_rejected_reply() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut request = [0u8; 8];
            server.read_exact(&mut request).await.unwrap();
            // user-id is NUL terminated
            let mut byte = [0u8; 1];
            loop {
                server.read_exact(&mut byte).await.unwrap();
                if byte[0] == 0 {
                    break;
                }
            }
            server.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let proxy = ProxyConfig::new(ProxyKind::Socks4, "proxy.local", 1080);
        let err = handshake(client, "10.0.0.5", 22, &proxy).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ProxyRejected);
    }

    #[tokio::test]
    async fn test_socks4_refuses_ipv6_destination() {
        let (client, _server) = duplex(64);
        let proxy = ProxyConfig::new(ProxyKind::Socks4, "proxy.local", 1080);
        match handshake(client, "::1", 22, &proxy).await {
            Err(Error::ProxyRejected { failure, .. }) => {
                assert_eq!(failure, ProxyFailure::AddressTypeNotSupported)
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    async fn fake_http(mut server: DuplexStream, status_line: &'static str) -> String {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        server
            .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
            .await
            .unwrap();
        String::from_utf8(request).unwrap()
    }

    #[tokio::test]
    async fn test_http_connect_success() {
        let (client, server) = duplex(4096);
        let proxy_task = tokio::spawn(fake_http(server, "HTTP/1.1 200 Connection established"));

        let proxy = ProxyConfig::new(ProxyKind::Http, "proxy.local", 3128);
        assert!(handshake(client, "ssh.example.com", 2222, &proxy).await.is_ok());

        let request = proxy_task.await.unwrap();
        assert!(request.starts_with("CONNECT ssh.example.com:2222 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_http_connect_accepts_any_2xx() {
        let (client, server) = duplex(4096);
        tokio::spawn(fake_http(server, "HTTP/1.1 202 Accepted"));

        let proxy = ProxyConfig::new(ProxyKind::Http, "proxy.local", 3128);
        assert!(handshake(client, "ssh.example.com", 22, &proxy).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_non_success_is_rejected() {
        for status in [
            "HTTP/1.1 407 Proxy Authentication Required",
            "HTTP/1.1 403 Forbidden",
            "HTTP/1.1 502 Bad Gateway",
        ] {
            let (client, server) = duplex(4096);
            tokio::spawn(fake_http(server, status));

            let proxy = ProxyConfig::new(ProxyKind::Http, "proxy.local", 3128);
            let err = handshake(client, "ssh.example.com", 22, &proxy).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::ProxyRejected, "status {}", status);
        }
    }

    #[test]
    fn test_http_failure_classification() {
        assert_eq!(http_status("The HTTP code is not equal 200: 407"), Some(407));
        assert_eq!(http_status("malformed header"), None);
        assert_eq!(http_failure(Some(407)), ProxyFailure::AuthenticationFailed);
        assert_eq!(http_failure(Some(403)), ProxyFailure::NotAllowed);
        assert_eq!(http_failure(None), ProxyFailure::Protocol);
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", port);
        let err = open_stream("ssh.example.com", 22, &proxy, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ProxyUnreachable);
    }

    #[tokio::test]
    async fn test_direct_connection_when_disabled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let proxy = ProxyConfig::default();
        let stream = open_stream("127.0.0.1", port, &proxy, Duration::from_secs(2)).await;
        assert!(stream.is_ok());
    }
}
