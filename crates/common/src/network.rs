// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Network utility functions

use std::net::{IpAddr, SocketAddr};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    false
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", bare, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Address a listener binds to; literal IPs skip resolution
pub fn bind_target(host: &str, port: u16) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format_host_port(host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("10.0.0.1"));
        assert!(!is_loopback_address("example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("example.com", 22), "example.com:22");
        assert_eq!(format_host_port("10.0.0.1", 8080), "10.0.0.1:8080");
        assert_eq!(format_host_port("::1", 1080), "[::1]:1080");
        assert_eq!(format_host_port("[fe80::1]", 443), "[fe80::1]:443");
    }

    #[test]
    fn test_bind_target() {
        assert_eq!(bind_target("127.0.0.1", 0), "127.0.0.1:0");
        assert_eq!(bind_target("::", 1080), "[::]:1080");
        assert_eq!(bind_target("localhost", 5000), "localhost:5000");
    }
}
