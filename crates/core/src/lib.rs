// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// TunnelWorm Core
// SSH session lifecycle, proxy traversal and port forwarding

pub mod connector;
pub mod controller;
pub mod forward;
pub mod proxy;
pub mod transport;

pub use connector::{Connection, Connector, SshConnector};
pub use controller::TunnelHandle;
pub use forward::{Draining, Multiplexer};
pub use proxy::open_stream;
pub use transport::{
    calculate_fingerprint, key_is_encrypted, ForwardStream, ForwardStreamIo, InboundConnection,
    Transport, TransportSession,
};
