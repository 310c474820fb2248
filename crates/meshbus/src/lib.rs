// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshbus: distributed bus middleware for small robotic nodes
//!
//! A pure Rust core for meshes of resource-constrained nodes linked by
//! point-to-point stream transports (TCP, Bluetooth RFCOMM, in-memory pipes).
//! Nodes multiplex a datagram protocol (DMP) over every link, discover
//! next-hop routes by periodic flooding, agree on a network-average clock,
//! and forward delay-tolerant bundles to named endpoints several hops away.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbus::{BundleAgent, BusContext, ClockSync, Sfrp};
//! use meshbus::bundle::Bundle;
//! use std::sync::Arc;
//!
//! fn main() -> meshbus::Result<()> {
//!     let bus = BusContext::new();
//!     bus.set_main_address("fd00:0:0:0:0:0:0:1".parse()?);
//!
//!     // Routing, clock sync and the bundle agent share the bus.
//!     let sfrp = Arc::new(Sfrp::spawn(bus.clone())?);
//!     let clock = Arc::new(ClockSync::spawn(bus.clone())?);
//!     let agent = BundleAgent::spawn(bus.clone())?;
//!     agent.set_routing_provider(sfrp);
//!     agent.set_network_time_provider(clock);
//!
//!     // Transport adapters register their connections:
//!     // bus.add_connection(&conn);
//!
//!     let mut bundle = Bundle::new();
//!     bundle.destination = "dtn://[fd00:0:0:0:0:0:0:2]/echo".into();
//!     bundle.lifetime = 60;
//!     bundle.payload = b"hello mesh".to_vec();
//!     agent.send_bundle(bundle)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     Application Layer                        |
//! |        endpoint listeners | bundle submission                |
//! +-------------------------------------------------------------+
//! |                       Daemon Layer                           |
//! |   SFRP (50054) | ClockSync (50123) | BundleAgent (4556)      |
//! +-------------------------------------------------------------+
//! |                       Bus Context                            |
//! |   connection set | port bindings | per-connection workers    |
//! +-------------------------------------------------------------+
//! |                       DMP Framing                            |
//! |          port | length | checksum | payload                  |
//! +-------------------------------------------------------------+
//! |          stream transports (external adapters)               |
//! +-------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BusContext`] | Owns connections, multiplexes DMP datagrams by port |
//! | [`BusConnection`] | Handle to one full-duplex link |
//! | [`Datagram`] | One DMP frame: port + payload |
//! | [`Sfrp`] | Flood-routing daemon; the default [`RoutingProvider`] |
//! | [`ClockSync`] | Network-time service; a [`TimeProvider`] |
//! | [`BundleAgent`] | Store-and-forward engine for RFC 5050-style bundles |
//!
//! There is no global state: every subsystem takes its `BusContext` (and any
//! other collaborator) at construction, so tests run several nodes in one
//! process.

pub mod addr;
/// Bundle protocol: wire codec, endpoint handling, and the agent.
pub mod bundle;
/// Bus context, connections and DMP dispatch.
pub mod bus;
/// Clock synchronization daemon.
pub mod clocksync;
/// Wire codecs (DMP framing, SDNV).
pub mod protocol;
/// Routing and naming capability interfaces.
pub mod routing;
/// Simplified Flood Routing Protocol daemon.
pub mod sfrp;
/// Pluggable clock sources.
pub mod time;
/// In-tree transport support (in-memory pipes).
pub mod transport;

pub use addr::InterfaceAddress;
pub use bundle::agent::{BundleAgent, EndpointListener};
pub use bundle::Bundle;
pub use bus::{
    BusConnection, BusContext, ConnectionChange, ConnectionChangeListener, DatagramListener,
};
pub use clocksync::ClockSync;
pub use protocol::Datagram;
pub use routing::{NamingProvider, RoutingProvider};
pub use sfrp::{RouteChange, RouteChangeListener, Sfrp};
pub use time::{MonotonicTimeProvider, SystemTimeProvider, TimeProvider};

/// Convenience alias for results carrying [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by meshbus operations.
///
/// Protocol-shaped errors (`Truncated`, `BadVersion`, ...) are normally
/// handled by logging and dropping the offending datagram; only transport
/// failures tear a connection down.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Bus errors
    // ========================================================================
    /// A listener already holds this DMP port.
    PortInUse(u16),
    /// Port 0 is invalid on the wire and for bindings.
    InvalidPort(u16),
    /// Datagram payload exceeds the 65535-octet frame limit.
    PayloadTooLarge(usize),

    // ========================================================================
    // Address errors
    // ========================================================================
    /// 128-bit address input does not meet the length/format contract.
    MalformedAddress(String),

    // ========================================================================
    // Codec errors
    // ========================================================================
    /// A frame or block ended before its declared length.
    Truncated,
    /// Bundle protocol version other than 6.
    BadVersion(u8),
    /// Non-payload block where the payload block was required.
    BadBlockType(u8),
    /// Payload block flags other than "last block".
    BadBlockFlags(u64),
    /// SDNV longer than nine octets.
    SdnvOverflow,
    /// Attempt to encode a negative value as an SDNV.
    SdnvNegative,
    /// Endpoint string without a `scheme:ssp` shape.
    MalformedEndpoint(String),

    // ========================================================================
    // Transport errors
    // ========================================================================
    /// I/O failure on a connection stream.
    Io(std::io::Error),

    // ========================================================================
    // Bundle agent errors
    // ========================================================================
    /// Destination endpoint cannot be mapped to a host address.
    ResolutionFailed(String),
    /// Bundle queue at its high-water mark; submission dropped.
    QueueFull,
    /// Endpoint already registered.
    DuplicateEndpoint(String),
    /// Registration of the null endpoint refused.
    ReservedEndpoint(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Bus
            Error::PortInUse(port) => write!(f, "DMP port {} in use", port),
            Error::InvalidPort(port) => write!(f, "invalid DMP port {}", port),
            Error::PayloadTooLarge(len) => {
                write!(f, "payload of {} octets exceeds frame limit", len)
            }
            // Address
            Error::MalformedAddress(detail) => write!(f, "malformed address: {}", detail),
            // Codec
            Error::Truncated => write!(f, "truncated frame"),
            Error::BadVersion(v) => write!(f, "unrecognized bundle version {:#04x}", v),
            Error::BadBlockType(t) => write!(f, "unrecognized block type {:#04x}", t),
            Error::BadBlockFlags(flags) => {
                write!(f, "unrecognized payload block flags {:#x}", flags)
            }
            Error::SdnvOverflow => write!(f, "SDNV longer than nine octets"),
            Error::SdnvNegative => write!(f, "SDNVs only encode non-negative integers"),
            Error::MalformedEndpoint(ep) => write!(f, "malformed endpoint: {}", ep),
            // Transport
            Error::Io(e) => write!(f, "I/O error: {}", e),
            // Bundle agent
            Error::ResolutionFailed(ep) => write!(f, "cannot resolve host of endpoint {}", ep),
            Error::QueueFull => write!(f, "bundle queue full"),
            Error::DuplicateEndpoint(ep) => write!(f, "endpoint {} already registered", ep),
            Error::ReservedEndpoint(ep) => write!(f, "cannot register endpoint {}", ep),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::PortInUse(50054).to_string(), "DMP port 50054 in use");
        assert_eq!(Error::Truncated.to_string(), "truncated frame");
        assert_eq!(
            Error::BadVersion(5).to_string(),
            "unrecognized bundle version 0x05"
        );
        assert_eq!(Error::QueueFull.to_string(), "bundle queue full");
    }

    #[test]
    fn test_io_error_source() {
        use std::error::Error as _;
        let e = Error::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(e.source().is_some());
        assert!(Error::QueueFull.source().is_none());
    }
}
