// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing and naming capability interfaces.
//!
//! The bundle agent does not know how routes are computed; it asks a
//! [`RoutingProvider`] for the next hop toward a destination address. SFRP is
//! the in-tree provider, but any other routing daemon can be plugged in.
//! Likewise, [`NamingProvider`] maps between hostnames and interface
//! addresses; the core ships no resolver, only the seam.

use crate::addr::InterfaceAddress;
use crate::bus::BusConnection;

/// Source of next-hop forwarding decisions.
pub trait RoutingProvider: Send + Sync {
    /// The connection over which traffic for `dest` should be forwarded, or
    /// `None` when no route is currently known.
    fn next_hop(&self, dest: &InterfaceAddress) -> Option<BusConnection>;
}

/// Bidirectional hostname <-> interface address lookup.
pub trait NamingProvider: Send + Sync {
    /// Address registered for `name`, or `None` when unknown.
    fn address_by_name(&self, name: &str) -> Option<InterfaceAddress>;

    /// Hostname registered for `address`, or `None` when unknown.
    fn name_by_address(&self, address: &InterfaceAddress) -> Option<String>;
}

/// Routing provider that knows no routes. The bundle agent's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRouting;

impl RoutingProvider for NoRouting {
    fn next_hop(&self, _dest: &InterfaceAddress) -> Option<BusConnection> {
        None
    }
}
