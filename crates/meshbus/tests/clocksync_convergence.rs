// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-node clock convergence.
//!
//! Nodes whose internal clocks disagree by a full second must agree on
//! network time to within a few milliseconds after a handful of exchanges
//! over a zero-latency link.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{node_addr, wait_until};
use meshbus::transport::mem;
use meshbus::{BusContext, ClockSync, SystemTimeProvider, TimeProvider};

/// System clock skewed by a fixed amount, standing in for a node whose
/// internal clock is off.
struct SkewedClock(i64);

impl TimeProvider for SkewedClock {
    fn current_time_millis(&self) -> i64 {
        SystemTimeProvider.current_time_millis() + self.0
    }
}

#[test]
fn test_two_nodes_converge_to_midpoint() {
    let bus_a = BusContext::new();
    let bus_b = BusContext::new();
    bus_a.set_main_address(node_addr(1));
    bus_b.set_main_address(node_addr(2));

    let (conn_a, conn_b) = mem::link_pair(node_addr(1), node_addr(2));
    bus_a.add_connection(&conn_a);
    bus_b.add_connection(&conn_b);

    let sync_a = ClockSync::spawn_with_clock(bus_a, Arc::new(SkewedClock(500))).unwrap();
    let sync_b = ClockSync::spawn_with_clock(bus_b, Arc::new(SkewedClock(-500))).unwrap();

    // Before any exchange the network-time estimates disagree by ~1000 ms.
    let initial_gap = (sync_a.current_time_millis() - sync_b.current_time_millis()).abs();
    assert!(initial_gap > 900, "initial gap was only {} ms", initial_gap);

    // Ten exchange periods are far more than needed with zero latency.
    let converged = wait_until(Duration::from_secs(20), || {
        let gap = (sync_a.current_time_millis() - sync_b.current_time_millis()).abs();
        gap < 10
    });
    let final_gap = (sync_a.current_time_millis() - sync_b.current_time_millis()).abs();
    assert!(converged, "network times still {} ms apart", final_gap);

    // The fast node slowed down and the slow node sped up, and together the
    // corrections bridge the original 1000 ms disagreement.
    let (off_a, off_b) = (sync_a.offset_millis(), sync_b.offset_millis());
    assert!(off_a <= 0, "fast node offset {} should be negative", off_a);
    assert!(off_b >= 0, "slow node offset {} should be positive", off_b);
    assert!((900..=1100).contains(&(off_b - off_a)), "corrections {} / {}", off_a, off_b);

    sync_a.shutdown();
    sync_b.shutdown();
    conn_a.disconnect();
}

#[test]
fn test_lone_node_offset_stays_zero() {
    let bus = BusContext::new();
    bus.set_main_address(node_addr(9));
    let sync = ClockSync::spawn_with_clock(bus, Arc::new(SkewedClock(250))).unwrap();

    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(sync.offset_millis(), 0);
    sync.shutdown();
}
