// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simplified Flood Routing Protocol.
//!
//! Every `HELLO_TIME` the daemon floods a HELLO announcing this node on all
//! active connections. Nodes relay HELLOs they have not seen (newer sequence
//! number, or equal sequence over a strictly shorter path), incrementing the
//! hop count, and remember the connection a HELLO arrived on as the next hop
//! back toward its originator. The result is a distance-vector-free
//! forwarding table good enough for small meshes.
//!
//! HELLO payload (24 octets, big-endian):
//!
//! ```text
//! +----------+-----------+---------------+----------+--------------------+
//! | seq (2B) | hops (2B) | validity (2B) | rsvd (2B)| originator (16B)   |
//! +----------+-----------+---------------+----------+--------------------+
//! ```
//!
//! A route that is not refreshed within its validity window is invalidated
//! but kept in the table, so a late HELLO with an old sequence number is
//! still recognized as old.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::addr::InterfaceAddress;
use crate::bus::{
    BusConnection, BusContext, ConnectionChange, ConnectionChangeListener, DatagramListener,
};
use crate::protocol::Datagram;
use crate::routing::{NamingProvider, RoutingProvider};
use crate::time::{MonotonicTimeProvider, TimeProvider};
use crate::Result;

/// Reserved DMP port for SFRP traffic.
pub const SFRP_PORT: u16 = 50054;

/// HELLO flood period in milliseconds.
pub const HELLO_TIME_MS: u64 = 1000;

const HELLO_LEN: usize = 24;

/// What happened to a route in the forwarding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    Added,
    Removed,
}

/// Observer of route add/remove events.
pub trait RouteChangeListener: Send + Sync {
    fn route_changed(&self, dest: &InterfaceAddress, change: RouteChange);
}

/// Decoded HELLO flood message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hello {
    seq: u16,
    hops: u16,
    valid_ms: u16,
    originator: InterfaceAddress,
}

impl Hello {
    fn encode(&self) -> [u8; HELLO_LEN] {
        let mut buf = [0u8; HELLO_LEN];
        buf[0..2].copy_from_slice(&self.seq.to_be_bytes());
        buf[2..4].copy_from_slice(&self.hops.to_be_bytes());
        buf[4..6].copy_from_slice(&self.valid_ms.to_be_bytes());
        // buf[6..8] reserved.
        buf[8..24].copy_from_slice(self.originator.octets());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != HELLO_LEN {
            return None;
        }
        let mut originator = [0u8; 16];
        originator.copy_from_slice(&buf[8..24]);
        Some(Self {
            seq: u16::from_be_bytes([buf[0], buf[1]]),
            hops: u16::from_be_bytes([buf[2], buf[3]]),
            valid_ms: u16::from_be_bytes([buf[4], buf[5]]),
            originator: InterfaceAddress::new(originator),
        })
    }
}

/// Forwarding-table entry for one remote device, keyed by its main address.
struct DeviceRecord {
    seq: u16,
    dist: u32,
    valid_ms: u64,
    last_update: i64,
    hop: BusConnection,
    route_valid: bool,
}

struct SfrpState {
    bus: BusContext,
    clock: Arc<dyn TimeProvider>,
    devices: Mutex<HashMap<InterfaceAddress, DeviceRecord>>,
    route_listeners: Mutex<Vec<Arc<dyn RouteChangeListener>>>,
    last_seq: Mutex<u16>,
}

impl SfrpState {
    fn dispatch_route_change(&self, dest: &InterfaceAddress, change: RouteChange) {
        let snapshot: Vec<_> = lock(&self.route_listeners).clone();
        for listener in snapshot {
            listener.route_changed(dest, change);
        }
    }

    /// Flood one HELLO announcing this node on every active connection.
    fn send_hellos(&self) {
        let Some(main) = self.bus.main_address() else {
            return;
        };
        let seq = {
            let mut last = lock(&self.last_seq);
            *last = last.wrapping_add(1);
            *last
        };
        let hello = Hello {
            seq,
            hops: 1,
            valid_ms: (2 * HELLO_TIME_MS) as u16,
            originator: main,
        };
        let datagram = match Datagram::new(SFRP_PORT, hello.encode().to_vec()) {
            Ok(d) => d,
            Err(e) => {
                log::error!("[sfrp] building HELLO failed: {}", e);
                return;
            }
        };
        for conn in self.bus.connections() {
            if let Err(e) = self.bus.send(Some(&conn), &datagram) {
                log::warn!("[sfrp] flood on connection {} failed: {}", conn.id(), e);
            }
        }
    }

    /// Invalidate routes whose validity window elapsed without a refresh.
    ///
    /// Expired records stay in the table with `route_valid = false` so their
    /// sequence history survives; they are simply no longer routable.
    fn purge_device_records(&self) {
        let now = self.clock.current_time_millis();
        let mut expired = Vec::new();
        {
            let mut devices = lock(&self.devices);
            for (addr, rec) in devices.iter_mut() {
                if rec.route_valid && now - rec.last_update > rec.valid_ms as i64 {
                    rec.route_valid = false;
                    expired.push(*addr);
                }
            }
        }
        for addr in expired {
            log::debug!("[sfrp] route to {} expired", addr);
            self.dispatch_route_change(&addr, RouteChange::Removed);
        }
    }

    fn handle_hello(&self, conn: &BusConnection, hello: Hello) {
        // Our own flood coming back: ignore it completely.
        if Some(hello.originator) == self.bus.main_address() {
            return;
        }

        let mut new_route = false;
        let relay = {
            let mut devices = lock(&self.devices);
            let relay = match devices.get(&hello.originator) {
                None => {
                    new_route = true;
                    true
                }
                Some(rec) => {
                    // Newer sequence number wins; a sequence far below the
                    // last one seen is treated as a 16-bit wrap-around.
                    let newer = i32::from(hello.seq) > i32::from(rec.seq)
                        || i32::from(hello.seq) < i32::from(rec.seq) - 32768;
                    let shorter =
                        hello.seq == rec.seq && u32::from(hello.hops) < rec.dist;
                    newer || shorter
                }
            };
            if relay {
                if let Some(rec) = devices.get(&hello.originator) {
                    if !rec.route_valid {
                        new_route = true;
                    }
                }
                devices.insert(
                    hello.originator,
                    DeviceRecord {
                        seq: hello.seq,
                        dist: u32::from(hello.hops),
                        valid_ms: u64::from(hello.valid_ms),
                        last_update: self.clock.current_time_millis(),
                        hop: conn.clone(),
                        route_valid: true,
                    },
                );
            }
            relay
        };
        if !relay {
            return;
        }

        // Relay with the hop count incremented, to everyone but the sender.
        let relayed = Hello {
            hops: hello.hops.wrapping_add(1),
            ..hello
        };
        match Datagram::new(SFRP_PORT, relayed.encode().to_vec()) {
            Ok(datagram) => {
                for peer in self.bus.connections() {
                    if peer == *conn {
                        continue;
                    }
                    if let Err(e) = self.bus.send(Some(&peer), &datagram) {
                        log::warn!("[sfrp] relay on connection {} failed: {}", peer.id(), e);
                    }
                }
            }
            Err(e) => log::error!("[sfrp] building relay HELLO failed: {}", e),
        }

        if new_route {
            log::debug!(
                "[sfrp] route to {} via connection {} ({} hops)",
                hello.originator,
                conn.id(),
                hello.hops
            );
            self.dispatch_route_change(&hello.originator, RouteChange::Added);
        }
    }
}

impl ConnectionChangeListener for SfrpState {
    /// A route is only as alive as its next-hop connection: when the bus
    /// drops a connection, every route through it is invalidated at once
    /// rather than lingering until its validity window runs out.
    fn connection_changed(&self, conn: &BusConnection, change: ConnectionChange) {
        if change != ConnectionChange::Removed {
            return;
        }
        let mut lost = Vec::new();
        {
            let mut devices = lock(&self.devices);
            for (addr, rec) in devices.iter_mut() {
                if rec.route_valid && rec.hop == *conn {
                    rec.route_valid = false;
                    lost.push(*addr);
                }
            }
        }
        for addr in lost {
            log::debug!("[sfrp] route to {} lost with connection {}", addr, conn.id());
            self.dispatch_route_change(&addr, RouteChange::Removed);
        }
    }
}

impl DatagramListener for SfrpState {
    fn receive_datagram(&self, conn: Option<&BusConnection>, datagram: &Datagram) {
        // A HELLO delivered locally has no arrival connection and therefore
        // no usable next hop; only connection traffic updates the table.
        let Some(conn) = conn else { return };
        match Hello::decode(datagram.payload()) {
            Some(hello) => self.handle_hello(conn, hello),
            None => log::debug!(
                "[sfrp] malformed HELLO ({} octets) on connection {}",
                datagram.payload().len(),
                conn.id()
            ),
        }
    }
}

/// Handle to a running SFRP daemon.
///
/// Created with [`Sfrp::spawn`]; the daemon thread floods HELLOs and sweeps
/// the device table until the handle is shut down or dropped. The handle is
/// also the crate's [`RoutingProvider`] implementation.
///
/// # Examples
/// ```no_run
/// use meshbus::{BusContext, Sfrp};
///
/// let bus = BusContext::new();
/// let sfrp = Sfrp::spawn(bus).unwrap();
/// // ... wire up connections; routes appear as HELLOs arrive ...
/// sfrp.shutdown();
/// ```
pub struct Sfrp {
    state: Arc<SfrpState>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sfrp {
    /// Bind the SFRP port on `bus` and start the daemon thread.
    ///
    /// Uses a monotonic clock for route ageing; fails with
    /// [`Error::PortInUse`](crate::Error::PortInUse) if another service holds
    /// port 50054.
    pub fn spawn(bus: BusContext) -> Result<Self> {
        Self::spawn_with_clock(bus, Arc::new(MonotonicTimeProvider::new()))
    }

    /// As [`Sfrp::spawn`], with an explicit clock for route ageing.
    pub fn spawn_with_clock(bus: BusContext, clock: Arc<dyn TimeProvider>) -> Result<Self> {
        let state = Arc::new(SfrpState {
            bus: bus.clone(),
            clock,
            devices: Mutex::new(HashMap::new()),
            route_listeners: Mutex::new(Vec::new()),
            last_seq: Mutex::new(0),
        });
        bus.bind(
            Arc::clone(&state) as Arc<dyn DatagramListener>,
            SFRP_PORT,
        )?;
        bus.add_connection_change_listener(Arc::clone(&state) as Arc<dyn ConnectionChangeListener>);

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || daemon_loop(state, shutdown))
        };
        Ok(Self {
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Add a route change listener. Adding the same listener twice is a
    /// no-op.
    pub fn add_route_change_listener(&self, listener: Arc<dyn RouteChangeListener>) {
        let mut listeners = lock(&self.state.route_listeners);
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a route change listener; a no-op if it was never added.
    pub fn remove_route_change_listener(&self, listener: &Arc<dyn RouteChangeListener>) {
        lock(&self.state.route_listeners).retain(|l| !same_listener(l, listener));
    }

    /// Destinations currently routable, with their hop distances.
    pub fn valid_routes(&self) -> Vec<(InterfaceAddress, u32)> {
        lock(&self.state.devices)
            .iter()
            .filter(|(_, rec)| rec.route_valid)
            .map(|(addr, rec)| (*addr, rec.dist))
            .collect()
    }

    /// Stop the daemon thread and release the SFRP port.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let listener = Arc::clone(&self.state) as Arc<dyn DatagramListener>;
        self.state.bus.unbind(&listener, None);
        let watcher = Arc::clone(&self.state) as Arc<dyn ConnectionChangeListener>;
        self.state.bus.remove_connection_change_listener(&watcher);
    }
}

impl Drop for Sfrp {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RoutingProvider for Sfrp {
    fn next_hop(&self, dest: &InterfaceAddress) -> Option<BusConnection> {
        lock(&self.state.devices)
            .get(dest)
            .filter(|rec| rec.route_valid)
            .map(|rec| rec.hop.clone())
    }
}

impl NamingProvider for Sfrp {
    // Devices do not advertise names; the lookup seam exists for richer
    // routing daemons.
    fn address_by_name(&self, _name: &str) -> Option<InterfaceAddress> {
        None
    }

    fn name_by_address(&self, _address: &InterfaceAddress) -> Option<String> {
        None
    }
}

fn daemon_loop(state: Arc<SfrpState>, shutdown: Arc<AtomicBool>) {
    log::info!("[sfrp] daemon started");
    while !shutdown.load(Ordering::Acquire) {
        state.send_hellos();
        state.purge_device_records();

        // Chunked sleep so shutdown stays responsive.
        let deadline = std::time::Instant::now() + Duration::from_millis(HELLO_TIME_MS);
        while std::time::Instant::now() < deadline {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
    log::info!("[sfrp] daemon stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn same_listener(a: &Arc<dyn RouteChangeListener>, b: &Arc<dyn RouteChangeListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// Tests
// ============================================================================
