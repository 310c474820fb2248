// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus context: connection ownership and DMP multiplexing.
//!
//! The [`BusContext`] owns the set of active connections and provides the
//! low-level packet multiplexing service that lets multiple daemons share
//! them transparently. For every connection it runs one receive worker
//! thread that reads DMP frames and dispatches them to the listener bound to
//! the frame's port.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         BusContext                           |
//! |  +--------------------+    +------------------------------+  |
//! |  | Active connections |    | Port bindings                |  |
//! |  | Vec<BusConnection> |    | Vec<(u16, DatagramListener)> |  |
//! |  +--------------------+    +------------------------------+  |
//! |      |  one receive worker per connection                    |
//! |      v                                                       |
//! |  read frame -> look up port binding -> listener.receive()    |
//! +--------------------------------------------------------------+
//! ```
//!
//! There is intentionally no global bus instance: a `BusContext` is an
//! explicit, cheaply clonable value handed to each subsystem at construction,
//! which is what lets tests stand up several isolated nodes in one process.

pub mod connection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::addr::InterfaceAddress;
use crate::protocol::Datagram;
use crate::{Error, Result};

pub use connection::BusConnection;

/// Receiver of DMP datagrams for a bound port.
///
/// `conn` is the connection the datagram arrived on, or `None` for a locally
/// delivered datagram (one sent with a `None` connection).
pub trait DatagramListener: Send + Sync {
    fn receive_datagram(&self, conn: Option<&BusConnection>, datagram: &Datagram);
}

/// What happened to a connection in the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    Added,
    Removed,
}

/// Observer of connection add/remove events.
pub trait ConnectionChangeListener: Send + Sync {
    fn connection_changed(&self, conn: &BusConnection, change: ConnectionChange);
}

struct PortBinding {
    port: u16,
    listener: Arc<dyn DatagramListener>,
}

struct Monitor {
    conn_id: u64,
    stop: Arc<AtomicBool>,
}

struct BusInner {
    connections: Mutex<Vec<BusConnection>>,
    monitors: Mutex<Vec<Monitor>>,
    bindings: Mutex<Vec<PortBinding>>,
    change_listeners: Mutex<Vec<Arc<dyn ConnectionChangeListener>>>,
    main_address: Mutex<Option<InterfaceAddress>>,
}

/// The distributed bus state for one node.
///
/// Cloning yields another handle to the same bus.
///
/// # Examples
/// ```
/// use meshbus::{BusContext, Datagram};
///
/// let bus = BusContext::new();
/// // Deliver a datagram locally: with no binding for the port it is
/// // silently dropped.
/// let dgram = Datagram::new(4000, vec![1, 2, 3]).unwrap();
/// bus.send(None, &dgram).unwrap();
/// ```
#[derive(Clone)]
pub struct BusContext {
    inner: Arc<BusInner>,
}

impl Default for BusContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BusContext {
    /// Create an empty bus context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                connections: Mutex::new(Vec::new()),
                monitors: Mutex::new(Vec::new()),
                bindings: Mutex::new(Vec::new()),
                change_listeners: Mutex::new(Vec::new()),
                main_address: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Port bindings
    // ========================================================================

    /// Bind `listener` to a DMP `port`.
    ///
    /// At most one listener may hold a port; a second bind fails with
    /// [`Error::PortInUse`]. Port 0 is invalid.
    pub fn bind(&self, listener: Arc<dyn DatagramListener>, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }
        let mut bindings = lock(&self.inner.bindings);
        if bindings.iter().any(|b| b.port == port) {
            return Err(Error::PortInUse(port));
        }
        bindings.push(PortBinding { port, listener });
        Ok(())
    }

    /// Unbind `listener` from `port`, or from every port when `port` is
    /// `None`. Bindings held by other listeners are untouched.
    pub fn unbind(&self, listener: &Arc<dyn DatagramListener>, port: Option<u16>) {
        let mut bindings = lock(&self.inner.bindings);
        match port {
            Some(p) => {
                if let Some(idx) = bindings
                    .iter()
                    .position(|b| b.port == p && same_listener(&b.listener, listener))
                {
                    bindings.remove(idx);
                }
            }
            None => bindings.retain(|b| !same_listener(&b.listener, listener)),
        }
    }

    // ========================================================================
    // Send / receive
    // ========================================================================

    /// Send a DMP datagram on `conn`, or deliver it locally when `conn` is
    /// `None`.
    ///
    /// An I/O failure disconnects the connection and is surfaced to the
    /// caller; the connection's receive worker then completes the bus-side
    /// removal.
    pub fn send(&self, conn: Option<&BusConnection>, datagram: &Datagram) -> Result<()> {
        match conn {
            None => {
                self.receive(None, datagram);
                Ok(())
            }
            Some(c) => c.write_datagram(datagram).map_err(|e| {
                log::debug!("[bus] send on connection {} failed: {}", c.id(), e);
                c.disconnect();
                e
            }),
        }
    }

    /// Deliver a received datagram to the listener bound to its port.
    ///
    /// With no binding for the port the datagram is silently dropped. The
    /// listener is invoked after the binding table lock has been released, so
    /// listeners are free to bind, unbind, and send.
    pub fn receive(&self, conn: Option<&BusConnection>, datagram: &Datagram) {
        let listener = {
            let bindings = lock(&self.inner.bindings);
            bindings
                .iter()
                .find(|b| b.port == datagram.port())
                .map(|b| Arc::clone(&b.listener))
        };
        if let Some(listener) = listener {
            listener.receive_datagram(conn, datagram);
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register `conn` with the bus and start its receive worker.
    ///
    /// Adding a connection that is already registered is a no-op. Change
    /// listeners are notified with [`ConnectionChange::Added`].
    pub fn add_connection(&self, conn: &BusConnection) {
        {
            let mut connections = lock(&self.inner.connections);
            if connections.iter().any(|c| c == conn) {
                return;
            }
            connections.push(conn.clone());
        }

        let stop = Arc::new(AtomicBool::new(false));
        lock(&self.inner.monitors).push(Monitor {
            conn_id: conn.id(),
            stop: Arc::clone(&stop),
        });
        let worker_bus = Arc::downgrade(&self.inner);
        let worker_conn = conn.clone();
        thread::spawn(move || receive_worker(worker_bus, worker_conn, stop));

        self.dispatch_connection_change(conn, ConnectionChange::Added);
    }

    /// Remove `conn` from the active set and signal its worker to stop.
    ///
    /// Does **not** disconnect the underlying stream; closing semantics
    /// belong to whoever owns the connection. Removing a connection that is
    /// not registered is a no-op and fires no notification.
    pub fn remove_connection(&self, conn: &BusConnection) {
        let was_present = {
            let mut connections = lock(&self.inner.connections);
            let before = connections.len();
            connections.retain(|c| c != conn);
            connections.len() != before
        };

        {
            let mut monitors = lock(&self.inner.monitors);
            if let Some(idx) = monitors.iter().position(|m| m.conn_id == conn.id()) {
                monitors[idx].stop.store(true, Ordering::Release);
                monitors.remove(idx);
            }
        }

        if was_present {
            self.dispatch_connection_change(conn, ConnectionChange::Removed);
        }
    }

    /// Snapshot of the active connections.
    pub fn connections(&self) -> Vec<BusConnection> {
        lock(&self.inner.connections).clone()
    }

    // ========================================================================
    // Change listeners
    // ========================================================================

    /// Add a connection change listener. Adding the same listener twice is a
    /// no-op.
    pub fn add_connection_change_listener(&self, listener: Arc<dyn ConnectionChangeListener>) {
        let mut listeners = lock(&self.inner.change_listeners);
        if !listeners.iter().any(|l| same_change_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a connection change listener; a no-op if it was never added.
    pub fn remove_connection_change_listener(&self, listener: &Arc<dyn ConnectionChangeListener>) {
        lock(&self.inner.change_listeners).retain(|l| !same_change_listener(l, listener));
    }

    fn dispatch_connection_change(&self, conn: &BusConnection, change: ConnectionChange) {
        // Snapshot under the lock, notify outside it: listeners may re-enter
        // the bus (e.g. to enumerate connections).
        let snapshot: Vec<_> = lock(&self.inner.change_listeners).clone();
        for listener in snapshot {
            listener.connection_changed(conn, change);
        }
    }

    // ========================================================================
    // Main address
    // ========================================================================

    /// The address other daemons use as this node's identity.
    ///
    /// If no address was set explicitly, the local address of the first
    /// active connection is adopted and cached. Returns `None` while neither
    /// is available.
    pub fn main_address(&self) -> Option<InterfaceAddress> {
        let mut main = lock(&self.inner.main_address);
        if main.is_none() {
            *main = lock(&self.inner.connections)
                .first()
                .and_then(|c| c.local_address());
        }
        *main
    }

    /// Set the node's main address. It must be unique across the mesh.
    pub fn set_main_address(&self, addr: InterfaceAddress) {
        *lock(&self.inner.main_address) = Some(addr);
    }
}

/// Per-connection receive worker.
///
/// Reads frames until the stream fails or the monitor is stopped. Malformed
/// frames that left the stream aligned (a port-0 frame) are dropped and the
/// loop keeps going; anything else tears the connection down.
fn receive_worker(bus: Weak<BusInner>, conn: BusConnection, stop: Arc<AtomicBool>) {
    loop {
        match conn.read_datagram() {
            Ok(datagram) => {
                let Some(inner) = bus.upgrade() else { return };
                BusContext { inner }.receive(Some(&conn), &datagram);
            }
            Err(Error::InvalidPort(_)) => {
                log::debug!("[bus] dropping port-0 frame on connection {}", conn.id());
            }
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    log::debug!("[bus] connection {} read failed: {}", conn.id(), e);
                }
                conn.disconnect();
                if let Some(inner) = bus.upgrade() {
                    BusContext { inner }.remove_connection(&conn);
                }
                return;
            }
        }
        if stop.load(Ordering::Acquire) {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn same_listener(a: &Arc<dyn DatagramListener>, b: &Arc<dyn DatagramListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn same_change_listener(
    a: &Arc<dyn ConnectionChangeListener>,
    b: &Arc<dyn ConnectionChangeListener>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// Tests
// ============================================================================
