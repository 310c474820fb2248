// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handles over transport stream pairs.
//!
//! A transport adapter (TCP, RFCOMM, in-memory pipe, ...) hands the bus a
//! reader, a writer, the local interface address, and a close hook; the bus
//! wraps them in a [`BusConnection`]. The handle is cheap to clone and
//! compares by identity, so subsystems can stash it in routing tables and
//! later recognize the same link.
//!
//! Writes are serialized by a per-connection writer lock. Reads are only ever
//! performed by the connection's single receive worker, which owns the reader
//! lock for the duration of each frame.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::InterfaceAddress;
use crate::protocol::Datagram;
use crate::{Error, Result};

/// Boxed transport reader half.
pub type ConnReader = Box<dyn Read + Send>;
/// Boxed transport writer half.
pub type ConnWriter = Box<dyn Write + Send>;
/// Hook run once when the connection is disconnected. Expected to close the
/// underlying streams so any blocked read unblocks.
pub type CloseHook = Box<dyn FnOnce() + Send>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

struct ConnectionInner {
    id: u64,
    local_addr: Option<InterfaceAddress>,
    remote_addr: Option<InterfaceAddress>,
    reader: Mutex<ConnReader>,
    writer: Mutex<ConnWriter>,
    connected: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

/// A full-duplex link to another bus node.
///
/// Cloning yields another handle to the same connection; equality and hashing
/// are by connection identity, not by address.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<ConnectionInner>,
}

impl BusConnection {
    /// Wrap a stream pair without performing the address handshake.
    ///
    /// For adapters that agree on addressing out of band (e.g. tunnel links
    /// that cannot supply a local address), `local` and `remote` may be
    /// `None`.
    pub fn from_parts(
        reader: ConnReader,
        writer: ConnWriter,
        local: Option<InterfaceAddress>,
        remote: Option<InterfaceAddress>,
        on_close: Option<CloseHook>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                local_addr: local,
                remote_addr: remote,
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                connected: AtomicBool::new(true),
                on_close: Mutex::new(on_close),
            }),
        }
    }

    /// Wrap a stream pair, exchanging 16-octet interface addresses first.
    ///
    /// Each peer writes its own address and then reads the peer's; the
    /// exchange happens before any DMP frame. Both sides write before they
    /// read, so two handshaking peers never deadlock.
    pub fn handshake(
        mut reader: ConnReader,
        mut writer: ConnWriter,
        local: InterfaceAddress,
        on_close: Option<CloseHook>,
    ) -> Result<Self> {
        writer.write_all(local.octets())?;
        writer.flush()?;

        let mut peer = [0u8; 16];
        reader.read_exact(&mut peer)?;
        let remote = InterfaceAddress::new(peer);

        Ok(Self::from_parts(
            reader,
            writer,
            Some(local),
            Some(remote),
            on_close,
        ))
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Local interface address, if the adapter supplied one.
    pub fn local_address(&self) -> Option<InterfaceAddress> {
        self.inner.local_addr
    }

    /// Peer interface address learned from the handshake, if any.
    pub fn remote_address(&self) -> Option<InterfaceAddress> {
        self.inner.remote_addr
    }

    /// Whether the connection has not been disconnected yet.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Tear the connection down.
    ///
    /// Idempotent: the close hook runs at most once, and later calls are
    /// no-ops. Does not touch the bus context: the receive worker notices
    /// the closed stream and performs the bus-side removal.
    pub fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            let hook = self
                .inner
                .on_close
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Write one DMP frame, holding the writer lock for the duration.
    pub(crate) fn write_datagram(&self, datagram: &Datagram) -> Result<()> {
        let mut writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        datagram.write_to(&mut *writer).map_err(Error::Io)
    }

    /// Block until one DMP frame has been read.
    ///
    /// Only the connection's receive worker calls this.
    pub(crate) fn read_datagram(&self) -> Result<Datagram> {
        let mut reader = self.inner.reader.lock().unwrap_or_else(|e| e.into_inner());
        Datagram::read_from(&mut *reader)
    }
}

impl PartialEq for BusConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for BusConnection {}

impl std::hash::Hash for BusConnection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local_addr)
            .field("remote", &self.inner.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
