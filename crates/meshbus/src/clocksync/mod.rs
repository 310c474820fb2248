// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-to-peer clock synchronization.
//!
//! Each node keeps an offset between its internal clock and the "network
//! clock", the approximate mean of all participating internal clocks. Peers
//! periodically exchange their current network-time estimate; the reply
//! carries how long the peer sat on our last message, which lets us estimate
//! the round trip and thus the one-way latency.
//!
//! Payload (24 octets, big-endian two's complement):
//!
//! ```text
//! +----------+----------------------+----------------+----------------+
//! | seq (4B) | network time ms (8B) | reply seq (4B) | hold ms (8B)   |
//! +----------+----------------------+----------------+----------------+
//! ```
//!
//! `reply seq` is the sequence number of the last message received from the
//! destination peer (0 = nothing to reply to), and `hold ms` the time between
//! receiving that message and sending this one. Sequence 0 is never emitted.
//!
//! The service only claims convergence toward the mean; it does not guarantee
//! that successive [`ClockSync::current_time_millis`] reads are monotonic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::{BusConnection, BusContext, DatagramListener};
use crate::protocol::Datagram;
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::Result;

/// Reserved DMP port for clock-sync traffic.
pub const CLOCKSYNC_PORT: u16 = 50123;

/// Base update period in milliseconds. Each cycle sleeps
/// `UPDATE_PERIOD_MS * (1 + U[0, 0.5])`; the jitter keeps neighboring nodes
/// from phase-locking their exchange loops.
pub const UPDATE_PERIOD_MS: u64 = 1000;

const PAYLOAD_LEN: usize = 24;

/// Entries kept in the ring of recently sent messages.
const SENT_RING_SIZE: u32 = 10;

/// One decoded sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncMessage {
    seq: u32,
    remote_time: i64,
    reply_seq: u32,
    hold_ms: i64,
}

impl SyncMessage {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..12].copy_from_slice(&self.remote_time.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply_seq.to_be_bytes());
        buf[16..24].copy_from_slice(&self.hold_ms.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            seq: u32::from_be_bytes(buf[0..4].try_into().ok()?),
            remote_time: i64::from_be_bytes(buf[4..12].try_into().ok()?),
            reply_seq: u32::from_be_bytes(buf[12..16].try_into().ok()?),
            hold_ms: i64::from_be_bytes(buf[16..24].try_into().ok()?),
        })
    }
}

/// Last inbound message from one peer, keyed by connection id.
#[derive(Debug, Clone, Copy)]
struct RecvRecord {
    seq: u32,
    remote_time: i64,
    local_time: i64,
    round_trip: i64,
    round_trip_valid: bool,
    used_for_update: bool,
}

/// Ring of (seq -> local send time) for round-trip estimation.
struct SentStore {
    times: [i64; SENT_RING_SIZE as usize],
    // Previous sequence number handed out; the next send uses seq + 1.
    seq: u32,
}

impl SentStore {
    /// Local send time for `reply_seq`, if the ring still holds it.
    ///
    /// Sequence 0 means "nothing to reply to", and anything older than the
    /// ring can hold has been overwritten.
    fn send_time(&self, reply_seq: u32) -> Option<i64> {
        if reply_seq == 0 || i64::from(reply_seq) <= i64::from(self.seq) - i64::from(SENT_RING_SIZE)
        {
            return None;
        }
        Some(self.times[(reply_seq % SENT_RING_SIZE) as usize])
    }
}

struct ClockSyncState {
    bus: BusContext,
    internal: Arc<dyn TimeProvider>,
    recv_store: Mutex<HashMap<u64, RecvRecord>>,
    sent_store: Mutex<SentStore>,
    offset: Mutex<i64>,
    /// Update gain. Multiplied as an integer before the division, so 1.0
    /// contributes exactly 1 and the effective update is `e / (N + 1)`.
    gain: f64,
}

impl ClockSyncState {
    fn current_time_millis(&self) -> i64 {
        self.internal.current_time_millis() + *lock(&self.offset)
    }

    /// Compose and send one sync message to `conn`, recording the send time.
    fn send_message(&self, conn: &BusConnection) -> Result<()> {
        let rec = lock(&self.recv_store).get(&conn.id()).copied();
        let now = self.internal.current_time_millis();

        // Never send seq 0, even across wrap.
        let seq = {
            let mut sent = lock(&self.sent_store);
            sent.seq = sent.seq.wrapping_add(1);
            if sent.seq == 0 {
                sent.seq = 1;
            }
            let seq = sent.seq;
            sent.times[(seq % SENT_RING_SIZE) as usize] = now;
            seq
        };

        let (reply_seq, hold_ms) = match rec {
            Some(rec) => (rec.seq, now - rec.local_time),
            None => (0, 0),
        };
        let msg = SyncMessage {
            seq,
            remote_time: now + *lock(&self.offset),
            reply_seq,
            hold_ms,
        };
        let datagram = Datagram::new(CLOCKSYNC_PORT, msg.encode().to_vec())?;
        self.bus.send(Some(conn), &datagram)
    }

    fn handle_message(&self, conn: &BusConnection, msg: SyncMessage) {
        let local_time = self.internal.current_time_millis();

        // Estimate the round trip if our original send is still in the ring.
        let send_time = lock(&self.sent_store).send_time(msg.reply_seq);
        let (round_trip, round_trip_valid) = match send_time {
            Some(sent) => (local_time - sent - msg.hold_ms, true),
            None => (0, false),
        };

        let rec = RecvRecord {
            seq: msg.seq,
            remote_time: msg.remote_time,
            local_time,
            round_trip,
            round_trip_valid,
            used_for_update: false,
        };
        lock(&self.recv_store).insert(conn.id(), rec);
    }

    /// Fold every unused round-trip-valid receive record into the offset.
    fn update_offset(&self) {
        let n = self.bus.connections().len();
        let mut recv = lock(&self.recv_store);
        let mut offset = lock(&self.offset);

        let mut e = 0.0f64;
        for rec in recv.values_mut() {
            if rec.round_trip_valid && !rec.used_for_update {
                e += (rec.remote_time + rec.round_trip / 2 - rec.local_time - *offset) as f64;
                rec.used_for_update = true;
            }
        }
        // The gain multiplies as an integer, so 1.0 contributes exactly 1 and
        // fractional gains would floor; the division result is truncated into
        // the millisecond offset.
        *offset += ((self.gain as i64) as f64 * e / (n as f64 + 1.0)) as i64;
    }
}

impl DatagramListener for ClockSyncState {
    fn receive_datagram(&self, conn: Option<&BusConnection>, datagram: &Datagram) {
        let Some(conn) = conn else { return };
        match SyncMessage::decode(datagram.payload()) {
            Some(msg) => self.handle_message(conn, msg),
            None => log::debug!(
                "[clocksync] malformed payload ({} octets) on connection {}",
                datagram.payload().len(),
                conn.id()
            ),
        }
    }
}

/// Handle to a running clock synchronization service.
///
/// The service estimates network time as `internal clock + offset` and keeps
/// nudging the offset toward the network mean. It is itself a
/// [`TimeProvider`], which is how the bundle agent consumes it.
///
/// # Examples
/// ```no_run
/// use meshbus::{BusContext, ClockSync};
///
/// let bus = BusContext::new();
/// let sync = ClockSync::spawn(bus).unwrap();
/// let network_now = sync.current_time_millis();
/// # let _ = network_now;
/// sync.shutdown();
/// ```
pub struct ClockSync {
    state: Arc<ClockSyncState>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ClockSync {
    /// Bind the clock-sync port on `bus` and start the exchange loop against
    /// the system clock.
    pub fn spawn(bus: BusContext) -> Result<Self> {
        Self::spawn_with_clock(bus, Arc::new(SystemTimeProvider))
    }

    /// As [`ClockSync::spawn`], but synchronizing a caller-supplied internal
    /// clock. Intended for tests with simulated clocks.
    pub fn spawn_with_clock(bus: BusContext, internal: Arc<dyn TimeProvider>) -> Result<Self> {
        let state = Arc::new(ClockSyncState {
            bus: bus.clone(),
            internal,
            recv_store: Mutex::new(HashMap::new()),
            sent_store: Mutex::new(SentStore {
                times: [0; SENT_RING_SIZE as usize],
                seq: 0,
            }),
            offset: Mutex::new(0),
            gain: 1.0,
        });
        bus.bind(
            Arc::clone(&state) as Arc<dyn DatagramListener>,
            CLOCKSYNC_PORT,
        )?;

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

    /// Current estimated difference between the internal clock and the
    /// network clock, in milliseconds.
    pub fn offset_millis(&self) -> i64 {
        *lock(&self.state.offset)
    }

    /// Stop the exchange loop and release the clock-sync port.
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
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TimeProvider for ClockSync {
    /// Current network time estimate: internal clock plus offset.
    fn current_time_millis(&self) -> i64 {
        self.state.current_time_millis()
    }
}

fn daemon_loop(state: Arc<ClockSyncState>, shutdown: Arc<AtomicBool>) {
    log::info!("[clocksync] service started");
    while !shutdown.load(Ordering::Acquire) {
        for conn in state.bus.connections() {
            if let Err(e) = state.send_message(&conn) {
                log::warn!(
                    "[clocksync] send on connection {} failed: {}",
                    conn.id(),
                    e
                );
            }
        }

        // Jittered, chunked sleep; the jitter keeps peers from phase-locking.
        let sleep_ms = (UPDATE_PERIOD_MS as f64 * (1.0 + fastrand::f64() / 2.0)) as u64;
        let deadline = std::time::Instant::now() + Duration::from_millis(sleep_ms);
        while std::time::Instant::now() < deadline {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        state.update_offset();
    }
    log::info!("[clocksync] service stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
