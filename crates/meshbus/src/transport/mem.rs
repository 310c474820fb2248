// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory pipe transport.
//!
//! A [`pipe`] is a bounded-waiting, unbounded-buffer unidirectional byte
//! channel with blocking reads; [`link_pair`] crosses two pipes into a pair
//! of connected [`BusConnection`]s, one per "node". Disconnecting either
//! handle closes both directions, so a receive worker blocked on the peer's
//! reader wakes up and tears down cleanly.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::addr::InterfaceAddress;
use crate::bus::connection::BusConnection;

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl PipeShared {
    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        self.readable.notify_all();
    }
}

/// Write half of an in-memory pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

/// Read half of an in-memory pipe. Reads block until data or close.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

/// Create a unidirectional in-memory pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared::default());
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(data);
        self.shared.readable.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap_or_default();
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0); // EOF
            }
            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Build a connected pair of [`BusConnection`]s with the given addresses.
///
/// No handshake is performed; the addresses are installed directly, the way
/// an adapter that knows both endpoints out of band would do it.
/// Disconnecting either connection closes both underlying pipes.
pub fn link_pair(addr_a: InterfaceAddress, addr_b: InterfaceAddress) -> (BusConnection, BusConnection) {
    let (a_writer, b_reader) = pipe();
    let (b_writer, a_reader) = pipe();

    let a_to_b = Arc::clone(&a_writer.shared);
    let b_to_a = Arc::clone(&b_writer.shared);

    let close_a = {
        let (fwd, bwd) = (Arc::clone(&a_to_b), Arc::clone(&b_to_a));
        move || {
            fwd.close();
            bwd.close();
        }
    };
    let close_b = move || {
        a_to_b.close();
        b_to_a.close();
    };

    let conn_a = BusConnection::from_parts(
        Box::new(a_reader),
        Box::new(a_writer),
        Some(addr_a),
        Some(addr_b),
        Some(Box::new(close_a)),
    );
    let conn_b = BusConnection::from_parts(
        Box::new(b_reader),
        Box::new(b_writer),
        Some(addr_b),
        Some(addr_a),
        Some(Box::new(close_b)),
    );
    (conn_a, conn_b)
}

// ============================================================================
// Tests
// ============================================================================
