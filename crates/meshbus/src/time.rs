// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable clock sources.
//!
//! The core never reads the OS clock directly: every subsystem that needs
//! time takes a [`TimeProvider`]. This keeps the clock-sync and bundle-agent
//! logic testable with simulated clocks, and lets the clock-sync service
//! itself act as the network-time provider for the bundle agent.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of the current time in milliseconds.
///
/// What the milliseconds are relative to depends on the implementation:
/// [`SystemTimeProvider`] counts from the Unix epoch, while
/// [`MonotonicTimeProvider`] counts from its own construction. Consumers must
/// only ever compare timestamps from the same provider.
pub trait TimeProvider: Send + Sync {
    /// Current time in milliseconds.
    fn current_time_millis(&self) -> i64;
}

/// Wall-clock provider backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl SystemTimeProvider {
    /// Shared handle to a system time provider.
    pub fn shared() -> Arc<dyn TimeProvider> {
        Arc::new(SystemTimeProvider)
    }
}

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            // Clock before 1970: report negative millis rather than panic.
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }
}

/// Monotonic provider backed by [`Instant`].
///
/// Milliseconds since the provider was created. Never goes backwards, which
/// is what local timers (route expiry, bundle deferral) want.
#[derive(Debug, Clone)]
pub struct MonotonicTimeProvider {
    origin: Instant,
}

impl MonotonicTimeProvider {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Shared handle to a fresh monotonic provider.
    pub fn shared() -> Arc<dyn TimeProvider> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for MonotonicTimeProvider {
    fn current_time_millis(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}
