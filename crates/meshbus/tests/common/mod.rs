// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use meshbus::InterfaceAddress;

/// `fd00::n`-style test address.
pub fn node_addr(n: u8) -> InterfaceAddress {
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    octets[15] = n;
    InterfaceAddress::new(octets)
}

/// Poll `cond` every 20 ms until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
