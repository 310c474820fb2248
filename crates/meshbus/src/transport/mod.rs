// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport support.
//!
//! Concrete network adapters (TCP, Bluetooth RFCOMM) live outside the core;
//! their whole obligation is to produce the stream pairs that
//! [`BusConnection`](crate::BusConnection) wraps. The [`mem`] module provides
//! the one adapter the core ships: an in-process pipe transport used to wire
//! nodes together inside a single process, primarily for tests and demos.

pub mod mem;
