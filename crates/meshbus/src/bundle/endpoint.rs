// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint string handling.
//!
//! Endpoints have the shape `scheme:ssp`; the standard form for this system
//! is `dtn://<host part>/<service part>`, where the host part is either an
//! RFC 1035 hostname or a literal interface address in brackets:
//! `dtn://[fd00:0:0:0:0:0:0:1]/echo`.

use crate::addr::InterfaceAddress;
use crate::{Error, Result};

/// Split an endpoint into scheme and scheme-specific part at the first `:`.
pub fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    endpoint
        .split_once(':')
        .ok_or_else(|| Error::MalformedEndpoint(endpoint.to_string()))
}

/// The host part of a `dtn://` endpoint, or `None` for any other shape.
pub fn host_part(endpoint: &str) -> Option<&str> {
    let rest = endpoint.strip_prefix("dtn://")?;
    match rest.find('/') {
        Some(end) if end > 0 => Some(&rest[..end]),
        Some(_) => None,
        None if rest.is_empty() => None,
        None => Some(rest),
    }
}

/// Resolve the host part of `endpoint` to an interface address.
///
/// Only literal addresses (`[` ... `]`) resolve; a hostname fails with
/// [`Error::ResolutionFailed`]. The core ships no name resolution, that is a
/// [`NamingProvider`](crate::routing::NamingProvider) concern.
pub fn host_address(endpoint: &str) -> Result<InterfaceAddress> {
    let failed = || Error::ResolutionFailed(endpoint.to_string());

    let host = host_part(endpoint).ok_or_else(failed)?;
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .ok_or_else(failed)?;
    literal.parse().map_err(|_| failed())
}

// ============================================================================
// Tests
// ============================================================================
