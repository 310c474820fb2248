// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bundle protocol data units (RFC 5050 subset, version 6).
//!
//! A bundle is a self-contained store-and-forward unit: processing flags, a
//! creation timestamp (seconds since 2000-01-01T00:00:00Z), a per-timestamp
//! sequence number, a lifetime, four named endpoints and an opaque payload.
//!
//! On the wire a bundle is a primary block followed by exactly one payload
//! block:
//!
//! ```text
//! version (1 octet = 0x06)
//! primary flags    : SDNV
//! primary length   : SDNV      -- remainder of the primary block
//! scheme/ssp offs  : 8 x SDNV  -- dictionary offsets, endpoint order
//! creation ts      : SDNV
//! creation seq     : SDNV
//! lifetime         : SDNV
//! dict length      : SDNV
//! dictionary       : NUL-separated 7-bit ASCII words
//! payload type     : 1 octet = 0x01
//! payload flags    : SDNV = 0x08 ("last block")
//! payload length   : SDNV
//! payload          : octets
//! ```
//!
//! The serializer emits all eight dictionary words in endpoint order without
//! deduplication; duplicates are legal and merely waste space. Characters
//! above 127 are replaced by `?` in both directions.

pub mod agent;
pub mod endpoint;

use crate::protocol::sdnv;
use crate::{Error, Result};

/// Supported bundle protocol version.
pub const VERSION: u8 = 0x06;

/// Bundle is an administrative record.
pub const FLAG_ADMIN: u32 = 1 << 1;
/// Custody transfer is requested (recognized, not acted on).
pub const FLAG_CUSTODY: u32 = 1 << 3;

/// The null endpoint. Cannot be registered with the bundle agent.
pub const NULL_ENDPOINT: &str = "dtn:none";

/// Only non-primary block type understood: the payload block.
const PAYLOAD_BLOCK_TYPE: u8 = 0x01;
/// Payload block flags: "last block" only.
const PAYLOAD_BLOCK_FLAGS: i64 = 1 << 3;

/// A bundling protocol data bundle.
///
/// Derived equality compares every field including the payload; see
/// [`Bundle::id_eq`] for the identity notion used in bundle bookkeeping.
///
/// # Examples
/// ```
/// use meshbus::bundle::Bundle;
///
/// let mut b = Bundle::new();
/// b.destination = "dtn://[fd00:0:0:0:0:0:0:1]/echo".into();
/// b.lifetime = 60;
/// b.payload = b"ping".to_vec();
/// let wire = b.to_bytes().unwrap();
/// assert_eq!(Bundle::from_bytes(&wire).unwrap(), b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Bundle processing control flags.
    pub flags: u32,
    /// Creation timestamp, seconds since 2000-01-01T00:00:00Z.
    pub timestamp: i64,
    /// Creation sequence number, monotonic within one timestamp.
    pub sequence: i64,
    /// Lifetime in seconds after creation.
    pub lifetime: i64,
    /// Source endpoint.
    pub source: String,
    /// Destination endpoint.
    pub destination: String,
    /// Report-to endpoint.
    pub report_to: String,
    /// Current custodian endpoint.
    pub custodian: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Bundle {
    /// A fresh bundle with all endpoints set to [`NULL_ENDPOINT`].
    pub fn new() -> Self {
        Self {
            flags: 0,
            timestamp: 0,
            sequence: 0,
            lifetime: 0,
            source: NULL_ENDPOINT.to_string(),
            destination: NULL_ENDPOINT.to_string(),
            report_to: NULL_ENDPOINT.to_string(),
            custodian: NULL_ENDPOINT.to_string(),
            payload: Vec::new(),
        }
    }

    /// Identity equality: same source, timestamp and sequence number.
    pub fn id_eq(&self, other: &Bundle) -> bool {
        self.source == other.source
            && self.timestamp == other.timestamp
            && self.sequence == other.sequence
    }

    fn endpoints(&self) -> [&str; 4] {
        [
            &self.source,
            &self.destination,
            &self.report_to,
            &self.custodian,
        ]
    }

    /// Serialize for transmission.
    ///
    /// Fails if an endpoint has no `scheme:ssp` shape or a numeric field is
    /// negative.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        // Assemble the dictionary: scheme and SSP of each endpoint in order,
        // each word NUL-terminated. No deduplication.
        let mut words = Vec::with_capacity(8);
        for ep in self.endpoints() {
            let (scheme, ssp) = endpoint::split_endpoint(ep)?;
            words.push(scheme);
            words.push(ssp);
        }
        let mut offsets = [0i64; 8];
        let mut dict = Vec::new();
        for (i, word) in words.iter().enumerate() {
            offsets[i] = dict.len() as i64;
            dict.extend(word.chars().map(ascii_byte));
            dict.push(0);
        }

        let flags = i64::from(self.flags);
        let payload_len = self.payload.len() as i64;

        // Primary block length covers everything after itself: the offsets,
        // timestamp, sequence, lifetime, dictionary length and dictionary.
        let mut primary_len = dict.len() as i64;
        for off in &offsets {
            primary_len += sdnv::encoded_len(*off)? as i64;
        }
        primary_len += sdnv::encoded_len(self.timestamp)? as i64;
        primary_len += sdnv::encoded_len(self.sequence)? as i64;
        primary_len += sdnv::encoded_len(self.lifetime)? as i64;
        primary_len += sdnv::encoded_len(dict.len() as i64)? as i64;

        let mut buf = Vec::new();
        buf.push(VERSION);
        sdnv::encode_into(flags, &mut buf)?;
        sdnv::encode_into(primary_len, &mut buf)?;
        for off in &offsets {
            sdnv::encode_into(*off, &mut buf)?;
        }
        sdnv::encode_into(self.timestamp, &mut buf)?;
        sdnv::encode_into(self.sequence, &mut buf)?;
        sdnv::encode_into(self.lifetime, &mut buf)?;
        sdnv::encode_into(dict.len() as i64, &mut buf)?;
        buf.extend_from_slice(&dict);

        buf.push(PAYLOAD_BLOCK_TYPE);
        sdnv::encode_into(PAYLOAD_BLOCK_FLAGS, &mut buf)?;
        sdnv::encode_into(payload_len, &mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a bundle from its wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { buf, pos: 0 };

        let version = cursor.take_byte()?;
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }

        let flags = cursor.take_sdnv()?;
        // Primary block length: present on the wire but not needed to walk
        // the block.
        let _primary_len = cursor.take_sdnv()?;

        let mut offsets = [0i64; 8];
        for off in offsets.iter_mut() {
            *off = cursor.take_sdnv()?;
        }
        let timestamp = cursor.take_sdnv()?;
        let sequence = cursor.take_sdnv()?;
        let lifetime = cursor.take_sdnv()?;

        let dict_len = cursor.take_sdnv()?;
        let dict = cursor.take_slice(dict_len)?;

        let block_type = cursor.take_byte()?;
        if block_type != PAYLOAD_BLOCK_TYPE {
            return Err(Error::BadBlockType(block_type));
        }
        let block_flags = cursor.take_sdnv()?;
        if block_flags != PAYLOAD_BLOCK_FLAGS {
            return Err(Error::BadBlockFlags(block_flags as u64));
        }
        let payload_len = cursor.take_sdnv()?;
        let payload = cursor.take_slice(payload_len)?.to_vec();

        let mut endpoints: [String; 4] = Default::default();
        for (i, ep) in endpoints.iter_mut().enumerate() {
            let scheme = terminated_word(dict, offsets[2 * i])?;
            let ssp = terminated_word(dict, offsets[2 * i + 1])?;
            *ep = format!("{}:{}", scheme, ssp);
        }
        let [source, destination, report_to, custodian] = endpoints;

        Ok(Self {
            flags: flags as u32,
            timestamp,
            sequence,
            lifetime,
            source,
            destination,
            report_to,
            custodian,
            payload,
        })
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

/// ASCII projection used for dictionary words: anything above 127 becomes `?`.
fn ascii_byte(c: char) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        b'?'
    }
}

/// Read the NUL-terminated word starting at `offset` in the dictionary.
///
/// A missing terminator ends the word at the dictionary boundary, and bytes
/// above 127 decode as `?`.
fn terminated_word(dict: &[u8], offset: i64) -> Result<String> {
    let start = usize::try_from(offset).map_err(|_| Error::Truncated)?;
    if start > dict.len() {
        return Err(Error::Truncated);
    }
    let word = dict[start..]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if b > 127 { '?' } else { b as char })
        .collect();
    Ok(word)
}

/// Bounds-checked reader over the wire buffer; running out is `Truncated`.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take_byte(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take_sdnv(&mut self) -> Result<i64> {
        let (value, used) = sdnv::decode(&self.buf[self.pos.min(self.buf.len())..])?;
        self.pos += used;
        Ok(value)
    }

    fn take_slice(&mut self, len: i64) -> Result<&'a [u8]> {
        let len = usize::try_from(len).map_err(|_| Error::Truncated)?;
        let end = self.pos.checked_add(len).ok_or(Error::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
}

// ============================================================================
// Tests
// ============================================================================
