// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 128-bit interface addresses.
//!
//! Every bus node interface carries a 128-bit address. Addresses are notated
//! the same way as IPv6 addresses, but **they are not IPv6 addresses** and
//! are never handed to an IP stack. The textual form is eight colon-separated
//! lowercase hexadecimal words with no `::` zero-compression (`0:0:0:0:0:0:0:1`,
//! never `::1`).
//!
//! [`InterfaceAddress::from_hardware_address`] derives an address from a
//! 48- or 64-bit MAC following RFC 4193 (unique local unicast), which keeps
//! multiple nodes on the same host from colliding.

use std::fmt;
use std::str::FromStr;

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::{Error, Result};

/// 128-bit bus interface address.
///
/// Equality and hashing are byte-wise. The address is `Copy`; it is used as a
/// key in the SFRP device table and inside bundle endpoints.
///
/// # Examples
/// ```
/// use meshbus::InterfaceAddress;
///
/// let addr: InterfaceAddress = "fd00:0:0:0:0:0:0:1".parse().unwrap();
/// assert_eq!(addr.octets()[0], 0xfd);
/// assert_eq!(addr.to_string(), "fd00:0:0:0:0:0:0:1");
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    octets: [u8; 16],
}

impl InterfaceAddress {
    /// Create an address from exactly 16 octets.
    pub fn new(octets: [u8; 16]) -> Self {
        Self { octets }
    }

    /// Create an address from a byte slice, copying the input.
    ///
    /// Fails with [`Error::MalformedAddress`] unless the slice is exactly
    /// 16 octets long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let octets: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::MalformedAddress(format!("expected 16 octets, got {}", bytes.len())))?;
        Ok(Self { octets })
    }

    /// Derive an RFC 4193 unique-local address from a hardware address.
    ///
    /// `mac` must be a 48-bit or 64-bit hardware address. It is expanded to
    /// modified EUI-64 form (RFC 3513), then the address is assembled as:
    /// `fd` prefix, five octets of a SHA-1 over a random 64-bit seed and the
    /// EUI-64, two zero octets, and the EUI-64 itself.
    ///
    /// Because of the random seed, repeated calls with the same MAC yield
    /// distinct addresses.
    pub fn from_hardware_address(mac: &[u8]) -> Result<Self> {
        let mut eui64 = [0u8; 8];
        match mac.len() {
            6 => {
                eui64[..3].copy_from_slice(&mac[..3]);
                eui64[3] = 0xff;
                eui64[4] = 0xfe;
                eui64[5..].copy_from_slice(&mac[3..]);
            }
            8 => eui64.copy_from_slice(mac),
            n => {
                return Err(Error::MalformedAddress(format!(
                    "hardware address must be 6 or 8 octets, got {}",
                    n
                )))
            }
        }
        // Invert the universal/local bit (modified EUI-64).
        eui64[0] ^= 0x02;

        let mut seed = [0u8; 8];
        SystemRandom::new()
            .fill(&mut seed)
            .map_err(|_| Error::MalformedAddress("system random unavailable".into()))?;

        let mut hashed = Vec::with_capacity(16);
        hashed.extend_from_slice(&seed);
        hashed.extend_from_slice(&eui64);
        let sha = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &hashed);
        let sha = sha.as_ref();

        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        // Global ID: the last five octets of the digest.
        octets[1..6].copy_from_slice(&sha[sha.len() - 5..]);
        // octets[6..8] stay zero (subnet ID).
        octets[8..].copy_from_slice(&eui64);
        Ok(Self { octets })
    }

    /// Borrow the raw 16 octets.
    pub fn octets(&self) -> &[u8; 16] {
        &self.octets
    }

    /// 16-bit word at index `i` (0..8), big-endian.
    fn word(&self, i: usize) -> u16 {
        u16::from_be_bytes([self.octets[2 * i], self.octets[2 * i + 1]])
    }
}

impl FromStr for InterfaceAddress {
    type Err = Error;

    /// Parse the eight-word colon form. The abbreviated IPv6 form is not
    /// supported: `::1` is rejected, `0:0:0:0:0:0:0:1` is required.
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedAddress(s.to_string());

        let mut octets = [0u8; 16];
        let mut words = 0usize;
        for part in s.split(':') {
            if words >= 8 || part.is_empty() || part.len() > 4 {
                return Err(malformed());
            }
            if !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(malformed());
            }
            let word = u16::from_str_radix(part, 16).map_err(|_| malformed())?;
            octets[2 * words..2 * words + 2].copy_from_slice(&word.to_be_bytes());
            words += 1;
        }
        if words != 8 {
            return Err(malformed());
        }
        Ok(Self { octets })
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..8 {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", self.word(i))?;
        }
        Ok(())
    }
}

impl fmt::Debug for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterfaceAddress({})", self)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minimal_words() {
        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        octets[15] = 0x01;
        let addr = InterfaceAddress::new(octets);
        assert_eq!(addr.to_string(), "fd00:0:0:0:0:0:0:1");
    }

    #[test]
    fn test_parse_round_trip() {
        let addr: InterfaceAddress = "fd00:0:0:0:0:0:0:1".parse().unwrap();
        let mut expected = [0u8; 16];
        expected[0] = 0xfd;
        expected[15] = 0x01;
        assert_eq!(addr.octets(), &expected);
        assert_eq!(addr.to_string().parse::<InterfaceAddress>().unwrap(), addr);
    }

    #[test]
    fn test_parse_full_words() {
        let addr: InterfaceAddress = "fdab:cdef:123:45:6789:a:bc:d".parse().unwrap();
        assert_eq!(addr.to_string(), "fdab:cdef:123:45:6789:a:bc:d");
    }

    #[test]
    fn test_parse_rejects_compression() {
        assert!("::1".parse::<InterfaceAddress>().is_err());
        assert!("fd00::1".parse::<InterfaceAddress>().is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_word_count() {
        assert!("0:0:0:0:0:0:1".parse::<InterfaceAddress>().is_err());
        assert!("0:0:0:0:0:0:0:0:1".parse::<InterfaceAddress>().is_err());
        assert!("".parse::<InterfaceAddress>().is_err());
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        assert!("0:0:0:0:0:0:0:zz".parse::<InterfaceAddress>().is_err());
        assert!("0:0:0:0:0:0:0:12345".parse::<InterfaceAddress>().is_err());
    }

    #[test]
    fn test_from_bytes_length_check() {
        assert!(InterfaceAddress::from_bytes(&[0u8; 15]).is_err());
        assert!(InterfaceAddress::from_bytes(&[0u8; 17]).is_err());
        assert!(InterfaceAddress::from_bytes(&[0u8; 16]).is_ok());
    }

    #[test]
    fn test_byte_round_trip_arbitrary() {
        let octets: [u8; 16] = [
            0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03, 0x10, 0x20, 0x30, 0x40, 0xff, 0xfe,
            0xfd, 0xfc,
        ];
        let addr = InterfaceAddress::new(octets);
        let reparsed: InterfaceAddress = addr.to_string().parse().unwrap();
        assert_eq!(reparsed.octets(), &octets);
    }

    #[test]
    fn test_rfc4193_structure_48bit() {
        let mac = [0x00, 0x16, 0x53, 0x01, 0x02, 0x03];
        let addr = InterfaceAddress::from_hardware_address(&mac).unwrap();
        let octets = addr.octets();
        assert_eq!(octets[0], 0xfd);
        assert_eq!(&octets[6..8], &[0, 0]);
        // Modified EUI-64: first MAC octet with u/l bit flipped, ff:fe infix.
        assert_eq!(octets[8], 0x00 ^ 0x02);
        assert_eq!(octets[11], 0xff);
        assert_eq!(octets[12], 0xfe);
        assert_eq!(&octets[13..16], &mac[3..6]);
    }

    #[test]
    fn test_rfc4193_structure_64bit() {
        let mac = [0x02, 0x00, 0x00, 0xff, 0xfe, 0x00, 0x00, 0x01];
        let addr = InterfaceAddress::from_hardware_address(&mac).unwrap();
        let octets = addr.octets();
        assert_eq!(octets[0], 0xfd);
        assert_eq!(octets[8], 0x02 ^ 0x02);
        assert_eq!(&octets[9..16], &mac[1..8]);
    }

    #[test]
    fn test_rfc4193_rejects_bad_length() {
        assert!(InterfaceAddress::from_hardware_address(&[0u8; 5]).is_err());
        assert!(InterfaceAddress::from_hardware_address(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_rfc4193_unique_per_call() {
        let mac = [0x00, 0x16, 0x53, 0x01, 0x02, 0x03];
        let a = InterfaceAddress::from_hardware_address(&mac).unwrap();
        let b = InterfaceAddress::from_hardware_address(&mac).unwrap();
        // The random seed makes the global ID differ; EUI-64 tail matches.
        assert_eq!(a.octets()[8..], b.octets()[8..]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_map_key() {
        use std::collections::HashMap;
        let a: InterfaceAddress = "fd00:0:0:0:0:0:0:1".parse().unwrap();
        let b: InterfaceAddress = "fd00:0:0:0:0:0:0:2".parse().unwrap();
        let mut map = HashMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map[&a], 1);
        assert_eq!(map[&b], 2);
    }
}
