// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Golden wire vectors, asserted byte for byte.

mod common;

use std::io::Cursor;

use meshbus::bundle::Bundle;
use meshbus::protocol::sdnv;
use meshbus::{Datagram, InterfaceAddress};

#[test]
fn test_dmp_frame_golden() {
    let dgram = Datagram::new(50054, vec![0x01, 0x02, 0x03]).unwrap();
    let mut wire = Vec::new();
    dgram.write_to(&mut wire).unwrap();
    assert_eq!(
        wire,
        [0xc3, 0x66, 0x00, 0x03, 0x00, 0x00, 0x01, 0x02, 0x03]
    );

    let decoded = Datagram::read_from(&mut Cursor::new(wire)).unwrap();
    assert_eq!(decoded.port(), 50054);
    assert_eq!(decoded.payload(), [0x01, 0x02, 0x03]);
}

#[test]
fn test_address_golden() {
    let octets = [
        0xfd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01,
    ];
    let addr = InterfaceAddress::new(octets);
    assert_eq!(addr.to_string(), "fd00:0:0:0:0:0:0:1");

    let parsed: InterfaceAddress = "fd00:0:0:0:0:0:0:1".parse().unwrap();
    assert_eq!(parsed.octets(), &octets);
}

#[test]
fn test_sdnv_golden() {
    let cases: [(i64, &[u8]); 4] = [
        (0, &[0x00]),
        (127, &[0x7f]),
        (128, &[0x81, 0x00]),
        (16384, &[0x81, 0x80, 0x00]),
    ];
    for (value, wire) in cases {
        let mut buf = Vec::new();
        sdnv::encode_into(value, &mut buf).unwrap();
        assert_eq!(buf, wire, "encoding of {value}");
        let (decoded, used) = sdnv::decode(wire).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, wire.len());
    }
}

#[test]
fn test_bundle_round_trip_across_nodes() {
    // A bundle serialized on one node must parse identically on another,
    // including dictionary reconstruction of all four endpoints.
    let mut bundle = Bundle::new();
    bundle.flags = meshbus::bundle::FLAG_CUSTODY;
    bundle.timestamp = 500_000_000;
    bundle.sequence = 17;
    bundle.lifetime = 86_400;
    bundle.source = format!("dtn://[{}]/sensor/imu", common::node_addr(1));
    bundle.destination = format!("dtn://[{}]/sink", common::node_addr(2));
    bundle.report_to = format!("dtn://[{}]/reports", common::node_addr(1));
    bundle.payload = (0u16..600).map(|i| (i % 251) as u8).collect();

    let wire = bundle.to_bytes().unwrap();
    assert_eq!(wire[0], 0x06);
    let parsed = Bundle::from_bytes(&wire).unwrap();
    assert_eq!(parsed, bundle);
    assert!(parsed.id_eq(&bundle));
}
