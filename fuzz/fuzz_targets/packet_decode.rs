//! Fuzz target for packet decoding
//!
//! Tests that the packet decoder and datagram iterator handle arbitrary
//! input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lidarlink_core::{Packet, PacketIter};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        // A decoded view never reaches past its input
        assert!(packet.len() <= data.len());
        assert_eq!(packet.as_bytes().len(), packet.len());
        let _ = packet.payload();
    }

    // The iterator stops at the first error
    let mut errors = 0;
    for packet in PacketIter::new(data) {
        if packet.is_err() {
            errors += 1;
        }
    }
    assert!(errors <= 1);
});
