//! Fuzz target for broadcast code parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use lidarlink_core::{BROADCAST_CODE_SIZE, BroadcastCode};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(code) = BroadcastCode::parse(text) {
            assert_eq!(code.as_str(), text);
        }
    }

    if data.len() >= BROADCAST_CODE_SIZE {
        let mut field = [0u8; BROADCAST_CODE_SIZE];
        field.copy_from_slice(&data[..BROADCAST_CODE_SIZE]);
        if let Ok(code) = BroadcastCode::from_wire(&field) {
            assert!(code.as_str().len() <= BroadcastCode::MAX_LEN);
        }
    }
});
