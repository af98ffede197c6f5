//! Fuzz target for command body decoders

#![no_main]

use libfuzzer_sys::fuzz_target;
use lidarlink_core::{
    BroadcastBody, ConnectedLidarInfo, HandshakeAck, HandshakeRequest, HeartbeatResponse,
    HubQueryLidarInformationResponse,
};

fuzz_target!(|data: &[u8]| {
    let _ = BroadcastBody::decode(data);
    let _ = BroadcastBody::decode_lossy(data);
    let _ = HandshakeRequest::decode(data);
    let _ = HandshakeAck::decode(data);
    let _ = HeartbeatResponse::decode(data);

    if let Ok(info) = ConnectedLidarInfo::decode(data) {
        let _ = info.handle();
    }

    if let Ok(response) = HubQueryLidarInformationResponse::decode(data) {
        // Re-encoding a decoded response reproduces its entries
        let encoded = response.encode();
        let again = HubQueryLidarInformationResponse::decode(&encoded).unwrap();
        assert_eq!(again.lidars.len(), response.lidars.len());
    }
});
