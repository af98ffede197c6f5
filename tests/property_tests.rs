//! Property-based tests for LidarLink
//!
//! Uses proptest to verify codec invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// CRC Properties
// ============================================================================

mod crc_properties {
    use super::*;
    use lidarlink_core::{CRC16_PREAMBLE_SEED, CRC32_PACKET_SEED, crc16, crc32};

    proptest! {
        /// Appending the little-endian CRC-16 gives a zero residual
        #[test]
        fn crc16_residual_is_zero(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let mut buf = data.clone();
            buf.extend_from_slice(&crc16(CRC16_PREAMBLE_SEED, &data).to_le_bytes());
            prop_assert_eq!(crc16(CRC16_PREAMBLE_SEED, &buf), 0);
        }

        /// Any single-bit error changes the CRC-32
        #[test]
        fn crc32_detects_single_bit_errors(
            data in prop::collection::vec(any::<u8>(), 1..512),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut corrupted = data.clone();
            let i = index.index(corrupted.len());
            corrupted[i] ^= 1 << bit;
            prop_assert_ne!(
                crc32(CRC32_PACKET_SEED, &data),
                crc32(CRC32_PACKET_SEED, &corrupted)
            );
        }
    }
}

// ============================================================================
// Packet Codec Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use lidarlink_core::{
        CommandSet, FrameError, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PREAMBLE_SIZE, Packet,
        PacketBuilder, PacketIter, PacketType,
    };

    fn packet_type() -> impl Strategy<Value = PacketType> {
        prop_oneof![
            Just(PacketType::Cmd),
            Just(PacketType::Ack),
            Just(PacketType::Msg),
        ]
    }

    fn command_set() -> impl Strategy<Value = CommandSet> {
        prop_oneof![
            Just(CommandSet::General),
            Just(CommandSet::Lidar),
            Just(CommandSet::Hub),
        ]
    }

    fn build(
        packet_type: PacketType,
        sequence: u16,
        set: CommandSet,
        id: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        PacketBuilder::new()
            .packet_type(packet_type)
            .sequence(sequence)
            .command(set, id)
            .payload(payload)
            .build()
            .unwrap()
    }

    proptest! {
        /// Decoding a built packet yields the fields it was built from
        #[test]
        fn decode_recovers_fields(
            packet_type in packet_type(),
            sequence in any::<u16>(),
            set in command_set(),
            id in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let bytes = build(packet_type, sequence, set, id, &payload);
            prop_assert_eq!(bytes.len(), MIN_PACKET_SIZE + payload.len());

            let packet = Packet::decode(&bytes).unwrap();
            prop_assert_eq!(packet.packet_type(), packet_type);
            prop_assert_eq!(packet.sequence(), sequence);
            prop_assert_eq!(packet.command_set(), set);
            prop_assert_eq!(packet.command_id(), id);
            prop_assert_eq!(packet.payload(), &payload[..]);
        }

        /// A flipped bit is reported as the failure of the region it hit
        #[test]
        fn corruption_is_classified(
            payload in prop::collection::vec(any::<u8>(), 0..128),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut bytes = build(PacketType::Cmd, 7, CommandSet::General, 3, &payload);
            let i = index.index(bytes.len());
            bytes[i] ^= 1 << bit;

            let err = Packet::decode(&bytes).unwrap_err();
            if i == 0 {
                prop_assert!(matches!(err, FrameError::UnexpectedFrame(_)));
            } else if i < PREAMBLE_SIZE {
                prop_assert!(matches!(err, FrameError::MalformedPreamble(_)));
            } else {
                prop_assert!(matches!(err, FrameError::MalformedPacket { .. }), "{:?}", err);
            }
            prop_assert_eq!(err.is_crc_failure(), i != 0);
        }

        /// Truncated packets never decode
        #[test]
        fn truncation_is_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..128),
            cut in any::<prop::sample::Index>(),
        ) {
            let bytes = build(PacketType::Ack, 1, CommandSet::Hub, 0, &payload);
            let len = cut.index(bytes.len());
            prop_assert!(Packet::decode(&bytes[..len]).is_err());
        }

        /// Arbitrary input never panics and never decodes past its length
        #[test]
        fn decode_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            if let Ok(packet) = Packet::decode(&data) {
                prop_assert!(packet.len() <= data.len());
                prop_assert!(packet.len() <= MAX_PACKET_SIZE);
            }
        }

        /// Concatenated packets are walked in order
        #[test]
        fn iterator_walks_concatenation(
            sequences in prop::collection::vec(any::<u16>(), 1..8),
        ) {
            let mut datagram = Vec::new();
            for &seq in &sequences {
                datagram.extend(build(PacketType::Cmd, seq, CommandSet::General, 3, &[]));
            }

            let decoded: Vec<u16> = PacketIter::new(&datagram)
                .map(|packet| packet.unwrap().sequence())
                .collect();
            prop_assert_eq!(decoded, sequences);
        }
    }
}

// ============================================================================
// Body Decoder Properties
// ============================================================================

mod body_properties {
    use super::*;
    use lidarlink_core::{
        BroadcastBody, BroadcastCode, ConnectedLidarInfo, HandshakeAck, HandshakeRequest,
        HeartbeatResponse, HubQueryLidarInformationResponse,
    };

    proptest! {
        /// Body decoders reject or accept arbitrary input without panicking
        #[test]
        fn decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = BroadcastBody::decode(&data);
            let _ = BroadcastBody::decode_lossy(&data);
            let _ = HandshakeRequest::decode(&data);
            let _ = HandshakeAck::decode(&data);
            let _ = HeartbeatResponse::decode(&data);
            let _ = ConnectedLidarInfo::decode(&data);
            let _ = HubQueryLidarInformationResponse::decode(&data);
        }

        /// The hub response never reports more sensors than its count byte
        #[test]
        fn hub_response_respects_count(data in prop::collection::vec(any::<u8>(), 2..256)) {
            if let Ok(response) = HubQueryLidarInformationResponse::decode(&data) {
                prop_assert_eq!(response.lidars.len(), usize::from(data[1]));
            }
        }

        /// Valid codes survive parsing
        #[test]
        fn broadcast_code_parse(code in "[0-9A-Z]{1,15}") {
            let parsed = BroadcastCode::parse(&code).unwrap();
            prop_assert_eq!(parsed.as_str(), code.as_str());
            let wire = parsed.to_wire();
            prop_assert_eq!(BroadcastCode::from_wire(&wire).unwrap(), parsed);
        }

        /// Codes longer than the wire field are rejected
        #[test]
        fn broadcast_code_too_long(code in "[0-9A-Z]{16,32}") {
            prop_assert!(BroadcastCode::parse(&code).is_err());
        }
    }
}
