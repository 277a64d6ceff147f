//! Property-based tests for the shared wire formats.
//!
//! Uses proptest to verify:
//! 1. Any byte payload survives `seal` -> `open`, including the empty one.
//! 2. Any payload up to a few KiB survives `write_frame` -> `read_frame`.
//! 3. Arbitrary text never panics the command or peer-frame parsers.
//! 4. File offers with arbitrary names and sizes parse back unchanged.

use std::io::Cursor;

use peerchat_proto::codec;
use peerchat_proto::command::Command;
use peerchat_proto::crypto::{AesGcmCipher, Cipher};
use peerchat_proto::peer::{FileOffer, PeerFrame};
use proptest::prelude::*;

/// Strategy for usernames: no colons or whitespace, never empty.
fn arb_username() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,16}"
}

/// Strategy for file names that may include colons and spaces.
fn arb_filename() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_. :-]{1,32}"
}

proptest! {
    #[test]
    fn cipher_round_trip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let cipher = AesGcmCipher::with_default_key();
        let envelope = cipher.seal(&payload).unwrap();
        prop_assert!(cipher.is_envelope(envelope.as_bytes()));
        prop_assert_eq!(cipher.open(&envelope).unwrap(), payload);
    }

    #[test]
    fn frame_round_trip(payload in prop::collection::vec(any::<u8>(), 0..8192)) {
        let mut wire = Vec::new();
        codec::write_frame(&mut wire, &payload).unwrap();
        prop_assert_eq!(wire.len(), payload.len() + 4);
        let decoded = codec::read_frame(&mut Cursor::new(wire)).unwrap();
        prop_assert_eq!(decoded, payload);
    }

    #[test]
    fn legacy_reader_accepts_framed_payloads(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut wire = Vec::new();
        codec::write_frame(&mut wire, &payload).unwrap();
        let decoded = codec::read_frame_or_legacy(&mut Cursor::new(wire)).unwrap();
        prop_assert_eq!(decoded, payload);
    }

    #[test]
    fn command_parse_never_panics(line in "\\PC{0,128}") {
        let _ = Command::parse(&line);
    }

    #[test]
    fn peer_frame_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = PeerFrame::parse(&bytes);
    }

    #[test]
    fn file_offer_round_trip(
        sender in arb_username(),
        filename in arb_filename(),
        size in any::<u64>(),
        encrypted in any::<bool>(),
    ) {
        let frame = PeerFrame::FileOffer(FileOffer { sender, filename, size, encrypted });
        prop_assert_eq!(PeerFrame::parse(&frame.encode()), Some(frame));
    }

    #[test]
    fn peer_message_round_trip(from in arb_username(), text in "[^\\x00]{0,256}") {
        let frame = PeerFrame::Message { from, payload: text };
        prop_assert_eq!(PeerFrame::parse(&frame.encode()), Some(frame));
    }
}
