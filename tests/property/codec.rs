//! Property tests for the payload codec.
//!
//! 1. Any valid payload survives encode → decode.
//! 2. Arbitrary bytes never cause a panic in `decode`.

use proptest::prelude::*;
use termsync_proto::codec;
use termsync_proto::message::{MessageKind, Payload};

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::PublicGroupText),
        Just(MessageKind::PrivateText),
    ]
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    (
        arb_kind(),
        "[^\x00]{1,512}",
        "[a-z0-9]{1,64}",
        any::<i64>(),
        any::<i64>(),
    )
        .prop_map(|(kind, text, chat_id, clock, timestamp)| {
            Payload::text(kind, chat_id, text, clock, timestamp)
        })
}

proptest! {
    #[test]
    fn payload_round_trip(payload in arb_payload()) {
        let bytes = codec::encode(&payload).unwrap();
        prop_assert_eq!(codec::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(&bytes);
    }
}
