//! Property-based tests for message signing and verification
//!
//! Uses proptest to check that every message a feed signs verifies back to
//! the same id and content, and that changed bytes never verify.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use scuttlenode_core::feed::{ClassicFormat, Feed, Formats};
use scuttlenode_core::Identity;

// ============================================================================
// Strategy Generators
// ============================================================================

fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,!?]{0,200}").expect("valid regex")
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_signed_messages_verify(
        seed in seed_strategy(),
        texts in prop::collection::vec(text_strategy(), 1..5),
        millis in 0i64..4_000_000_000_000,
    ) {
        let identity = Identity::from_seed(&seed);
        let now = Utc.timestamp_millis_opt(millis).single().expect("valid timestamp");
        let mut feed = Feed::new(identity.public().main_feed());
        for text in &texts {
            feed.create_message(json!({"type": "post", "text": text}), now, &identity, &ClassicFormat).unwrap();
        }

        let formats = Formats::default();
        let mut verified_feed = Feed::new(identity.public().main_feed());
        for (signed, text) in feed.pop_appended().into_iter().zip(&texts) {
            let verified = formats.verify(&signed.raw).unwrap();
            prop_assert_eq!(verified.id, signed.id);
            prop_assert_eq!(verified.author, identity.public());
            prop_assert_eq!(&verified.content_value().unwrap()["text"], &json!(text));
            verified_feed.append_verified(verified).unwrap();
        }
        prop_assert_eq!(verified_feed.sequence(), Some(texts.len() as u64));
    }

    #[test]
    fn prop_tampered_messages_fail(seed in seed_strategy(), text in text_strategy()) {
        let identity = Identity::from_seed(&seed);
        let mut feed = Feed::new(identity.public().main_feed());
        feed.create_message(json!({"type": "post", "text": text, "marker": "original"}), Utc::now(), &identity, &ClassicFormat).unwrap();
        let signed = feed.pop_appended().remove(0);

        let raw = String::from_utf8(signed.raw.clone()).unwrap();
        let tampered = raw.replace("\"original\"", "\"modified\"");
        prop_assert!(Formats::default().verify(tampered.as_bytes()).is_err());
    }

    #[test]
    fn prop_identity_seed_round_trip(seed in seed_strategy()) {
        let identity = Identity::from_seed(&seed);
        let restored = Identity::from_bytes(&identity.to_bytes()).unwrap();
        prop_assert_eq!(restored.public(), identity.public());

        let text = identity.public().to_string();
        prop_assert_eq!(text.parse::<scuttlenode_core::IdentityRef>().unwrap(), identity.public());
    }
}
