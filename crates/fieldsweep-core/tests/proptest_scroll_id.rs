//! Property-based tests for scroll tokens.
//!
//! Covers the keyset position codec: decode inverts encode, tokens are
//! URL-safe, and arbitrary garbage is rejected as `InvalidScrollId`.

use proptest::prelude::*;

use fieldsweep_core::error::SearchError;
use fieldsweep_core::search::{ScrollId, ScrollPosition};

proptest! {
    #[test]
    fn decode_inverts_encode(after in ".{0,80}") {
        let position = ScrollPosition { after };
        let decoded = ScrollPosition::decode(&position.encode()).unwrap();
        prop_assert_eq!(decoded, position);
    }

    #[test]
    fn tokens_are_url_safe(after in "urn:li:[a-zA-Z]{1,12}:[ -~]{1,40}") {
        let id = ScrollPosition { after }.encode();
        prop_assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn distinct_positions_never_collide(a in "[a-z]{1,20}", b in "[a-z]{1,20}") {
        let ta = ScrollPosition { after: a.clone() }.encode();
        let tb = ScrollPosition { after: b.clone() }.encode();
        prop_assert_eq!(ta == tb, a == b);
    }

    #[test]
    fn garbage_is_rejected(raw in "[!@#$%^&*()]{1,30}") {
        let err = ScrollPosition::decode(&ScrollId(raw)).unwrap_err();
        prop_assert!(matches!(err, SearchError::InvalidScrollId(_)));
    }
}
