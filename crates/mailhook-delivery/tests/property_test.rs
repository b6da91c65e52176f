//! Property-based tests for header layering and payload signatures.

use bytes::Bytes;
use chrono::Utc;
use mailhook_core::{HeaderSet, Job};
use mailhook_delivery::{
    executor::{base_headers, layered_headers},
    signing::{sign_body, verify_signature, SignedPayload, EVENT_ID_HEADER, SIGNATURE_HEADER},
};
use proptest::prelude::*;
use serde_json::json;

fn header_layer() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[A-Za-z][A-Za-z0-9-]{0,15}", "[ -~]{0,20}"), 0..8)
}

fn signed(signature: &str) -> SignedPayload {
    SignedPayload {
        body: Bytes::from_static(b"{}"),
        signature: signature.to_string(),
        event_id: Some("ev".to_string()),
    }
}

proptest! {
    #[test]
    fn later_layers_win_case_insensitively(first in header_layer(), second in header_layer()) {
        let mut headers: HeaderSet = first.clone().into_iter().collect();
        headers.apply_layer(second.clone());

        for (key, _) in &second {
            let last = second
                .iter()
                .rev()
                .find(|(other, _)| other.eq_ignore_ascii_case(key))
                .map(|(_, value)| value.as_str());
            prop_assert_eq!(headers.get(key), last);
            prop_assert!(headers.contains(&key.to_ascii_uppercase()));
        }

        let mut distinct: Vec<String> =
            first.iter().chain(&second).map(|(key, _)| key.to_ascii_lowercase()).collect();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(headers.len(), distinct.len());
    }

    #[test]
    fn signature_and_event_id_survive_any_custom_layer(
        custom in header_layer(),
        signature in "[A-Za-z0-9_-]{43}",
    ) {
        let job = Job::new("1", "messageNew", json!({}));
        let base = base_headers(&job, "agent", None, Utc::now());

        let mut custom: HeaderSet = custom.into_iter().collect();
        custom.insert("x-ee-wh-signature", "forged");
        custom.insert("X-EE-WH-EVENT-ID", "forged");

        let headers = layered_headers(base, &custom, &signed(&signature));
        prop_assert_eq!(headers.get(SIGNATURE_HEADER), Some(signature.as_str()));
        prop_assert_eq!(headers.get(EVENT_ID_HEADER), Some("ev"));
    }

    #[test]
    fn signature_verifies_and_detects_single_byte_changes(
        secret in prop::collection::vec(any::<u8>(), 1..64),
        body in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let signature = sign_body(&secret, &body).unwrap();
        prop_assert!(!signature.contains('='));
        prop_assert!(verify_signature(&secret, &body, &signature));

        let mut tampered = body.clone();
        let position = index.index(tampered.len());
        tampered[position] ^= flip;
        prop_assert!(!verify_signature(&secret, &tampered, &signature));
    }
}
