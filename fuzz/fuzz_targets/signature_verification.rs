#![no_main]

//! Fuzz target for payload signature verification.
//!
//! Arbitrary signatures must never panic and must never verify against a
//! body they were not computed for.

use libfuzzer_sys::fuzz_target;
use mailhook_delivery::signing::{sign_body, verify_signature};

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (secret, rest) = data.split_at(split);
    let secret = if secret.is_empty() { b"secret".as_slice() } else { secret };

    let candidate = String::from_utf8_lossy(rest);
    let _ = verify_signature(secret, rest, &candidate);

    if let Ok(signature) = sign_body(secret, rest) {
        assert!(verify_signature(secret, rest, &signature));
        let mut tampered = rest.to_vec();
        tampered.push(0);
        assert!(!verify_signature(secret, &tampered, &signature));
    }
});
