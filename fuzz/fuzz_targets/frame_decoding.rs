#![no_main]

//! Fuzz target for decoding link frames.
//!
//! Whatever the coordinator sends, decoding must either fail cleanly or
//! yield a frame that encodes back to the same frame.

use libfuzzer_sys::fuzz_target;
use mailhook_channel::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(frame) = Frame::from_value(value) else {
        return;
    };

    let encoded = frame.to_value().expect("decoded frame must encode");
    let decoded = Frame::from_value(encoded).expect("encoded frame must decode");
    assert_eq!(decoded, frame);
});
