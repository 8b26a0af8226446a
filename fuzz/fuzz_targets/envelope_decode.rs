//! Fuzz target for envelope decoding
//!
//! Tests that partial decoding and the deferred body decoding handle
//! arbitrary input without panicking.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skein_core::RemoteEnvelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = RemoteEnvelope::decode(Bytes::copy_from_slice(data)) else {
        return;
    };
    let _ = envelope.message_type();
    let _ = envelope.body();
    let _ = envelope.with_incremented_hop_count();
});
