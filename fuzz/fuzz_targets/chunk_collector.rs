//! Fuzz target for chunk reassembly
//!
//! Feeds arbitrary datagrams to one collector. Whatever arrives, the
//! collector must never buffer more than its limit or panic.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skein_core::RemoteEnvelope;
use skein_core::handler::ChunksCollector;

const MAX_CONTENT_LENGTH: usize = 4096;

fuzz_target!(|datagrams: Vec<Vec<u8>>| {
    let mut collector: Option<ChunksCollector> = None;
    for datagram in datagrams {
        let Ok(chunk) = RemoteEnvelope::decode(Bytes::from(datagram)) else {
            continue;
        };
        let collector = collector
            .get_or_insert_with(|| ChunksCollector::new(chunk.nonce(), MAX_CONTENT_LENGTH));
        if let Ok(Some(composed)) = collector.add_chunk(&chunk) {
            assert!(composed.len() <= MAX_CONTENT_LENGTH);
            let _ = RemoteEnvelope::decode(composed);
        }
        assert!(collector.size() <= MAX_CONTENT_LENGTH);
    }
});
