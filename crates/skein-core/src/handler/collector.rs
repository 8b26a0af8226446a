//! Reassembly of one chunked message.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::error::ChunkError;
use crate::protocol::{ChunkPosition, Nonce, RemoteEnvelope};

/// Collects the chunks of the message identified by one nonce.
///
/// The head chunk announces the total; body chunks may arrive before it.
/// Accumulated bytes are bounded by the maximum content length: a chunk
/// that would exceed it releases everything buffered so far.
#[derive(Debug)]
pub struct ChunksCollector {
    nonce: Nonce,
    max_content_length: usize,
    total: Option<u16>,
    chunks: BTreeMap<u16, Bytes>,
    size: usize,
    complete: bool,
}

impl ChunksCollector {
    /// Empty collector for the message `nonce`.
    #[must_use]
    pub fn new(nonce: Nonce, max_content_length: usize) -> Self {
        Self {
            nonce,
            max_content_length,
            total: None,
            chunks: BTreeMap::new(),
            size: 0,
            complete: false,
        }
    }

    /// Message id this collector belongs to.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Number of distinct chunks buffered.
    #[must_use]
    pub fn present(&self) -> usize {
        self.chunks.len()
    }

    /// Announced total, once the head chunk arrived.
    #[must_use]
    pub fn total(&self) -> Option<u16> {
        self.total
    }

    /// Bytes buffered.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the message was composed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn release(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Add a chunk. Returns the composed message once the last missing
    /// chunk arrived.
    ///
    /// Duplicate chunk numbers are ignored.
    ///
    /// # Errors
    ///
    /// Rejects without touching the buffered chunks if the message is
    /// already complete, the envelope is not a chunk or belongs to another
    /// message. Releases every buffered chunk and fails if the chunk number
    /// is out of range or the message would exceed the maximum content
    /// length.
    pub fn add_chunk(&mut self, chunk: &RemoteEnvelope) -> Result<Option<Bytes>, ChunkError> {
        if self.complete {
            return Err(ChunkError::AlreadyComplete);
        }
        let number = match chunk.header().chunk() {
            ChunkPosition::Whole => return Err(ChunkError::NotAChunk),
            ChunkPosition::Head { .. } => 0,
            ChunkPosition::Body { number } => number,
        };
        if chunk.nonce() != self.nonce {
            return Err(ChunkError::IdMismatch);
        }
        if self.chunks.contains_key(&number) {
            return Ok(None);
        }

        if let ChunkPosition::Head { total } = chunk.header().chunk() {
            if let Some(&highest) = self.chunks.keys().next_back() {
                if highest >= total {
                    self.release();
                    return Err(ChunkError::OutOfRange {
                        number: highest,
                        total,
                    });
                }
            }
            self.total = Some(total);
        }
        if let Some(total) = self.total {
            if number >= total {
                self.release();
                return Err(ChunkError::OutOfRange { number, total });
            }
        }

        let size = self.size + chunk.remainder().len();
        if size > self.max_content_length {
            self.release();
            return Err(ChunkError::TooLarge {
                max: self.max_content_length,
                size,
            });
        }
        self.chunks.insert(number, chunk.remainder().clone());
        self.size = size;

        match self.total {
            Some(total) if self.chunks.len() == usize::from(total) => Ok(Some(self.compose())),
            _ => Ok(None),
        }
    }

    /// Concatenate the fragments in chunk order. This is the one copy of
    /// the payload on the reassembly path: the codec decodes from a single
    /// contiguous buffer, and the fragments are released right after.
    fn compose(&mut self) -> Bytes {
        self.complete = true;
        let mut message = BytesMut::with_capacity(self.size);
        for fragment in std::mem::take(&mut self.chunks).into_values() {
            message.extend_from_slice(&fragment);
        }
        self.size = 0;
        message.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::{IdentityPublicKey, NONCE_SIZE, ProofOfWork};

    use crate::protocol::PublicHeader;

    fn header(nonce: u8) -> PublicHeader {
        PublicHeader::new(
            Nonce::from_bytes([nonce; NONCE_SIZE]),
            0,
            IdentityPublicKey::from_bytes([1; 32]),
            ProofOfWork::default(),
            Some(IdentityPublicKey::from_bytes([2; 32])),
        )
    }

    fn chunk(nonce: u8, position: ChunkPosition, data: &'static [u8]) -> RemoteEnvelope {
        RemoteEnvelope::from_parts(header(nonce).with_chunk(position), Bytes::from_static(data))
    }

    fn collector(max: usize) -> ChunksCollector {
        ChunksCollector::new(Nonce::from_bytes([7; NONCE_SIZE]), max)
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut collector = collector(1024);
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Body { number: 2 }, b"ghi")),
            Ok(None)
        );
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Head { total: 3 }, b"abc")),
            Ok(None)
        );
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"def")),
            Ok(Some(Bytes::from_static(b"abcdefghi")))
        );
        assert!(collector.is_complete());
    }

    #[test]
    fn test_composition_releases_fragments() {
        let mut collector = collector(1024);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Head { total: 2 }, b"abc"))
            .unwrap();
        assert_eq!(collector.size(), 3);
        let message = collector
            .add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"de"))
            .unwrap()
            .unwrap();
        assert_eq!(message, Bytes::from_static(b"abcde"));
        assert_eq!(collector.size(), 0);
        assert!(collector.chunks.is_empty());
    }

    #[test]
    fn test_rejects_after_completion() {
        let mut collector = collector(1024);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Head { total: 2 }, b"a"))
            .unwrap();
        collector
            .add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"b"))
            .unwrap();
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"b")),
            Err(ChunkError::AlreadyComplete)
        );
    }

    #[test]
    fn test_rejects_foreign_message_without_mutation() {
        let mut collector = collector(1024);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Head { total: 3 }, b"abc"))
            .unwrap();
        assert_eq!(
            collector.add_chunk(&chunk(8, ChunkPosition::Body { number: 1 }, b"def")),
            Err(ChunkError::IdMismatch)
        );
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Whole, b"def")),
            Err(ChunkError::NotAChunk)
        );
        assert_eq!(collector.present(), 1);
        assert_eq!(collector.size(), 3);
    }

    #[test]
    fn test_too_large_releases_buffers() {
        let mut collector = collector(5);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Head { total: 3 }, b"abc"))
            .unwrap();
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"def")),
            Err(ChunkError::TooLarge { max: 5, size: 6 })
        );
        assert_eq!(collector.present(), 0);
        assert_eq!(collector.size(), 0);
    }

    #[test]
    fn test_exactly_max_content_length_is_accepted() {
        let mut collector = collector(6);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Head { total: 2 }, b"abc"))
            .unwrap();
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Body { number: 1 }, b"def")),
            Ok(Some(Bytes::from_static(b"abcdef")))
        );
    }

    #[test]
    fn test_duplicates_are_not_counted() {
        let mut collector = collector(1024);
        let body = chunk(7, ChunkPosition::Body { number: 1 }, b"def");
        collector.add_chunk(&body).unwrap();
        collector.add_chunk(&body).unwrap();
        assert_eq!(collector.present(), 1);
        assert_eq!(collector.size(), 3);
    }

    #[test]
    fn test_chunk_number_beyond_total() {
        let mut collector = collector(1024);
        collector
            .add_chunk(&chunk(7, ChunkPosition::Body { number: 4 }, b"x"))
            .unwrap();
        assert_eq!(
            collector.add_chunk(&chunk(7, ChunkPosition::Head { total: 2 }, b"a")),
            Err(ChunkError::OutOfRange { number: 4, total: 2 })
        );
        assert_eq!(collector.present(), 0);
    }
}
