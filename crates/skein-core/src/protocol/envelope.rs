//! Envelope encoding and partial decoding.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use skein_crypto::{AgreementId, IdentityPublicKey};

use super::{Body, ChunkPosition, MessageType, Nonce, PublicHeader, Reader};
use crate::error::ProtocolError;
use crate::identity::Identity;

/// Magic number opening every envelope
pub const MAGIC: [u8; 4] = [0x1E, 0x3F, 0x50, 0x01];

const LENGTH_PREFIX_SIZE: usize = 2;

/// One wire unit: a full message, a chunk fragment or an armed blob.
///
/// The remainder after the public header is kept as raw bytes. Depending on
/// the header it holds a cleartext private header and body, an AEAD
/// ciphertext (agreement id present) or a slice of a larger encoded
/// envelope (chunk fields present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEnvelope {
    header: PublicHeader,
    remainder: Bytes,
}

impl RemoteEnvelope {
    /// Assemble an envelope from a header and a raw remainder.
    #[must_use]
    pub fn from_parts(header: PublicHeader, remainder: Bytes) -> Self {
        Self { header, remainder }
    }

    /// Cleartext envelope carrying `body`.
    ///
    /// # Errors
    ///
    /// Fails if the body cannot be encoded.
    pub fn new(header: PublicHeader, body: &Body) -> Result<Self, ProtocolError> {
        Ok(Self::from_parts(header, body.encode()?))
    }

    fn originate(
        identity: &Identity,
        network_id: i32,
        recipient: IdentityPublicKey,
        body: &Body,
    ) -> Result<Self, ProtocolError> {
        let header = PublicHeader::new(
            Nonce::random(),
            network_id,
            identity.public_key(),
            identity.proof_of_work(),
            Some(recipient),
        );
        Self::new(header, body)
    }

    /// Application message from the local node.
    ///
    /// # Errors
    ///
    /// Fails for a type name that does not fit the wire format.
    pub fn application(
        identity: &Identity,
        network_id: i32,
        recipient: IdentityPublicKey,
        type_name: impl Into<String>,
        payload: Bytes,
    ) -> Result<Self, ProtocolError> {
        let body = Body::Application {
            type_name: type_name.into(),
            payload,
        };
        Self::originate(identity, network_id, recipient, &body)
    }

    /// Discovery ping from the local node.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors the other builders.
    pub fn discovery(
        identity: &Identity,
        network_id: i32,
        recipient: IdentityPublicKey,
        children_time: u64,
    ) -> Result<Self, ProtocolError> {
        Self::originate(
            identity,
            network_id,
            recipient,
            &Body::Discovery { children_time },
        )
    }

    /// Ping without a recipient, announcing the local node to whoever
    /// listens on a multicast group.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors the other builders.
    pub fn multicast_discovery(identity: &Identity, network_id: i32) -> Result<Self, ProtocolError> {
        let header = PublicHeader::new(
            Nonce::random(),
            network_id,
            identity.public_key(),
            identity.proof_of_work(),
            None,
        );
        Self::new(header, &Body::Discovery { children_time: 0 })
    }

    /// Pong answering the ping with nonce `correlation_id`.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors the other builders.
    pub fn acknowledgement(
        identity: &Identity,
        network_id: i32,
        recipient: IdentityPublicKey,
        correlation_id: Nonce,
    ) -> Result<Self, ProtocolError> {
        Self::originate(
            identity,
            network_id,
            recipient,
            &Body::Acknowledgement { correlation_id },
        )
    }

    /// Unite telling `recipient` where to find `public_key`.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors the other builders.
    pub fn unite(
        identity: &Identity,
        network_id: i32,
        recipient: IdentityPublicKey,
        public_key: IdentityPublicKey,
        address: SocketAddr,
    ) -> Result<Self, ProtocolError> {
        Self::originate(
            identity,
            network_id,
            recipient,
            &Body::Unite {
                public_key,
                address,
            },
        )
    }

    /// Public header.
    #[must_use]
    pub fn header(&self) -> &PublicHeader {
        &self.header
    }

    /// Raw bytes following the public header.
    #[must_use]
    pub fn remainder(&self) -> &Bytes {
        &self.remainder
    }

    /// Message id.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.header.nonce()
    }

    /// Sender public key.
    #[must_use]
    pub fn sender(&self) -> IdentityPublicKey {
        self.header.sender()
    }

    /// Recipient public key.
    #[must_use]
    pub fn recipient(&self) -> Option<IdentityPublicKey> {
        self.header.recipient()
    }

    /// Hop count.
    #[must_use]
    pub fn hop_count(&self) -> u8 {
        self.header.hop_count()
    }

    /// Whether this envelope is a chunk fragment.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.header.chunk() != ChunkPosition::Whole
    }

    /// Whether the remainder is an AEAD ciphertext.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.is_chunk() && self.header.agreement_id().is_some()
    }

    /// Decode the private header and body.
    ///
    /// # Errors
    ///
    /// Fails for armed envelopes, chunk fragments and malformed remainders.
    pub fn body(&self) -> Result<Body, ProtocolError> {
        if self.is_chunk() {
            return Err(ProtocolError::Fragment);
        }
        if self.is_armed() {
            return Err(ProtocolError::Armed);
        }
        Body::decode(&self.remainder)
    }

    /// Type of a cleartext envelope, read from the private header alone.
    ///
    /// # Errors
    ///
    /// Fails for armed envelopes, chunk fragments and unknown types.
    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        if self.is_chunk() {
            return Err(ProtocolError::Fragment);
        }
        if self.is_armed() {
            return Err(ProtocolError::Armed);
        }
        let mut reader = Reader::new(&self.remainder);
        let header_len = usize::from(reader.u16()?);
        match reader.take(header_len)?.first() {
            Some(&type_byte) => MessageType::try_from(type_byte),
            None => Err(ProtocolError::InvalidField("empty private header")),
        }
    }

    /// Copy with the hop count raised by one.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HopCountOverflow`] at the counter's limit.
    pub fn with_incremented_hop_count(self) -> Result<Self, ProtocolError> {
        let hop_count = self
            .header
            .hop_count()
            .checked_add(1)
            .ok_or(ProtocolError::HopCountOverflow)?;
        Ok(Self {
            header: self.header.with_hop_count(hop_count),
            remainder: self.remainder,
        })
    }

    /// Replace the remainder with a ciphertext armed under `agreement`.
    #[must_use]
    pub fn armed(self, agreement: AgreementId, ciphertext: Bytes) -> Self {
        Self {
            header: self.header.with_agreement_id(Some(agreement)),
            remainder: ciphertext,
        }
    }

    /// Replace an armed remainder with its cleartext.
    #[must_use]
    pub fn disarmed(self, cleartext: Bytes) -> Self {
        Self {
            header: self.header.with_agreement_id(None),
            remainder: cleartext,
        }
    }

    /// Size of the encoded envelope.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        MAGIC.len() + LENGTH_PREFIX_SIZE + self.header.encoded_len() + self.remainder.len()
    }

    /// Encode into a contiguous buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&MAGIC);
        // Headers are bounded well below u16::MAX by their fixed field sizes.
        buf.put_u16(self.header.encoded_len() as u16);
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.remainder);
        buf.freeze()
    }

    /// Decode the public header and keep the remainder as a slice of `input`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for a missing magic number or a malformed
    /// public header.
    pub fn decode(input: Bytes) -> Result<Self, ProtocolError> {
        let prefix = MAGIC.len() + LENGTH_PREFIX_SIZE;
        if input.len() < prefix {
            return Err(ProtocolError::Truncated {
                expected: prefix,
                actual: input.len(),
            });
        }
        if input[..MAGIC.len()] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let header_len = usize::from(u16::from_be_bytes([input[4], input[5]]));
        let header_end = prefix + header_len;
        if input.len() < header_end {
            return Err(ProtocolError::Truncated {
                expected: header_end,
                actual: input.len(),
            });
        }

        let header = PublicHeader::decode(&input[prefix..header_end])?;
        Ok(Self {
            header,
            remainder: input.slice(header_end..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::{NONCE_SIZE, ProofOfWork};

    fn identity() -> Identity {
        Identity::generate(0)
    }

    #[test]
    fn test_application_round_trip() {
        let sender = identity();
        let recipient = identity().public_key();
        let envelope = RemoteEnvelope::application(
            &sender,
            1,
            recipient,
            "bytes",
            Bytes::from_static(b"payload"),
        )
        .unwrap();

        let decoded = RemoteEnvelope::decode(envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(
            decoded.body().unwrap(),
            Body::Application {
                type_name: "bytes".into(),
                payload: Bytes::from_static(b"payload"),
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut raw = BytesMut::from(&[0u8; 16][..]);
        raw[0] = 0xFF;
        assert_eq!(
            RemoteEnvelope::decode(raw.freeze()),
            Err(ProtocolError::BadMagic)
        );
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let envelope =
            RemoteEnvelope::discovery(&identity(), 0, identity().public_key(), 0).unwrap();
        let encoded = envelope.encode();
        assert!(matches!(
            RemoteEnvelope::decode(encoded.slice(..20)),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_partial_decode_keeps_unknown_body_raw() {
        let header = PublicHeader::new(
            Nonce::from_bytes([0; NONCE_SIZE]),
            0,
            IdentityPublicKey::from_bytes([1; 32]),
            ProofOfWork::default(),
            None,
        );
        // Private header announcing an unknown type: relays still route it.
        let envelope =
            RemoteEnvelope::from_parts(header, Bytes::from_static(&[0x00, 0x01, 0xEE]));
        let decoded = RemoteEnvelope::decode(envelope.encode()).unwrap();
        assert_eq!(decoded.header(), envelope.header());
        assert_eq!(
            decoded.body(),
            Err(ProtocolError::UnknownMessageType(0xEE))
        );
    }

    #[test]
    fn test_hop_count_overflow() {
        let envelope = RemoteEnvelope::discovery(&identity(), 0, identity().public_key(), 0)
            .unwrap();
        let header = envelope.header().clone().with_hop_count(u8::MAX);
        let saturated = RemoteEnvelope::from_parts(header, envelope.remainder().clone());
        assert_eq!(
            saturated.with_incremented_hop_count(),
            Err(ProtocolError::HopCountOverflow)
        );
        assert_eq!(envelope.with_incremented_hop_count().unwrap().hop_count(), 1);
    }

    #[test]
    fn test_armed_body_is_not_readable() {
        let envelope = RemoteEnvelope::discovery(&identity(), 0, identity().public_key(), 0)
            .unwrap()
            .armed(AgreementId::from_bytes([2; 32]), Bytes::from_static(b"cipher"));
        assert!(envelope.is_armed());
        assert_eq!(envelope.body(), Err(ProtocolError::Armed));
    }

    #[test]
    fn test_multicast_discovery_has_no_recipient() {
        let sender = identity();
        let envelope = RemoteEnvelope::multicast_discovery(&sender, 7).unwrap();
        let decoded = RemoteEnvelope::decode(envelope.encode()).unwrap();
        assert_eq!(decoded.recipient(), None);
        assert_eq!(decoded.sender(), sender.public_key());
        assert_eq!(decoded.header().network_id(), 7);
        assert_eq!(decoded.body().unwrap(), Body::Discovery { children_time: 0 });
    }
}
