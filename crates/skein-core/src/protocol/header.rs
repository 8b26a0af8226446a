//! Public envelope header.
//!
//! The public header is everything a relay needs to route an envelope
//! without being able to read it. Layout (big-endian):
//!
//! ```text
//! +--------+---------+--------+-----+------+-----------+-----+------+-----------+----------+-------+
//! | nonce  | network | sender | pow | rlen | recipient | hop | alen | agreement | chunk no | total |
//! |  24 B  |   i32   |  32 B  | i32 |  u8  |  0|32 B   | u8  |  u8  |  0|32 B   |   u16    |  u16  |
//! +--------+---------+--------+-----+------+-----------+-----+------+-----------+----------+-------+
//! ```

use std::fmt;

use bytes::BufMut;
use rand::RngCore;
use skein_crypto::{
    AGREEMENT_ID_SIZE, AgreementId, IdentityPublicKey, NONCE_SIZE, PUBLIC_KEY_SIZE, ProofOfWork,
};

use super::Reader;
use crate::error::ProtocolError;

/// Fixed part of an encoded public header (no recipient, no agreement).
pub const FIXED_HEADER_SIZE: usize = NONCE_SIZE + 4 + PUBLIC_KEY_SIZE + 4 + 1 + 1 + 1 + 2 + 2;

/// Random per-envelope nonce. Doubles as message id and AEAD nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a fresh random nonce.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({}..)", hex::encode(&self.0[..6]))
    }
}

/// Position of an envelope within a chunked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkPosition {
    /// Not a chunk
    #[default]
    Whole,
    /// First chunk, announcing how many chunks make up the message
    Head {
        /// Total number of chunks
        total: u16,
    },
    /// Any later chunk
    Body {
        /// Chunk number, never zero
        number: u16,
    },
}

impl ChunkPosition {
    /// Wire value of the chunk number field.
    #[must_use]
    pub fn chunk_no(&self) -> u16 {
        match self {
            Self::Body { number } => *number,
            _ => 0,
        }
    }

    /// Wire value of the total chunks field.
    #[must_use]
    pub fn total_chunks(&self) -> u16 {
        match self {
            Self::Head { total } => *total,
            _ => 0,
        }
    }

    fn from_wire(chunk_no: u16, total_chunks: u16) -> Result<Self, ProtocolError> {
        match (chunk_no, total_chunks) {
            (0, 0) => Ok(Self::Whole),
            (0, total) => Ok(Self::Head { total }),
            (number, 0) => Ok(Self::Body { number }),
            _ => Err(ProtocolError::InvalidField(
                "chunk number and total chunks are exclusive",
            )),
        }
    }
}

/// Routing header of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    nonce: Nonce,
    network_id: i32,
    sender: IdentityPublicKey,
    proof_of_work: ProofOfWork,
    recipient: Option<IdentityPublicKey>,
    hop_count: u8,
    agreement_id: Option<AgreementId>,
    chunk: ChunkPosition,
}

impl PublicHeader {
    /// Header of a new, unchunked, unarmed envelope with hop count zero.
    #[must_use]
    pub fn new(
        nonce: Nonce,
        network_id: i32,
        sender: IdentityPublicKey,
        proof_of_work: ProofOfWork,
        recipient: Option<IdentityPublicKey>,
    ) -> Self {
        Self {
            nonce,
            network_id,
            sender,
            proof_of_work,
            recipient,
            hop_count: 0,
            agreement_id: None,
            chunk: ChunkPosition::Whole,
        }
    }

    /// Message id / AEAD nonce.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Overlay network id.
    #[must_use]
    pub fn network_id(&self) -> i32 {
        self.network_id
    }

    /// Sender public key.
    #[must_use]
    pub fn sender(&self) -> IdentityPublicKey {
        self.sender
    }

    /// Sender proof-of-work.
    #[must_use]
    pub fn proof_of_work(&self) -> ProofOfWork {
        self.proof_of_work
    }

    /// Recipient public key; `None` for multicast.
    #[must_use]
    pub fn recipient(&self) -> Option<IdentityPublicKey> {
        self.recipient
    }

    /// Number of relays the envelope passed.
    #[must_use]
    pub fn hop_count(&self) -> u8 {
        self.hop_count
    }

    /// Agreement the remainder is armed under.
    #[must_use]
    pub fn agreement_id(&self) -> Option<AgreementId> {
        self.agreement_id
    }

    /// Chunk fields.
    #[must_use]
    pub fn chunk(&self) -> ChunkPosition {
        self.chunk
    }

    /// Copy with another hop count.
    #[must_use]
    pub fn with_hop_count(mut self, hop_count: u8) -> Self {
        self.hop_count = hop_count;
        self
    }

    /// Copy with another agreement id.
    #[must_use]
    pub fn with_agreement_id(mut self, agreement_id: Option<AgreementId>) -> Self {
        self.agreement_id = agreement_id;
        self
    }

    /// Copy with other chunk fields.
    #[must_use]
    pub fn with_chunk(mut self, chunk: ChunkPosition) -> Self {
        self.chunk = chunk;
        self
    }

    /// Size of the encoded header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE
            + self.recipient.map_or(0, |_| PUBLIC_KEY_SIZE)
            + self.agreement_id.map_or(0, |_| AGREEMENT_ID_SIZE)
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.nonce.as_bytes());
        buf.put_i32(self.network_id);
        buf.put_slice(self.sender.as_bytes());
        buf.put_i32(self.proof_of_work.nonce());
        match &self.recipient {
            Some(recipient) => {
                buf.put_u8(PUBLIC_KEY_SIZE as u8);
                buf.put_slice(recipient.as_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.put_u8(self.hop_count);
        match &self.agreement_id {
            Some(agreement) => {
                buf.put_u8(AGREEMENT_ID_SIZE as u8);
                buf.put_slice(agreement.as_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.put_u16(self.chunk.chunk_no());
        buf.put_u16(self.chunk.total_chunks());
    }

    /// Associated data for armoring: the encoded header with hop count zeroed,
    /// so relays can increment the hop count without breaking authentication.
    #[must_use]
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.encoded_len());
        self.clone().with_hop_count(0).encode_into(&mut aad);
        aad
    }

    /// Decode a header occupying all of `input`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on truncated input, bad optional field
    /// lengths, conflicting chunk fields or trailing bytes.
    pub fn decode(input: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(input);

        let nonce = Nonce(reader.array()?);
        let network_id = reader.i32()?;
        let sender = IdentityPublicKey::from_bytes(reader.array()?);
        let proof_of_work = ProofOfWork::new(reader.i32()?);
        let recipient = match reader.u8()? {
            0 => None,
            len if usize::from(len) == PUBLIC_KEY_SIZE => {
                Some(IdentityPublicKey::from_bytes(reader.array()?))
            }
            _ => return Err(ProtocolError::InvalidField("recipient length")),
        };
        let hop_count = reader.u8()?;
        let agreement_id = match reader.u8()? {
            0 => None,
            len if usize::from(len) == AGREEMENT_ID_SIZE => {
                Some(AgreementId::from_bytes(reader.array()?))
            }
            _ => return Err(ProtocolError::InvalidField("agreement id length")),
        };
        let chunk = ChunkPosition::from_wire(reader.u16()?, reader.u16()?)?;

        if !reader.is_empty() {
            return Err(ProtocolError::InvalidField("trailing header bytes"));
        }

        Ok(Self {
            nonce,
            network_id,
            sender,
            proof_of_work,
            recipient,
            hop_count,
            agreement_id,
            chunk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PublicHeader {
        PublicHeader::new(
            Nonce::from_bytes([1; NONCE_SIZE]),
            7,
            IdentityPublicKey::from_bytes([2; 32]),
            ProofOfWork::new(42),
            Some(IdentityPublicKey::from_bytes([3; 32])),
        )
    }

    #[test]
    fn test_header_round_trip_with_optional_fields() {
        let header = header()
            .with_hop_count(3)
            .with_agreement_id(Some(AgreementId::from_bytes([4; 32])))
            .with_chunk(ChunkPosition::Head { total: 9 });

        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), header.encoded_len());
        assert_eq!(PublicHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_without_recipient() {
        let header = PublicHeader::new(
            Nonce::random(),
            -1,
            IdentityPublicKey::from_bytes([5; 32]),
            ProofOfWork::default(),
            None,
        );
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), FIXED_HEADER_SIZE);
        assert_eq!(PublicHeader::decode(&buf).unwrap().recipient(), None);
    }

    #[test]
    fn test_decode_rejects_conflicting_chunk_fields() {
        let mut buf = Vec::new();
        header().encode_into(&mut buf);
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&[0, 2, 0, 5]);
        assert!(matches!(
            PublicHeader::decode(&buf),
            Err(ProtocolError::InvalidField(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let mut buf = Vec::new();
        header().encode_into(&mut buf);
        assert!(matches!(
            PublicHeader::decode(&buf[..buf.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_associated_data_ignores_hop_count() {
        let a = header().with_hop_count(0).associated_data();
        let b = header().with_hop_count(5).associated_data();
        assert_eq!(a, b);
    }
}
