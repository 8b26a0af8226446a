//! Private header and message bodies.
//!
//! The cleartext remainder of an envelope is a length-delimited private
//! header (the message type) followed by the type-specific body.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use skein_crypto::{IdentityPublicKey, NONCE_SIZE};

use super::{Nonce, Reader};
use crate::error::ProtocolError;

const PRIVATE_HEADER_SIZE: u16 = 1;

/// Private header type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application payload
    Application = 0x01,
    /// Discovery ping
    Discovery = 0x02,
    /// Pong answering a discovery ping
    Acknowledgement = 0x03,
    /// Rendezvous message carrying another peer's address
    Unite = 0x04,
    /// Session key offer
    KeyExchange = 0x05,
    /// Session key acknowledgement
    KeyExchangeAck = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Application),
            0x02 => Ok(Self::Discovery),
            0x03 => Ok(Self::Acknowledgement),
            0x04 => Ok(Self::Unite),
            0x05 => Ok(Self::KeyExchange),
            0x06 => Ok(Self::KeyExchangeAck),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Decoded envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Application payload tagged with its type name
    Application {
        /// Type name used for allow-list checks
        type_name: String,
        /// Opaque payload
        payload: Bytes,
    },
    /// Ping; a non-zero `children_time` asks the recipient to register the
    /// sender as a child (millis since the unix epoch)
    Discovery {
        /// Join timestamp, zero for a plain ping
        children_time: u64,
    },
    /// Pong
    Acknowledgement {
        /// Nonce of the ping being answered
        correlation_id: Nonce,
    },
    /// Address of another peer to attempt a direct path with
    Unite {
        /// Peer to contact
        public_key: IdentityPublicKey,
        /// Address the relay observed for that peer
        address: SocketAddr,
    },
    /// Offer of an ephemeral session key
    KeyExchange {
        /// Ephemeral public key
        session_key: IdentityPublicKey,
    },
    /// Acknowledgement of a key exchange
    KeyExchangeAck {
        /// Nonce of the key exchange being acknowledged
        correlation_id: Nonce,
    },
}

impl Body {
    /// Type discriminant of this body.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Application { .. } => MessageType::Application,
            Self::Discovery { .. } => MessageType::Discovery,
            Self::Acknowledgement { .. } => MessageType::Acknowledgement,
            Self::Unite { .. } => MessageType::Unite,
            Self::KeyExchange { .. } => MessageType::KeyExchange,
            Self::KeyExchangeAck { .. } => MessageType::KeyExchangeAck,
        }
    }

    /// Encode private header and body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] for an application type name
    /// longer than 65535 bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(PRIVATE_HEADER_SIZE);
        buf.put_u8(self.message_type() as u8);

        match self {
            Self::Application { type_name, payload } => {
                let len = u16::try_from(type_name.len())
                    .map_err(|_| ProtocolError::InvalidField("type name length"))?;
                buf.put_u16(len);
                buf.put_slice(type_name.as_bytes());
                buf.put_slice(payload);
            }
            Self::Discovery { children_time } => buf.put_u64(*children_time),
            Self::Acknowledgement { correlation_id } | Self::KeyExchangeAck { correlation_id } => {
                buf.put_slice(correlation_id.as_bytes());
            }
            Self::Unite {
                public_key,
                address,
            } => {
                buf.put_slice(public_key.as_bytes());
                match address.ip() {
                    IpAddr::V4(ip) => {
                        buf.put_u8(4);
                        buf.put_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.put_u8(6);
                        buf.put_slice(&ip.octets());
                    }
                }
                buf.put_u16(address.port());
            }
            Self::KeyExchange { session_key } => buf.put_slice(session_key.as_bytes()),
        }

        Ok(buf.freeze())
    }

    fn encoded_len(&self) -> usize {
        let body = match self {
            Self::Application { type_name, payload } => 2 + type_name.len() + payload.len(),
            Self::Discovery { .. } => 8,
            Self::Acknowledgement { .. } | Self::KeyExchangeAck { .. } => NONCE_SIZE,
            Self::Unite { .. } => 32 + 1 + 16 + 2,
            Self::KeyExchange { .. } => 32,
        };
        2 + usize::from(PRIVATE_HEADER_SIZE) + body
    }

    /// Decode a cleartext remainder.
    ///
    /// Application payloads are sliced out of `input` without copying.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on truncation, unknown type or malformed
    /// fields.
    pub fn decode(input: &Bytes) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(input);
        let header_len = usize::from(reader.u16()?);
        let header = reader.take(header_len)?;
        let Some(&type_byte) = header.first() else {
            return Err(ProtocolError::InvalidField("empty private header"));
        };

        let body = match MessageType::try_from(type_byte)? {
            MessageType::Application => {
                let name_len = usize::from(reader.u16()?);
                let name = reader.take(name_len)?;
                let type_name = std::str::from_utf8(name)
                    .map_err(|_| ProtocolError::InvalidField("type name encoding"))?
                    .to_owned();
                let payload = input.slice(reader.position()..);
                reader.skip_rest();
                Self::Application { type_name, payload }
            }
            MessageType::Discovery => Self::Discovery {
                children_time: reader.u64()?,
            },
            MessageType::Acknowledgement => Self::Acknowledgement {
                correlation_id: Nonce::from_bytes(reader.array()?),
            },
            MessageType::KeyExchangeAck => Self::KeyExchangeAck {
                correlation_id: Nonce::from_bytes(reader.array()?),
            },
            MessageType::Unite => {
                let public_key = IdentityPublicKey::from_bytes(reader.array()?);
                let ip = match reader.u8()? {
                    4 => IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?)),
                    6 => IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?)),
                    _ => return Err(ProtocolError::InvalidField("address family")),
                };
                let port = reader.u16()?;
                Self::Unite {
                    public_key,
                    address: SocketAddr::new(ip, port),
                }
            }
            MessageType::KeyExchange => Self::KeyExchange {
                session_key: IdentityPublicKey::from_bytes(reader.array()?),
            },
        };

        if !reader.is_empty() {
            return Err(ProtocolError::InvalidField("trailing body bytes"));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_message_type() {
        let input = Bytes::from_static(&[0x00, 0x01, 0x7F]);
        assert_eq!(
            Body::decode(&input),
            Err(ProtocolError::UnknownMessageType(0x7F))
        );
    }

    #[test]
    fn test_unite_with_ipv6_address() {
        let body = Body::Unite {
            public_key: IdentityPublicKey::from_bytes([8; 32]),
            address: "[2001:db8::1]:22527".parse().unwrap(),
        };
        let encoded = body.encode().unwrap();
        assert_eq!(Body::decode(&encoded).unwrap(), body);
    }

    #[test]
    fn test_application_payload_is_sliced() {
        let body = Body::Application {
            type_name: "chat".into(),
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = body.encode().unwrap();
        match Body::decode(&encoded).unwrap() {
            Body::Application { type_name, payload } => {
                assert_eq!(type_name, "chat");
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_discovery_rejects_trailing_bytes() {
        let mut encoded = BytesMut::from(
            &Body::Discovery { children_time: 5 }.encode().unwrap()[..],
        );
        encoded.put_u8(0);
        assert!(matches!(
            Body::decode(&encoded.freeze()),
            Err(ProtocolError::InvalidField(_))
        ));
    }

    #[test]
    fn test_truncated_acknowledgement() {
        let input = Bytes::from_static(&[0x00, 0x01, 0x03, 0xAA]);
        assert!(matches!(
            Body::decode(&input),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
