//! A generated-style protocol-frame codec, exemplified by the gossip
//! cluster-membership messages: HELLO / PUBLISH / PING / PONG (spec
//! §4.J). Every frame starts with a 2-byte big-endian signature and a
//! 1-byte message id; the payload layout is fixed per id.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use qmq_core::{Error, Frame, Result};

const SIGNATURE: u16 = 0xAAA0;
const VERSION: u8 = 1;

const ID_HELLO: u8 = 1;
const ID_PUBLISH: u8 = 2;
const ID_PING: u8 = 3;
const ID_PONG: u8 = 4;

/// A decoded gossip frame.
///
/// `Invalid` is a recv-only sentinel: produced when the signature matched
/// but the id or version didn't decode, never constructed for send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipFrame {
    Hello,
    Publish { key: String, value: Vec<u8>, ttl: u32 },
    Ping,
    Pong,
    Invalid,
}

impl GossipFrame {
    /// Encode this frame as wire bytes (signature + id + payload).
    ///
    /// # Panics
    /// Panics if called on [`GossipFrame::Invalid`] — there is no wire
    /// representation for it, mirroring the qmq/gossip.cpp exemplar where
    /// only receive can produce an invalid message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(SIGNATURE).unwrap();
        match self {
            Self::Hello => {
                buf.write_u8(ID_HELLO).unwrap();
                buf.write_u8(VERSION).unwrap();
            }
            Self::Publish { key, value, ttl } => {
                buf.write_u8(ID_PUBLISH).unwrap();
                buf.write_u8(VERSION).unwrap();
                let key_bytes = key.as_bytes();
                assert!(key_bytes.len() <= u8::MAX as usize, "gossip key longer than 255 bytes");
                buf.write_u8(key_bytes.len() as u8).unwrap();
                buf.extend_from_slice(key_bytes);
                buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
                buf.extend_from_slice(value);
                buf.write_u32::<BigEndian>(*ttl).unwrap();
            }
            Self::Ping => {
                buf.write_u8(ID_PING).unwrap();
                buf.write_u8(VERSION).unwrap();
            }
            Self::Pong => {
                buf.write_u8(ID_PONG).unwrap();
                buf.write_u8(VERSION).unwrap();
            }
            Self::Invalid => panic!("GossipFrame::Invalid has no wire encoding"),
        }
        buf
    }

    /// Decode a frame from raw bytes. Returns `Invalid` (not an error) when
    /// the signature matched but the id/version didn't; returns `Err` on a
    /// bad signature or truncated payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let signature = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| Error::Protocol("gossip frame too short for signature".into()))?;
        if signature != SIGNATURE {
            return Err(Error::Protocol("gossip frame signature mismatch".into()));
        }
        let id = cursor.read_u8().map_err(|_| Error::Protocol("gossip frame missing id".into()))?;

        let frame = match id {
            ID_HELLO | ID_PING | ID_PONG => {
                let Ok(version) = cursor.read_u8() else {
                    return Ok(Self::Invalid);
                };
                if version != VERSION {
                    return Ok(Self::Invalid);
                }
                match id {
                    ID_HELLO => Self::Hello,
                    ID_PING => Self::Ping,
                    ID_PONG => Self::Pong,
                    _ => unreachable!(),
                }
            }
            ID_PUBLISH => {
                let Some(parsed) = Self::decode_publish(&mut cursor) else {
                    return Ok(Self::Invalid);
                };
                parsed
            }
            _ => return Ok(Self::Invalid),
        };
        Ok(frame)
    }

    fn decode_publish(cursor: &mut &[u8]) -> Option<Self> {
        let version = cursor.read_u8().ok()?;
        if version != VERSION {
            return None;
        }
        let key_len = cursor.read_u8().ok()? as usize;
        if cursor.len() < key_len {
            return None;
        }
        let key = String::from_utf8(cursor[..key_len].to_vec()).ok()?;
        *cursor = &cursor[key_len..];

        let value_len = cursor.read_u32::<BigEndian>().ok()? as usize;
        if cursor.len() < value_len {
            return None;
        }
        let value = cursor[..value_len].to_vec();
        *cursor = &cursor[value_len..];

        let ttl = cursor.read_u32::<BigEndian>().ok()?;
        Some(Self::Publish { key, value, ttl })
    }

    /// Send this frame on `socket`. On a ROUTER socket, `identity` is sent
    /// first as a routing frame before the payload.
    pub fn send(&self, socket: &zmq::Socket, identity: Option<&[u8]>) -> Result<()> {
        if let Some(id) = identity {
            socket.send(id, zmq::SNDMORE)?;
        }
        let bytes = self.encode();
        socket.send(bytes, 0)?;
        Ok(())
    }

    /// Receive a frame from `socket`. On a ROUTER socket, the leading
    /// identity frame is returned alongside the decoded payload.
    pub fn recv(socket: &zmq::Socket, is_router: bool) -> Result<(Option<Vec<u8>>, Self)> {
        let identity = if is_router {
            let frame = Frame::recv(socket)?;
            Some(frame.as_bytes().to_vec())
        } else {
            None
        };
        let payload = Frame::recv(socket)?;
        let frame = Self::decode(payload.as_bytes())?;
        Ok((identity, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmq_core::{Context, SocketType};

    #[test]
    fn hello_ping_pong_round_trip() {
        for frame in [GossipFrame::Hello, GossipFrame::Ping, GossipFrame::Pong] {
            let bytes = frame.encode();
            assert_eq!(GossipFrame::decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn publish_round_trip_preserves_key_value_and_ttl() {
        let frame = GossipFrame::Publish {
            key: "Life is short but Now lasts for ever".to_string(),
            value: b"Life is short but Now lasts for ever".to_vec(),
            ttl: 123,
        };
        let bytes = frame.encode();
        let decoded = GossipFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bad_signature_is_an_error_not_invalid() {
        let bytes = vec![0x00, 0x00, ID_HELLO, VERSION];
        assert!(GossipFrame::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_id_decodes_as_invalid() {
        let mut bytes = Vec::new();
        bytes.write_u16::<BigEndian>(SIGNATURE).unwrap();
        bytes.write_u8(0xEE).unwrap();
        assert_eq!(GossipFrame::decode(&bytes).unwrap(), GossipFrame::Invalid);
    }

    #[test]
    fn router_send_recv_carries_identity_first() {
        let ctx = Context::new();
        let router = ctx.socket(SocketType::Router).unwrap();
        router.bind("inproc://gossip-router-test").unwrap();
        let dealer = ctx.socket(SocketType::Dealer).unwrap();
        dealer.set_identity(b"peer-1").unwrap();
        dealer.connect("inproc://gossip-router-test").unwrap();

        GossipFrame::Ping.send(&dealer, None).unwrap();

        let (identity, frame) = GossipFrame::recv(&router, true).unwrap();
        assert_eq!(identity.unwrap(), b"peer-1");
        assert_eq!(frame, GossipFrame::Ping);
    }
}
