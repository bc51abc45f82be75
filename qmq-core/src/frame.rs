//! A single message part: an owning buffer plus the transport's "more" bit
//!.

use std::fmt;

use crate::error::{Error, Result};

/// Flags accepted by [`Frame::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Another frame follows; transport-level `SNDMORE`.
    pub more: bool,
    /// Do not consume the frame's payload; the caller keeps ownership.
    pub reuse: bool,
    /// Fail with `EAGAIN` instead of blocking when the socket can't accept.
    pub dontwait: bool,
}

impl SendFlags {
    /// No flags set.
    pub const NONE: Self = Self { more: false, reuse: false, dontwait: false };

    fn to_zmq(self) -> i32 {
        let mut flags = 0;
        if self.more {
            flags |= zmq::SNDMORE;
        }
        if self.dontwait {
            flags |= zmq::DONTWAIT;
        }
        flags
    }
}

/// A single transport-level message part.
///
/// Owns a byte buffer and the `more` bit the transport reports on receipt.
/// Two frames compare equal iff their content is byte-equal; the `more`
/// bit is not part of identity.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    more: bool,
}

impl Frame {
    /// An empty frame (used as an envelope delimiter, see [`crate::Message::wrap`]).
    #[must_use]
    pub fn empty() -> Self {
        Self { data: Vec::new(), more: false }
    }

    /// Build a frame owning the given bytes.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into(), more: false }
    }

    /// Build a frame from a UTF-8 string.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    /// Byte view of the frame's payload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Local-encoding string view, if the payload is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Number of bytes in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty (not whether the frame is the delimiter —
    /// callers that mean the delimiter should compare against `&[]`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the transport reported another frame following this one.
    #[must_use]
    pub fn more(&self) -> bool {
        self.more
    }

    /// Uppercase hex view, two characters per byte, no separators.
    #[must_use]
    pub fn hex_string(&self) -> String {
        let mut s = String::with_capacity(self.data.len() * 2);
        for b in &self.data {
            s.push_str(&format!("{b:02X}"));
        }
        s
    }

    /// Send this frame on `socket`. Without `reuse` the payload is moved
    /// into the transport and this frame is left empty.
    pub fn send(&mut self, socket: &zmq::Socket, flags: SendFlags) -> Result<()> {
        let payload = if flags.reuse {
            self.data.clone()
        } else {
            std::mem::take(&mut self.data)
        };
        socket.send(payload, flags.to_zmq()).map_err(Error::from)
    }

    /// Block for one frame from `socket`, capturing the `more` bit.
    pub fn recv(socket: &zmq::Socket) -> Result<Self> {
        let mut msg = zmq::Message::new();
        socket.recv(&mut msg, 0)?;
        Ok(Self { data: msg.to_vec(), more: msg.get_more() })
    }

    /// Non-blocking receive. `Ok(None)` means the socket had nothing ready.
    pub fn recvnowait(socket: &zmq::Socket) -> Result<Option<Self>> {
        let mut msg = zmq::Message::new();
        match socket.recv(&mut msg, zmq::DONTWAIT) {
            Ok(()) => Ok(Some(Self { data: msg.to_vec(), more: msg.get_more() })),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl Eq for Frame {}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", self.hex_string()),
        }
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_content_not_more_bit() {
        let a = Frame { data: b"hello".to_vec(), more: true };
        let b = Frame { data: b"hello".to_vec(), more: false };
        assert_eq!(a, b);
    }

    #[test]
    fn hex_string_is_uppercase_no_separators() {
        let f = Frame::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(f.hex_string(), "DEADBEEF");
    }

    #[test]
    fn send_without_reuse_drains_payload() {
        let ctx = zmq::Context::new();
        let a = ctx.socket(zmq::PAIR).unwrap();
        let b = ctx.socket(zmq::PAIR).unwrap();
        a.bind("inproc://frame-test-drain").unwrap();
        b.connect("inproc://frame-test-drain").unwrap();

        let mut f = Frame::from_str("payload");
        f.send(&a, SendFlags::NONE).unwrap();
        assert!(f.is_empty());

        let got = Frame::recv(&b).unwrap();
        assert_eq!(got.as_str(), Some("payload"));
    }

    #[test]
    fn send_with_reuse_keeps_payload() {
        let ctx = zmq::Context::new();
        let a = ctx.socket(zmq::PAIR).unwrap();
        let b = ctx.socket(zmq::PAIR).unwrap();
        a.bind("inproc://frame-test-reuse").unwrap();
        b.connect("inproc://frame-test-reuse").unwrap();

        let mut f = Frame::from_str("payload");
        f.send(&a, SendFlags { reuse: true, ..SendFlags::NONE }).unwrap();
        assert_eq!(f.as_str(), Some("payload"));

        let got = Frame::recv(&b).unwrap();
        assert_eq!(got, f);
    }
}
