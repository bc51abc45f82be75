//! An ordered sequence of [`Frame`]s delivered and accepted as a group
//!.

use std::collections::VecDeque;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::frame::{Frame, SendFlags};

/// An ordered list of frames with O(1) front/back access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: VecDeque<Frame>,
}

impl Message {
    /// An empty message.
    #[must_use]
    pub fn new() -> Self {
        Self { frames: VecDeque::new() }
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the message has no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of all frame sizes (the invariant `content_size == Σ frame.len()`).
    #[must_use]
    pub fn content_size(&self) -> usize {
        self.frames.iter().map(Frame::len).sum()
    }

    /// Borrow the frames in order.
    #[must_use]
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Append a frame at the back.
    pub fn append(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    /// Insert a frame at the front.
    pub fn prepend(&mut self, frame: Frame) {
        self.frames.push_front(frame);
    }

    /// Alias for [`Message::prepend`] (spec's `push`).
    pub fn push(&mut self, frame: Frame) {
        self.prepend(frame);
    }

    /// Remove and return the front frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Pop the front frame and decode it as a local-encoded string.
    pub fn popstr(&mut self) -> Option<String> {
        self.pop().and_then(|f| f.as_str().map(str::to_owned))
    }

    /// Pop the front frame and decode it as an embedded [`Message`].
    ///
    /// Returns `None` when the frame is not a validly encoded Message.
    pub fn popmsg(&mut self) -> Option<Self> {
        let frame = self.pop()?;
        Self::decode(frame.as_bytes()).ok()
    }

    /// Prepend an empty delimiter frame then the given frame (the REQ/REP
    /// envelope convention).
    pub fn wrap(&mut self, frame: Frame) {
        self.prepend(Frame::empty());
        self.prepend(frame);
    }

    /// Pop the first frame and, if the next is an empty delimiter, discard
    /// it too. Returns the popped (non-delimiter) frame.
    pub fn unwrap(&mut self) -> Option<Frame> {
        let frame = self.pop()?;
        if matches!(self.frames.front(), Some(f) if f.is_empty()) {
            self.pop();
        }
        Some(frame)
    }

    /// Send every frame, draining the message; on success the message is
    /// empty.
    pub fn send(&mut self, socket: &zmq::Socket) -> Result<()> {
        while let Some(mut frame) = self.frames.pop_front() {
            let more = !self.frames.is_empty();
            frame.send(socket, SendFlags { more, ..SendFlags::NONE })?;
        }
        Ok(())
    }

    /// Clear then read frames from `socket` until one arrives without
    /// `more` set.
    pub fn recv(&mut self, socket: &zmq::Socket) -> Result<()> {
        self.frames.clear();
        loop {
            let frame = Frame::recv(socket)?;
            let more = frame.more();
            self.frames.push_back(frame);
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Receive a full message, allocating a new one (convenience wrapper
    /// around [`Message::recv`]).
    pub fn recv_new(socket: &zmq::Socket) -> Result<Self> {
        let mut msg = Self::new();
        msg.recv(socket)?;
        Ok(msg)
    }

    /// Encode as a single self-delimiting byte blob: per frame,
    /// a 1-byte length if `< 255`, else `0xFF` followed by a 4-byte
    /// big-endian length, then the frame's bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.content_size() + self.frames.len());
        for frame in &self.frames {
            let size = frame.len();
            if size < 255 {
                buf.push(size as u8);
            } else {
                buf.push(0xFF);
                buf.write_u32::<BigEndian>(size as u32).expect("write to Vec never fails");
            }
            buf.extend_from_slice(frame.as_bytes());
        }
        buf
    }

    /// Decode a blob produced by [`Message::encode`].
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut msg = Self::new();
        while !buf.is_empty() {
            let mut size = buf.read_u8().map_err(|_| Error::invalid_frame("truncated length"))? as usize;
            if size == 255 {
                size = buf
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::invalid_frame("truncated long length"))? as usize;
            }
            if buf.len() < size {
                return Err(Error::invalid_frame("frame exceeds buffer"));
            }
            let (data, rest) = buf.split_at(size);
            msg.append(Frame::new(data.to_vec()));
            buf = rest;
        }
        Ok(msg)
    }

    /// Write one `(4-byte big-endian size, bytes)` record per frame.
    pub fn save<W: Write>(&self, mut out: W) -> Result<()> {
        for frame in &self.frames {
            out.write_u32::<BigEndian>(frame.len() as u32)?;
            out.write_all(frame.as_bytes())?;
        }
        Ok(())
    }

    /// Read the on-disk format written by [`Message::save`]. An empty
    /// stream decodes to an empty message.
    pub fn load<R: Read>(mut input: R) -> Result<Self> {
        let mut msg = Self::new();
        loop {
            let size = match input.read_u32::<BigEndian>() {
                Ok(n) => n as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::from(e)),
            };
            let mut data = vec![0u8; size];
            input.read_exact(&mut data)?;
            msg.append(Frame::new(data));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_of_sizes(sizes: &[usize]) -> Message {
        let mut m = Message::new();
        for &s in sizes {
            m.append(Frame::new(vec![b'x'; s]));
        }
        m
    }

    #[test]
    fn encode_decode_round_trip_edge_sizes() {
        let sizes = [0, 1, 253, 254, 255, 256, 65535, 65536, 65537];
        let m = msg_of_sizes(&sizes);
        let decoded = Message::decode(&m.encode()).unwrap();
        assert_eq!(decoded.len(), sizes.len());
        for (frame, &expected) in decoded.frames().zip(sizes.iter()) {
            assert_eq!(frame.len(), expected);
        }
    }

    #[test]
    fn file_round_trip() {
        let m = msg_of_sizes(&[0, 3, 300]);
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let loaded = Message::load(&buf[..]).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn empty_file_loads_to_empty_message() {
        let loaded = Message::load(&b""[..]).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn wrap_unwrap_identity_empty_message() {
        let mut m = Message::new();
        let f = Frame::from_str("envelope-id");
        m.wrap(f.clone());
        let got = m.unwrap().unwrap();
        assert_eq!(got, f);
        assert!(m.is_empty());
    }

    #[test]
    fn wrap_unwrap_identity_nonempty_message() {
        let mut m = Message::new();
        m.append(Frame::from_str("body"));
        let f = Frame::from_str("envelope-id");
        m.wrap(f.clone());
        let got = m.unwrap().unwrap();
        assert_eq!(got, f);
        assert_eq!(m.len(), 1);
        assert_eq!(m.frames().next().unwrap().as_str(), Some("body"));
    }

    #[test]
    fn popmsg_rejects_invalid_encoding() {
        let mut m = Message::new();
        m.append(Frame::new(vec![5, 1, 2])); // claims 5 bytes, only has 2
        assert!(m.popmsg().is_none());
    }
}
