//! The `signal`/`wait` handshake actors use to synchronise with their
//! caller.

use crate::error::{Error, Result};
use crate::frame::{Frame, SendFlags};
use crate::message::Message;

/// Top 7 bytes of the 8-byte signal frame, in big-endian order.
const MAGIC: [u8; 7] = [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];

/// Send a single 8-byte frame: the 56-bit magic prefix followed by
/// `status` in the low byte.
pub fn signal(socket: &zmq::Socket, status: u8) -> Result<()> {
    let mut bytes = [0u8; 8];
    bytes[..7].copy_from_slice(&MAGIC);
    bytes[7] = status;
    Frame::new(bytes.to_vec()).send(socket, SendFlags::NONE)
}

/// Receive messages, discarding any that don't match the signal shape
/// (exactly one frame of exactly 8 bytes whose top 56 bits equal the
/// magic prefix), and return the low byte of the first that does.
/// Interruption/termination returns [`Error::Terminated`].
pub fn wait(socket: &zmq::Socket) -> Result<u8> {
    loop {
        let mut msg = Message::new();
        match msg.recv(socket) {
            Ok(()) => {}
            Err(Error::Zmq(zmq::Error::ETERM | zmq::Error::EINTR)) => {
                return Err(Error::Terminated)
            }
            Err(e) => return Err(e),
        }
        if msg.len() != 1 {
            continue;
        }
        let frame = msg.frames().next().expect("len checked above");
        let bytes = frame.as_bytes();
        if bytes.len() == 8 && bytes[..7] == MAGIC {
            return Ok(bytes[7]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn wait_ignores_non_matching_messages_then_returns_signal() {
        let ctx = Context::new();
        let (a, b, _ep) = ctx.inproc_pair().unwrap();

        a.send("noise", 0).unwrap();
        signal(&a, 42).unwrap();

        assert_eq!(wait(&b).unwrap(), 42);
    }

    #[test]
    fn wait_ignores_multiframe_noise() {
        let ctx = Context::new();
        let (a, b, _ep) = ctx.inproc_pair().unwrap();

        a.send("part1", zmq::SNDMORE).unwrap();
        a.send("part2", 0).unwrap();
        signal(&a, 7).unwrap();

        assert_eq!(wait(&b).unwrap(), 7);
    }
}
