//! An actor that translates transport-level socket events into a
//! structured event stream on its pipe.
//!
//! Built directly on libzmq's native socket monitoring (`zmq_socket_monitor`):
//! a PAIR endpoint that receives a two-frame message per event — a 6-byte
//! event record (2-byte event id, 4-byte value, both native-endian) then
//! the affected address as a string frame.

use std::sync::Arc;

use qmq_core::{Actor, Context, Frame, Message, Result};

/// libzmq's `ZMQ_EVENT_*` constants, kept local rather than assumed from
/// the `zmq` crate's surface since monitoring is accessed through the
/// socket's raw `monitor()`/event-frame wire format, not a typed API.
mod raw_event {
    pub const CONNECTED: u16 = 1;
    pub const CONNECT_DELAYED: u16 = 1 << 1;
    pub const CONNECT_RETRIED: u16 = 1 << 2;
    pub const LISTENING: u16 = 1 << 3;
    pub const BIND_FAILED: u16 = 1 << 4;
    pub const ACCEPTED: u16 = 1 << 5;
    pub const ACCEPT_FAILED: u16 = 1 << 6;
    pub const CLOSED: u16 = 1 << 7;
    pub const CLOSE_FAILED: u16 = 1 << 8;
    pub const DISCONNECTED: u16 = 1 << 9;
    pub const MONITOR_STOPPED: u16 = 1 << 10;
    pub const ALL: u16 = 0xFFFF;
}

/// The event categories a monitor can be told to [`Monitor::listen`] for.
/// `All` unions every other variant into the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Connected,
    ConnectDelayed,
    ConnectRetried,
    Listening,
    BindFailed,
    Accepted,
    AcceptFailed,
    Closed,
    CloseFailed,
    Disconnected,
    MonitorStopped,
    All,
}

impl Event {
    fn bit(self) -> u16 {
        match self {
            Self::Connected => raw_event::CONNECTED,
            Self::ConnectDelayed => raw_event::CONNECT_DELAYED,
            Self::ConnectRetried => raw_event::CONNECT_RETRIED,
            Self::Listening => raw_event::LISTENING,
            Self::BindFailed => raw_event::BIND_FAILED,
            Self::Accepted => raw_event::ACCEPTED,
            Self::AcceptFailed => raw_event::ACCEPT_FAILED,
            Self::Closed => raw_event::CLOSED,
            Self::CloseFailed => raw_event::CLOSE_FAILED,
            Self::Disconnected => raw_event::DISCONNECTED,
            Self::MonitorStopped => raw_event::MONITOR_STOPPED,
            Self::All => raw_event::ALL,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::ConnectDelayed => "CONNECT_DELAYED",
            Self::ConnectRetried => "CONNECT_RETRIED",
            Self::Listening => "LISTENING",
            Self::BindFailed => "BIND_FAILED",
            Self::Accepted => "ACCEPTED",
            Self::AcceptFailed => "ACCEPT_FAILED",
            Self::Closed => "CLOSED",
            Self::CloseFailed => "CLOSE_FAILED",
            Self::Disconnected => "DISCONNECTED",
            Self::MonitorStopped => "MONITOR_STOPPED",
            Self::All => "ALL",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "CONNECTED" => Self::Connected,
            "CONNECT_DELAYED" => Self::ConnectDelayed,
            "CONNECT_RETRIED" => Self::ConnectRetried,
            "LISTENING" => Self::Listening,
            "BIND_FAILED" => Self::BindFailed,
            "ACCEPTED" => Self::Accepted,
            "ACCEPT_FAILED" => Self::AcceptFailed,
            "CLOSED" => Self::Closed,
            "CLOSE_FAILED" => Self::CloseFailed,
            "DISCONNECTED" => Self::Disconnected,
            "MONITOR_STOPPED" => Self::MonitorStopped,
            "ALL" => Self::All,
            _ => return None,
        })
    }

    fn from_bit(bit: u16) -> &'static str {
        match bit {
            raw_event::CONNECTED => "CONNECTED",
            raw_event::CONNECT_DELAYED => "CONNECT_DELAYED",
            raw_event::CONNECT_RETRIED => "CONNECT_RETRIED",
            raw_event::LISTENING => "LISTENING",
            raw_event::BIND_FAILED => "BIND_FAILED",
            raw_event::ACCEPTED => "ACCEPTED",
            raw_event::ACCEPT_FAILED => "ACCEPT_FAILED",
            raw_event::CLOSED => "CLOSED",
            raw_event::CLOSE_FAILED => "CLOSE_FAILED",
            raw_event::DISCONNECTED => "DISCONNECTED",
            raw_event::MONITOR_STOPPED => "MONITOR_STOPPED",
            _ => "UNKNOWN",
        }
    }
}

/// A running monitor actor. Drop stops it cleanly.
pub struct Monitor {
    actor: Actor,
}

impl Monitor {
    /// Spawn a monitor for `target`, which must already be bound or
    /// connected. `monitor_endpoint` is an inproc address private to this
    /// monitor/target pair.
    pub fn spawn(ctx: Arc<Context>, target: &zmq::Socket, monitor_endpoint: &str) -> Result<Self> {
        target.monitor(monitor_endpoint, i32::from(raw_event::ALL))?;
        let args = (ctx.clone(), monitor_endpoint.to_string());
        let actor = Actor::spawn(&ctx, worker, args)?;
        Ok(Self { actor })
    }

    /// The actor's control pipe — event triples (name, value, address)
    /// arrive here after [`Monitor::start`].
    #[must_use]
    pub fn pipe(&self) -> &zmq::Socket {
        self.actor.pipe()
    }

    fn command(&self, mut msg: Message) -> Result<()> {
        self.actor.send(&mut msg)?;
        qmq_core::signal::wait(self.actor.pipe())?;
        Ok(())
    }

    /// `LISTEN <event>+`: union the named events into the current mask.
    pub fn listen(&self, events: &[Event]) -> Result<()> {
        let mut msg = Message::new();
        msg.append(Frame::from_str("LISTEN"));
        for e in events {
            msg.append(Frame::from_str(e.name()));
        }
        self.command(msg)
    }

    /// `START`: begin reading and re-emitting events.
    pub fn start(&self) -> Result<()> {
        let mut msg = Message::new();
        msg.append(Frame::from_str("START"));
        self.command(msg)
    }

    /// `VERBOSE`: trace-log every forwarded event.
    pub fn verbose(&self) -> Result<()> {
        let mut msg = Message::new();
        msg.append(Frame::from_str("VERBOSE"));
        self.command(msg)
    }
}

fn worker(pipe: zmq::Socket, args: (Arc<Context>, String)) {
    let (ctx, monitor_endpoint) = args;
    let mut mask: u16 = 0;
    let mut verbose = false;
    let mut monitor_socket: Option<zmq::Socket> = None;

    let _ = qmq_core::signal::signal(&pipe, 0);

    loop {
        let target_readable = match &monitor_socket {
            Some(sock) => {
                let mut items = [pipe.as_poll_item(zmq::POLLIN), sock.as_poll_item(zmq::POLLIN)];
                match zmq::poll(&mut items, -1) {
                    Ok(_) => items[1].is_readable(),
                    Err(_) => break,
                }
            }
            None => {
                let mut items = [pipe.as_poll_item(zmq::POLLIN)];
                if zmq::poll(&mut items, -1).is_err() {
                    break;
                }
                false
            }
        };

        if target_readable {
            if let Some(sock) = &monitor_socket {
                if let Some((name, value, address)) = read_event(sock, mask) {
                    if verbose {
                        tracing::trace!(name, value, address = %address, "monitor event");
                    }
                    let mut out = Message::new();
                    out.append(Frame::from_str(name));
                    out.append(Frame::from_str(&value.to_string()));
                    out.append(Frame::from_str(&address));
                    let _ = out.send(&pipe);
                }
            }
            continue;
        }

        let mut msg = Message::new();
        if msg.recv(&pipe).is_err() {
            break;
        }
        let Some(cmd) = msg.popstr() else { continue };
        match cmd.as_str() {
            "$TERM" => break,
            "LISTEN" => {
                while let Some(name) = msg.popstr() {
                    if let Some(event) = Event::from_name(&name) {
                        mask |= event.bit();
                    }
                }
                let _ = qmq_core::signal::signal(&pipe, 0);
            }
            "START" => {
                match ctx.raw().socket(zmq::PAIR).and_then(|s| {
                    s.connect(&monitor_endpoint)?;
                    Ok(s)
                }) {
                    Ok(sock) => monitor_socket = Some(sock),
                    Err(e) => tracing::warn!(error = %e, "monitor: failed to connect monitor socket"),
                }
                let _ = qmq_core::signal::signal(&pipe, 0);
            }
            "VERBOSE" => {
                verbose = true;
                let _ = qmq_core::signal::signal(&pipe, 0);
            }
            other => tracing::warn!(cmd = other, "monitor: unknown command"),
        }
    }

    let _ = qmq_core::signal::signal(&pipe, 0);
}

/// Read and decode one event off the native zmq monitor socket, filtered
/// by `mask` (`0` means unfiltered). Returns `None` on a malformed event.
fn read_event(sock: &zmq::Socket, mask: u16) -> Option<(&'static str, u32, String)> {
    let event_msg = sock.recv_bytes(0).ok()?;
    let address_bytes = sock.recv_bytes(0).ok()?;
    if event_msg.len() < 6 {
        return None;
    }
    let id = u16::from_ne_bytes([event_msg[0], event_msg[1]]);
    let value = u32::from_ne_bytes([event_msg[2], event_msg[3], event_msg[4], event_msg[5]]);
    if mask != 0 && id & mask == 0 {
        return None;
    }
    let address = String::from_utf8_lossy(&address_bytes).into_owned();
    Some((Event::from_bit(id), value, address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmq_core::SocketType;

    #[test]
    fn listen_and_start_round_trip_an_accepted_event() {
        let ctx = Arc::new(Context::new());
        let target = ctx.socket(SocketType::Rep).unwrap();
        target.bind("inproc://monitor-test-target").unwrap();

        let monitor = Monitor::spawn(ctx.clone(), &target, "inproc://monitor-test-events").unwrap();
        monitor.listen(&[Event::Accepted]).unwrap();
        monitor.start().unwrap();

        let client = ctx.socket(SocketType::Req).unwrap();
        client.connect("inproc://monitor-test-target").unwrap();

        let mut msg = Message::new();
        msg.recv(monitor.pipe()).unwrap();
        assert_eq!(msg.len(), 3);
        assert_eq!(msg.frames().next().unwrap().as_str(), Some("ACCEPTED"));
    }
}
