//! An actor-driven bidirectional message switch, with an optional capture
//! tap and pause/resume. The forwarder variant additionally
//! preserves REQ/REP envelopes across a DEALER backend and accepts
//! `SUBSCRIBER`/`SETID` sub-commands.

use std::sync::Arc;

use qmq_core::{Actor, Context, Frame, Message, Result, SendFlags, SocketType};

use crate::poller::Poller;
use crate::socket::Socket;

/// Which variant of the switch is running: plain proxy, or forwarder
/// with envelope preservation and subscription/identity sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Proxy,
    Forwarder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Frontend,
    Backend,
}

/// A running proxy or forwarder actor. Drop stops it cleanly (see
/// [`qmq_core::Actor`]).
pub struct Proxy {
    actor: Actor,
}

impl Proxy {
    /// Spawn a plain proxy: forwards frontend ↔ backend verbatim.
    pub fn spawn(ctx: Arc<Context>) -> Result<Self> {
        let actor = Actor::spawn(&ctx.clone(), worker, (ctx, Kind::Proxy))?;
        Ok(Self { actor })
    }

    /// Spawn a forwarder: like [`Proxy::spawn`], but prepends an empty
    /// delimiter when forwarding frontend → a DEALER backend, and
    /// accepts `SUBSCRIBER`/`SETID` sub-commands.
    pub fn spawn_forwarder(ctx: Arc<Context>) -> Result<Self> {
        let actor = Actor::spawn(&ctx.clone(), worker, (ctx, Kind::Forwarder))?;
        Ok(Self { actor })
    }

    fn command(&self, mut msg: Message) -> Result<()> {
        self.actor.send(&mut msg)?;
        qmq_core::signal::wait(self.actor.pipe())?;
        Ok(())
    }

    /// `FRONTEND <type> <endpoint>`: create and attach the frontend
    /// (bound, serverish).
    pub fn frontend(&self, ty: SocketType, endpoint: &str) -> Result<()> {
        self.command(command3("FRONTEND", ty.as_str(), endpoint))
    }

    /// `BACKEND <type> <endpoint>`: create and attach the backend (bound,
    /// serverish).
    pub fn backend(&self, ty: SocketType, endpoint: &str) -> Result<()> {
        self.command(command3("BACKEND", ty.as_str(), endpoint))
    }

    /// `CAPTURE <endpoint>`: connect the capture PUSH socket.
    pub fn capture(&self, endpoint: &str) -> Result<()> {
        self.command(command2("CAPTURE", endpoint))
    }

    /// `PAUSE`: poll only the pipe.
    pub fn pause(&self) -> Result<()> {
        self.command(command1("PAUSE"))
    }

    /// `RESUME`: poll pipe + frontend + backend.
    pub fn resume(&self) -> Result<()> {
        self.command(command1("RESUME"))
    }

    /// `VERBOSE`: enable trace logging of switched frames.
    pub fn verbose(&self) -> Result<()> {
        self.command(command1("VERBOSE"))
    }

    /// Forwarder-only: add a PUB/SUB subscription on `side`.
    pub fn subscriber(&self, side_is_frontend: bool, topic: &str) -> Result<()> {
        let side = if side_is_frontend { "FRONTEND" } else { "BACKEND" };
        self.command(command3("SUBSCRIBER", side, topic))
    }

    /// Forwarder-only: set the DEALER identity on `side` before attach.
    pub fn setid(&self, side_is_frontend: bool, identity: &str) -> Result<()> {
        let side = if side_is_frontend { "FRONTEND" } else { "BACKEND" };
        self.command(command3("SETID", side, identity))
    }
}

fn command1(name: &str) -> Message {
    let mut m = Message::new();
    m.append(Frame::from_str(name));
    m
}

fn command2(name: &str, a: &str) -> Message {
    let mut m = command1(name);
    m.append(Frame::from_str(a));
    m
}

fn command3(name: &str, a: &str, b: &str) -> Message {
    let mut m = command2(name, a);
    m.append(Frame::from_str(b));
    m
}

fn parse_socket_type(name: &str) -> Option<SocketType> {
    Some(match name {
        "PAIR" => SocketType::Pair,
        "PUB" => SocketType::Pub,
        "SUB" => SocketType::Sub,
        "REQ" => SocketType::Req,
        "REP" => SocketType::Rep,
        "DEALER" => SocketType::Dealer,
        "ROUTER" => SocketType::Router,
        "PULL" => SocketType::Pull,
        "PUSH" => SocketType::Push,
        "XPUB" => SocketType::XPub,
        "XSUB" => SocketType::XSub,
        "STREAM" => SocketType::Stream,
        _ => return None,
    })
}

struct State {
    ctx: Arc<Context>,
    kind: Kind,
    frontend: Option<Socket>,
    backend: Option<Socket>,
    capture: Option<Socket>,
    paused: bool,
    verbose: bool,
}

impl State {
    fn side_socket(&self, side: Side) -> Option<&Socket> {
        match side {
            Side::Frontend => self.frontend.as_ref(),
            Side::Backend => self.backend.as_ref(),
        }
    }

    fn handle_command(&mut self, pipe: &zmq::Socket) -> bool {
        let mut msg = Message::new();
        if msg.recv(pipe).is_err() {
            return false;
        }
        let Some(cmd) = msg.popstr() else {
            return true;
        };
        match cmd.as_str() {
            "$TERM" => return false,
            "FRONTEND" | "BACKEND" => {
                let ty = msg.popstr().as_deref().and_then(parse_socket_type);
                let endpoint = msg.popstr();
                if let (Some(ty), Some(endpoint)) = (ty, endpoint) {
                    match Socket::new(&self.ctx, ty).and_then(|mut s| s.attach(&endpoint, true).map(|()| s)) {
                        Ok(sock) if cmd == "FRONTEND" => self.frontend = Some(sock),
                        Ok(sock) => self.backend = Some(sock),
                        Err(e) => tracing::warn!(error = %e, side = %cmd, "proxy: failed to attach"),
                    }
                }
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "CAPTURE" => {
                if let Some(endpoint) = msg.popstr() {
                    match Socket::new(&self.ctx, SocketType::Push).and_then(|mut s| s.connect(&endpoint).map(|()| s)) {
                        Ok(sock) => self.capture = Some(sock),
                        Err(e) => tracing::warn!(error = %e, "proxy: failed to connect capture"),
                    }
                }
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "PAUSE" => {
                self.paused = true;
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "RESUME" => {
                self.paused = false;
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "VERBOSE" => {
                self.verbose = true;
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "SUBSCRIBER" if self.kind == Kind::Forwarder => {
                let side = msg.popstr();
                let topic = msg.popstr().unwrap_or_default();
                let target = match side.as_deref() {
                    Some("FRONTEND") => self.side_socket(Side::Frontend),
                    Some("BACKEND") => self.side_socket(Side::Backend),
                    _ => None,
                };
                if let Some(sock) = target {
                    let _ = sock.raw().set_subscribe(topic.as_bytes());
                }
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            "SETID" if self.kind == Kind::Forwarder => {
                let side = msg.popstr();
                let identity = msg.popstr().unwrap_or_default();
                let target = match side.as_deref() {
                    Some("FRONTEND") => self.side_socket(Side::Frontend),
                    Some("BACKEND") => self.side_socket(Side::Backend),
                    _ => None,
                };
                if let Some(sock) = target {
                    let _ = sock.raw().set_identity(identity.as_bytes());
                }
                let _ = qmq_core::signal::signal(pipe, 0);
            }
            other => tracing::warn!(cmd = other, "proxy: unknown command"),
        }
        true
    }

    /// Forward every available frame from `from` to the other side,
    /// preserving `more`, duplicating to capture if attached.
    fn switch(&mut self, from: Side) {
        let (from_sock, to_sock) = match from {
            Side::Frontend => (self.frontend.as_ref(), self.backend.as_ref()),
            Side::Backend => (self.backend.as_ref(), self.frontend.as_ref()),
        };
        let (Some(from_sock), Some(to_sock)) = (from_sock, to_sock) else {
            return;
        };

        let needs_delimiter =
            self.kind == Kind::Forwarder && from == Side::Frontend && to_sock.socket_type() == SocketType::Dealer;

        let mut first = true;
        loop {
            let frame = match Frame::recv(from_sock.raw()) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "proxy: switch recv failed");
                    return;
                }
            };
            let more = frame.more();

            if first && needs_delimiter {
                let mut delim = Frame::empty();
                let _ = delim.send(to_sock.raw(), SendFlags { more: true, ..SendFlags::NONE });
            }
            first = false;

            if self.verbose {
                tracing::trace!(bytes = frame.len(), more, "proxy: switching frame");
            }

            if let Some(cap) = &self.capture {
                let mut copy = frame.clone();
                let _ = copy.send(cap.raw(), SendFlags { more, reuse: true, ..SendFlags::NONE });
            }

            let mut frame = frame;
            let _ = frame.send(to_sock.raw(), SendFlags { more, ..SendFlags::NONE });

            if !more {
                break;
            }
        }
    }
}

fn worker(pipe: zmq::Socket, args: (Arc<Context>, Kind)) {
    let (ctx, kind) = args;
    let mut state = State { ctx, kind, frontend: None, backend: None, capture: None, paused: false, verbose: false };

    let _ = qmq_core::signal::signal(&pipe, 0);

    loop {
        let side = {
            let mut poller = Poller::new();
            poller.add(&pipe);
            if !state.paused {
                if let Some(f) = &state.frontend {
                    poller.add(f.raw());
                }
                if let Some(b) = &state.backend {
                    poller.add(b.raw());
                }
            }
            match poller.wait(-1) {
                Ok(Some(ready)) => {
                    if std::ptr::eq(ready, &pipe) {
                        Some(None)
                    } else if state.frontend.as_ref().is_some_and(|f| std::ptr::eq(ready, f.raw())) {
                        Some(Some(Side::Frontend))
                    } else {
                        Some(Some(Side::Backend))
                    }
                }
                Ok(None) => {
                    if poller.terminated() {
                        break;
                    }
                    None
                }
                Err(_) => break,
            }
        };

        match side {
            Some(None) => {
                if !state.handle_command(&pipe) {
                    break;
                }
            }
            Some(Some(s)) => state.switch(s),
            None => continue,
        }
    }

    let _ = qmq_core::signal::signal(&pipe, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmq_core::Context as QmqContext;

    #[test]
    fn proxy_forwards_frames_preserving_order_and_more() {
        let ctx = Arc::new(QmqContext::new());
        let proxy = Proxy::spawn(ctx.clone()).unwrap();
        proxy.frontend(SocketType::Pull, "inproc://proxy-test-frontend").unwrap();
        proxy.backend(SocketType::Push, "inproc://proxy-test-backend").unwrap();

        let push = ctx.socket(SocketType::Push).unwrap();
        push.connect("inproc://proxy-test-frontend").unwrap();
        let pull = ctx.socket(SocketType::Pull).unwrap();
        pull.connect("inproc://proxy-test-backend").unwrap();

        push.send("Hello", zmq::SNDMORE).unwrap();
        push.send("World", 0).unwrap();

        let mut msg = Message::new();
        msg.recv(&pull).unwrap();
        assert_eq!(msg.len(), 2);
        assert_eq!(msg.frames().next().unwrap().as_str(), Some("Hello"));

        drop(proxy);
    }
}
