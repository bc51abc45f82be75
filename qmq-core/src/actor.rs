//! A worker thread paired with a bidirectional control pipe. The only
//! mechanism actors use to interact with their caller; no other shared
//! mutable state exists between the two sides.

use std::thread::{self, JoinHandle};

use crate::context::Context;
use crate::error::Result;
use crate::frame::{Frame, SendFlags};
use crate::message::Message;
use crate::signal;

/// The literal command a caller sends to stop an actor cleanly.
pub const TERM: &str = "$TERM";

/// A worker thread plus the caller-side half of its control pipe.
///
/// Dropping an `Actor` runs the termination protocol: send `$TERM` with a
/// zero send-timeout (so a dead worker can't stall the drop), wait for the
/// worker's terminal `signal(0)`, then join the thread.
pub struct Actor {
    pipe: zmq::Socket,
    handle: Option<JoinHandle<()>>,
}

impl Actor {
    /// Spawn `worker` on its own thread with a fresh PAIR pipe attached to
    /// `ctx`. Blocks until the worker calls `signal(0)` after its own
    /// initialization.
    pub fn spawn<F, A>(ctx: &Context, worker: F, args: A) -> Result<Self>
    where
        F: FnOnce(zmq::Socket, A) + Send + 'static,
        A: Send + 'static,
    {
        let (caller_pipe, worker_pipe, endpoint) = ctx.inproc_pair()?;
        let handle = thread::Builder::new()
            .name("qmq-actor".into())
            .spawn(move || worker(worker_pipe, args))?;

        tracing::debug!(endpoint, "actor spawned, waiting for init signal");
        signal::wait(&caller_pipe)?;

        Ok(Self { pipe: caller_pipe, handle: Some(handle) })
    }

    /// The caller-side control socket. Use this to send commands and
    /// receive replies/events from the worker.
    #[must_use]
    pub fn pipe(&self) -> &zmq::Socket {
        &self.pipe
    }

    /// Send a message to the worker over the pipe.
    pub fn send(&self, msg: &mut Message) -> Result<()> {
        msg.send(&self.pipe)
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        let _ = self.pipe.set_sndtimeo(0);

        let mut term = Message::new();
        term.append(Frame::from_str(TERM));
        if term.send(&self.pipe).is_ok() {
            let _ = signal::wait(&self.pipe);
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Helper for worker functions: true iff `msg` is a single-frame `$TERM`
/// command.
#[must_use]
pub fn is_term(msg: &Message) -> bool {
    msg.len() == 1 && msg.frames().next().and_then(Frame::as_str) == Some(TERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_actor_responds_and_terminates_cleanly() {
        fn worker(pipe: zmq::Socket, _args: ()) {
            signal::signal(&pipe, 0).unwrap();
            loop {
                let mut msg = Message::new();
                if msg.recv(&pipe).is_err() {
                    break;
                }
                if is_term(&msg) {
                    break;
                }
                let cmd = msg.popstr();
                if cmd.as_deref() == Some("ECHO") {
                    let _ = msg.send(&pipe);
                }
            }
            signal::signal(&pipe, 0).unwrap();
        }

        let ctx = Context::new();
        let actor = Actor::spawn(&ctx, worker, ()).unwrap();

        let mut req = Message::new();
        req.append(Frame::from_str("ECHO"));
        req.append(Frame::from_str("This is a string"));
        actor.send(&mut req).unwrap();

        let mut reply = Message::new();
        reply.recv(actor.pipe()).unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply.frames().next().unwrap().as_str(), Some("This is a string"));

        drop(actor);
    }
}
