//! Process-wide or shadowed messaging context.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::config;
use crate::error::Result;
use crate::fatal::fatal;
use crate::socket_type::SocketType;

/// Defaults applied to every socket a [`Context`] creates.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    /// `ZMQ_SNDHWM`.
    pub sndhwm: i32,
    /// `ZMQ_RCVHWM`.
    pub rcvhwm: i32,
    /// `ZMQ_RCVHWM`/`ZMQ_SNDHWM` on the inproc pipe sockets actors spawn.
    pub pipehwm: i32,
    /// `ZMQ_LINGER`, milliseconds.
    pub linger: i32,
    /// `ZMQ_IPV6`.
    pub ipv6: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self { sndhwm: 1000, rcvhwm: 1000, pipehwm: 1000, linger: 0, ipv6: false }
    }
}

/// A process-wide or shadowed messaging context.
///
/// Owns the underlying library handle, the defaults applied to every
/// socket it creates, and (through the handle itself) the list of live
/// sockets — libzmq's own `zmq_ctx_destroy` already blocks until every
/// socket created on it is closed, honouring `LINGER`.
pub struct Context {
    inner: zmq::Context,
    defaults: RwLock<Defaults>,
    open_sockets: AtomicUsize,
    max_sockets: AtomicUsize,
    sockets_created: AtomicBool,
}

impl Context {
    /// A fresh context with library defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: zmq::Context::new(),
            defaults: RwLock::new(Defaults::default()),
            open_sockets: AtomicUsize::new(0),
            max_sockets: AtomicUsize::new(1024),
            sockets_created: AtomicBool::new(false),
        }
    }

    /// A context seeded from the `{prefix}*` environment variables.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        let ctx = Self::new();
        {
            let mut d = ctx.defaults.write();
            d.sndhwm = config::env_i32(prefix, "SNDHWM", d.sndhwm);
            d.rcvhwm = config::env_i32(prefix, "RCVHWM", d.rcvhwm);
            d.pipehwm = config::env_i32(prefix, "PIPEHWM", d.pipehwm);
            d.linger = config::env_i32(prefix, "LINGER", d.linger);
            d.ipv6 = config::env_bool(prefix, "IPV6", d.ipv6);
        }
        let io_threads = config::env_i32(prefix, "IO_THREADS", 1);
        let _ = ctx.inner.set_io_threads(io_threads);
        let max_sockets = config::env_i32(prefix, "MAX_SOCKETS", 1024);
        ctx.max_sockets.store(max_sockets.max(1) as usize, Ordering::Relaxed);
        let _ = ctx.inner.set_max_sockets(max_sockets);
        ctx
    }

    /// Current defaults snapshot.
    #[must_use]
    pub fn defaults(&self) -> Defaults {
        *self.defaults.read()
    }

    /// Set the default `SNDHWM`/`RCVHWM`/`PIPEHWM`/`LINGER`/`IPV6` applied
    /// to every socket created from now on.
    pub fn set_defaults(&self, defaults: Defaults) {
        *self.defaults.write() = defaults;
    }

    /// Configure IO threads. Only legal before the underlying library is
    /// initialized or while no sockets exist; reconfiguring
    /// afterwards is a programmer error.
    pub fn set_io_threads(&self, n: i32) -> Result<()> {
        if self.sockets_created.load(Ordering::Acquire) {
            fatal("Context::set_io_threads called after sockets were created");
        }
        self.inner.set_io_threads(n)?;
        Ok(())
    }

    /// Number of currently-open sockets created from this context.
    #[must_use]
    pub fn open_sockets(&self) -> usize {
        self.open_sockets.load(Ordering::Relaxed)
    }

    /// Create a socket of the given type with the context's current
    /// defaults applied.
    pub fn socket(&self, ty: SocketType) -> Result<zmq::Socket> {
        self.sockets_created.store(true, Ordering::Release);
        let sock = self.inner.socket(ty.to_zmq())?;
        let d = self.defaults();
        sock.set_sndhwm(d.sndhwm)?;
        sock.set_rcvhwm(d.rcvhwm)?;
        sock.set_linger(d.linger)?;
        sock.set_ipv6(d.ipv6)?;
        self.open_sockets.fetch_add(1, Ordering::Relaxed);
        Ok(sock)
    }

    /// Called by a socket wrapper on close/drop to keep the open count
    /// accurate.
    pub fn release_socket(&self) {
        self.open_sockets.fetch_sub(1, Ordering::Relaxed);
    }

    /// Create an inproc PAIR pipe bound via a uniformly random inproc
    /// endpoint: `(front, back, endpoint)`, `front` bound and `back`
    /// connected.
    pub fn inproc_pair(&self) -> Result<(zmq::Socket, zmq::Socket, String)> {
        let endpoint = format!("inproc://qmq-pipe-{:016x}", rand::random::<u64>());
        let front = self.socket(SocketType::Pair)?;
        front.bind(&endpoint)?;
        let back = self.socket(SocketType::Pair)?;
        back.connect(&endpoint)?;
        Ok((front, back, endpoint))
    }

    /// Borrow the underlying zmq context (for building sockets directly
    /// against, e.g. from higher layers that want to bypass defaults).
    #[must_use]
    pub fn raw(&self) -> &zmq::Context {
        &self.inner
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The singleton context (`QMNet` in the original source): lazily
/// constructed on first use from the un-prefixed environment variables.
static SINGLETON: Lazy<Context> = Lazy::new(|| Context::from_env(""));

/// Borrow the process-wide singleton context.
#[must_use]
pub fn global() -> &'static Context {
    &SINGLETON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inproc_pair_round_trips_a_byte() {
        let ctx = Context::new();
        let (front, back, _ep) = ctx.inproc_pair().unwrap();
        front.send("hi", 0).unwrap();
        assert_eq!(back.recv_string(0).unwrap().unwrap(), "hi");
    }

    #[test]
    fn socket_creation_increments_open_count() {
        let ctx = Context::new();
        assert_eq!(ctx.open_sockets(), 0);
        let _s = ctx.socket(SocketType::Pub).unwrap();
        assert_eq!(ctx.open_sockets(), 1);
    }
}
