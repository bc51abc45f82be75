//! A readiness multiplexer over a dynamic set of sockets.

use qmq_core::{Error, Result};

/// Maintains an ordered list of sockets and waits for the first one ready
/// to read.
///
/// The poll array is rebuilt lazily, only when the socket list changed
/// since the last [`Poller::wait`].
pub struct Poller<'a> {
    sockets: Vec<&'a zmq::Socket>,
    need_rebuild: bool,
    expired: bool,
    terminated: bool,
}

impl<'a> Poller<'a> {
    /// An empty poller.
    #[must_use]
    pub fn new() -> Self {
        Self { sockets: Vec::new(), need_rebuild: true, expired: false, terminated: false }
    }

    /// Add a socket to the watch list.
    pub fn add(&mut self, socket: &'a zmq::Socket) {
        self.sockets.push(socket);
        self.need_rebuild = true;
    }

    /// Remove a socket from the watch list, by identity.
    pub fn remove(&mut self, socket: &'a zmq::Socket) {
        self.sockets.retain(|s| !std::ptr::eq(*s, socket));
        self.need_rebuild = true;
    }

    /// Remove every socket. The next [`Poller::wait`] is reported as both
    /// expired and terminated.
    pub fn clear(&mut self) {
        self.sockets.clear();
        self.need_rebuild = false;
        self.expired = true;
        self.terminated = true;
    }

    /// True iff the last `wait` timed out with nothing ready.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.expired
    }

    /// True iff the last `wait` observed the underlying context shutting
    /// down.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Wait up to `timeout_ms` (or forever if negative) for one of the
    /// watched sockets to become readable. Returns the first ready socket,
    /// or `None` on an empty list, a timeout, or termination — check
    /// [`Poller::expired`]/[`Poller::terminated`] to distinguish the
    /// latter two.
    pub fn wait(&mut self, timeout_ms: i64) -> Result<Option<&'a zmq::Socket>> {
        if self.sockets.is_empty() {
            self.expired = true;
            self.terminated = false;
            return Ok(None);
        }

        let mut items: Vec<zmq::PollItem<'_>> = self.sockets.iter().map(|s| s.as_poll_item(zmq::POLLIN)).collect();
        self.need_rebuild = false;

        match zmq::poll(&mut items, timeout_ms) {
            Ok(0) => {
                self.expired = true;
                self.terminated = false;
                Ok(None)
            }
            Ok(_) => {
                self.expired = false;
                self.terminated = false;
                let ready = items
                    .iter()
                    .position(zmq::PollItem::is_readable)
                    .map(|idx| self.sockets[idx]);
                Ok(ready)
            }
            Err(zmq::Error::ETERM) => {
                self.expired = false;
                self.terminated = true;
                Ok(None)
            }
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl Default for Poller<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmq_core::{Context, SocketType};

    #[test]
    fn wait_returns_the_ready_socket() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair).unwrap();
        a.bind("inproc://poller-test").unwrap();
        let b = ctx.socket(SocketType::Pair).unwrap();
        b.connect("inproc://poller-test").unwrap();

        let mut poller = Poller::new();
        poller.add(&a);

        b.send("hi", 0).unwrap();
        let ready = poller.wait(1000).unwrap();
        assert!(ready.is_some());
        assert!(!poller.expired());
        assert!(!poller.terminated());
    }

    #[test]
    fn wait_on_empty_poller_reports_expired() {
        let mut poller: Poller<'_> = Poller::new();
        assert!(poller.wait(10).unwrap().is_none());
        assert!(poller.expired());
    }

    #[test]
    fn wait_times_out_when_nothing_ready() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair).unwrap();
        a.bind("inproc://poller-timeout-test").unwrap();
        let _b = ctx.socket(SocketType::Pair).unwrap();

        let mut poller = Poller::new();
        poller.add(&a);
        assert!(poller.wait(50).unwrap().is_none());
        assert!(poller.expired());
        assert!(!poller.terminated());
    }

    #[test]
    fn clear_marks_expired_and_terminated() {
        let mut poller: Poller<'_> = Poller::new();
        poller.clear();
        assert!(poller.expired());
        assert!(poller.terminated());
    }
}
