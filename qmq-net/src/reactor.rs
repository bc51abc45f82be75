//! The long-lived event loop: readers, pollers, timers, tickets, tickless
//! wait, zombie-safe removal.
//!
//! A tickless timer-wheel reactor built from the same
//! `parking_lot`/`std::time` primitives already used by
//! [`qmq_core::context`]. One simplification from the source design:
//! the rebuild mutex also guards the poll call itself, so `append_*`
//! calls from another thread block for the duration of one iteration's
//! wait rather than interrupting it — `terminate()` is what wakes a
//! blocked iteration early, via a self-pipe.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use qmq_core::fatal::fatal;
use qmq_core::{Context, Error, Result};

/// Outcome of a reader/poller/timer handler: whether the loop should keep
/// running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep running.
    Continue,
    /// Stop the loop after this handler.
    Stop,
}

/// Handler for a readable socket registered via [`Reactor::append_reader`].
pub type ReaderFn = Box<dyn FnMut(&zmq::Socket) -> Result<Flow> + Send>;
/// Handler for a generic (socket, events) registration.
pub type PollFn = Box<dyn FnMut(&zmq::Socket, i16) -> Result<Flow> + Send>;
/// Handler fired when a timer's deadline passes.
pub type TimerFn = Box<dyn FnMut() -> Flow + Send>;
/// Handler fired when a ticket's sliding deadline passes. No stop
/// semantics: only timer and poll-slot handlers can stop the loop.
pub type TicketFn = Box<dyn FnMut() + Send>;

/// How many repeats remain for a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    Forever,
    Times(u32),
}

struct ReaderEntry {
    socket: zmq::Socket,
    handler: ReaderFn,
    tolerant: bool,
    strikes: u8,
}

struct PollEntry {
    socket: zmq::Socket,
    events: i16,
    handler: PollFn,
    tolerant: bool,
    strikes: u8,
}

struct TimerEntry {
    delay: Duration,
    repeat: Repeat,
    when: Instant,
    handler: TimerFn,
}

struct TicketEntry {
    id: u64,
    when: Instant,
    handler: TicketFn,
}

struct Inner {
    readers: Vec<ReaderEntry>,
    pollers: Vec<PollEntry>,
    timers: HashMap<u64, TimerEntry>,
    next_timer_id: u64,
    tickets: VecDeque<TicketEntry>,
    next_ticket_id: u64,
    ticket_delay: Duration,
    zombies: Vec<u64>,
    max_timers: usize,
}

/// A cooperative single-loop dispatcher. Cheaply [`Clone`]-able: every
/// clone shares the same state, which is how `append_*`/`abort`/
/// `terminate` can be called from any thread while `run` executes on its
/// own.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Mutex<Inner>>,
    terminated: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    verbose: Arc<AtomicBool>,
    wake_tx: Arc<Mutex<zmq::Socket>>,
}

const ONE_HOUR: Duration = Duration::from_secs(3600);

impl Reactor {
    /// A reactor with no readers/pollers/timers/tickets registered.
    pub fn new(ctx: &Context) -> Result<Self> {
        let (wake_tx, wake_rx, _endpoint) = ctx.inproc_pair()?;

        let inner = Inner {
            readers: Vec::new(),
            pollers: Vec::new(),
            timers: HashMap::new(),
            next_timer_id: 1,
            tickets: VecDeque::new(),
            next_ticket_id: 1,
            ticket_delay: Duration::from_secs(10),
            zombies: Vec::new(),
            max_timers: 10_000,
        };

        let reactor = Self {
            inner: Arc::new(Mutex::new(inner)),
            terminated: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            verbose: Arc::new(AtomicBool::new(false)),
            wake_tx: Arc::new(Mutex::new(wake_tx)),
        };

        reactor.inner.lock().readers.push(ReaderEntry {
            socket: wake_rx,
            handler: Box::new(|_s| Ok(Flow::Continue)),
            tolerant: true,
            strikes: 0,
        });

        Ok(reactor)
    }

    /// Enable verbose tracing of loop iterations.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Shared delay applied to every ticket.
    pub fn set_ticket_delay(&self, delay: Duration) {
        self.inner.lock().ticket_delay = delay;
    }

    /// Upper bound on the number of live timers; exceeding it is a
    /// programmer error.
    pub fn set_max_timers(&self, max: usize) {
        self.inner.lock().max_timers = max;
    }

    /// Register a socket to be polled for input; `handler` runs whenever
    /// it becomes readable.
    pub fn append_reader(&self, socket: zmq::Socket, handler: ReaderFn) {
        self.append_reader_inner(socket, handler, false);
    }

    /// Like [`Reactor::append_reader`], but a handler error never removes
    /// the reader (used for sockets expected to occasionally error, e.g.
    /// under load).
    pub fn append_reader_tolerant(&self, socket: zmq::Socket, handler: ReaderFn) {
        self.append_reader_inner(socket, handler, true);
    }

    fn append_reader_inner(&self, socket: zmq::Socket, handler: ReaderFn, tolerant: bool) {
        let mut inner = self.inner.lock();
        inner.readers.push(ReaderEntry { socket, handler, tolerant, strikes: 0 });
    }

    /// Register a (socket, events) item directly, for non-POLLIN
    /// interest such as `POLLOUT`.
    pub fn append_poller(&self, socket: zmq::Socket, events: i16, handler: PollFn) {
        let mut inner = self.inner.lock();
        inner.pollers.push(PollEntry { socket, events, handler, tolerant: false, strikes: 0 });
    }

    /// Register a timer firing every `delay` after first firing once at
    /// `delay` from now. `repeat = None` fires forever; `repeat =
    /// Some(n)` fires exactly `n` times then self-removes. Returns the
    /// timer id for [`Reactor::remove_timer`].
    pub fn append_timer(&self, delay: Duration, repeat: Option<u32>, handler: TimerFn) -> u64 {
        let mut inner = self.inner.lock();
        if inner.timers.len() >= inner.max_timers {
            fatal("reactor timer limit exceeded");
        }
        let id = inner.next_timer_id;
        inner.next_timer_id += 1;
        let repeat = match repeat {
            None => Repeat::Forever,
            Some(n) => Repeat::Times(n),
        };
        inner.timers.insert(id, TimerEntry { delay, repeat, when: Instant::now() + delay, handler });
        id
    }

    /// Remove a timer. If the loop is currently running this defers the
    /// removal to the end of the current iteration,
    /// so a timer can safely remove itself or another timer from within a
    /// handler.
    pub fn remove_timer(&self, id: u64) {
        let mut inner = self.inner.lock();
        if self.running.load(Ordering::Acquire) {
            inner.zombies.push(id);
        } else {
            inner.timers.remove(&id);
        }
    }

    /// Add a ticket at the tail of the queue with a fresh deadline
    /// `now + ticket_delay`. Returns the ticket id for
    /// [`Reactor::reset_ticket`].
    pub fn append_ticket(&self, handler: TicketFn) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_ticket_id;
        inner.next_ticket_id += 1;
        let when = Instant::now() + inner.ticket_delay;
        inner.tickets.push_back(TicketEntry { id, when, handler });
        id
    }

    /// Move a ticket back to the tail with a fresh deadline (amortised
    /// O(1) sliding idle timeout).
    pub fn reset_ticket(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.tickets.iter().position(|t| t.id == id) {
            let mut ticket = inner.tickets.remove(pos).expect("position just found");
            ticket.when = Instant::now() + inner.ticket_delay;
            inner.tickets.push_back(ticket);
        }
    }

    /// Stop the loop after the current iteration. Does not wake a
    /// blocked poll early; see [`Reactor::terminate`].
    pub fn abort(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Like [`Reactor::abort`], and additionally wakes an in-flight wait.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.lock().send("wake", zmq::DONTWAIT);
    }

    /// Run the loop on the calling thread until `abort`/`terminate` is
    /// called, a handler returns [`Flow::Stop`], or the underlying
    /// context is torn down.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self) -> Result<()> {
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Ok(());
            }
            if matches!(self.iterate()?, Flow::Stop) {
                return Ok(());
            }
            self.drain_zombies();
        }
    }

    fn drain_zombies(&self) {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner.zombies.drain(..).collect();
        for id in ids {
            inner.timers.remove(&id);
        }
    }

    fn compute_timeout(inner: &Inner, now: Instant) -> i64 {
        let earliest = inner
            .timers
            .values()
            .map(|t| t.when)
            .chain(inner.tickets.front().map(|t| t.when))
            .min();
        let remaining = match earliest {
            Some(when) => when.saturating_duration_since(now),
            None => ONE_HOUR,
        };
        remaining.as_millis().min(i64::MAX as u128) as i64
    }

    /// One iteration: rebuild (implicitly, every iteration — the mutex
    /// makes a separate dirty flag unnecessary), poll, fire due timers in
    /// deadline order, fire due tickets, demux ready slots, verbose-log
    /// if enabled.
    fn iterate(&self) -> Result<Flow> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let timeout = Self::compute_timeout(&inner, now);
        if self.verbose.load(Ordering::Relaxed) {
            tracing::trace!(timeout_ms = timeout, readers = inner.readers.len(), pollers = inner.pollers.len(), "reactor poll");
        }

        let reader_count = inner.readers.len();
        let mut items: Vec<zmq::PollItem<'_>> = Vec::with_capacity(reader_count + inner.pollers.len());
        for r in &inner.readers {
            items.push(r.socket.as_poll_item(zmq::POLLIN));
        }
        for p in &inner.pollers {
            items.push(p.socket.as_poll_item(p.events));
        }

        let poll_result = zmq::poll(&mut items, timeout);
        let readable: Vec<bool> = items.iter().map(zmq::PollItem::is_readable).collect();
        drop(items);

        match poll_result {
            Ok(_) => {}
            Err(zmq::Error::ETERM) => {
                self.terminated.store(true, Ordering::SeqCst);
                return Ok(Flow::Stop);
            }
            Err(e) => return Err(Error::from(e)),
        }

        let now = Instant::now();
        if matches!(self.fire_timers(&mut inner, now), Flow::Stop) {
            return Ok(Flow::Stop);
        }
        self.fire_tickets(&mut inner, now);
        self.dispatch_ready(&mut inner, reader_count, &readable)
    }

    fn fire_timers(&self, inner: &mut Inner, now: Instant) -> Flow {
        let mut due: Vec<u64> = inner.timers.iter().filter(|(_, t)| t.when <= now).map(|(id, _)| *id).collect();
        due.sort_by_key(|id| inner.timers[id].when);

        for id in due {
            let Some(entry) = inner.timers.get_mut(&id) else {
                continue; // removed by an earlier handler in this same batch
            };
            if matches!((entry.handler)(), Flow::Stop) {
                return Flow::Stop;
            }
            let Some(entry) = inner.timers.get_mut(&id) else {
                continue; // the handler removed itself
            };
            match entry.repeat {
                Repeat::Forever => entry.when += entry.delay,
                Repeat::Times(1) => {
                    inner.timers.remove(&id);
                }
                Repeat::Times(n) => {
                    entry.repeat = Repeat::Times(n - 1);
                    entry.when += entry.delay;
                }
            }
        }
        Flow::Continue
    }

    fn fire_tickets(&self, inner: &mut Inner, now: Instant) {
        let mut due = Vec::new();
        while matches!(inner.tickets.front(), Some(t) if t.when <= now) {
            due.push(inner.tickets.pop_front().expect("front checked above"));
        }
        for mut ticket in due {
            (ticket.handler)();
        }
    }

    fn dispatch_ready(&self, inner: &mut Inner, reader_count: usize, readable: &[bool]) -> Result<Flow> {
        let mut remove_readers = Vec::new();
        for (idx, &is_ready) in readable.iter().enumerate().take(reader_count) {
            if !is_ready {
                continue;
            }
            let entry = &mut inner.readers[idx];
            match (entry.handler)(&entry.socket) {
                Ok(Flow::Stop) => return Ok(Flow::Stop),
                Ok(Flow::Continue) => entry.strikes = 0,
                Err(e) => {
                    tracing::warn!(error = %e, "reactor reader error");
                    if entry.tolerant {
                        continue;
                    }
                    entry.strikes += 1;
                    if entry.strikes >= 2 {
                        remove_readers.push(idx);
                    }
                }
            }
        }
        for idx in remove_readers.into_iter().rev() {
            inner.readers.remove(idx);
        }

        let mut remove_pollers = Vec::new();
        for (slot, &is_ready) in readable.iter().enumerate().skip(reader_count) {
            if !is_ready {
                continue;
            }
            let idx = slot - reader_count;
            let entry = &mut inner.pollers[idx];
            match (entry.handler)(&entry.socket, entry.events) {
                Ok(Flow::Stop) => return Ok(Flow::Stop),
                Ok(Flow::Continue) => entry.strikes = 0,
                Err(e) => {
                    tracing::warn!(error = %e, "reactor poller error");
                    if entry.tolerant {
                        continue;
                    }
                    entry.strikes += 1;
                    if entry.strikes >= 2 {
                        remove_pollers.push(idx);
                    }
                }
            }
        }
        for idx in remove_pollers.into_iter().rev() {
            inner.pollers.remove(idx);
        }

        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn terminate_stops_a_blocked_run() {
        let ctx = Context::new();
        let reactor = Reactor::new(&ctx).unwrap();

        let handle = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.run())
        };

        thread::sleep(Duration::from_millis(20));
        reactor.terminate();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let ctx = Context::new();
        let reactor = Reactor::new(&ctx).unwrap();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        reactor.append_timer(Duration::from_millis(10), Some(1), Box::new(move || {
            tx1.send(1).unwrap();
            Flow::Continue
        }));
        let tx2 = tx.clone();
        reactor.append_timer(Duration::from_millis(30), Some(1), Box::new(move || {
            tx2.send(2).unwrap();
            Flow::Stop
        }));

        reactor.run().unwrap();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn reader_delivers_message_and_can_stop_loop() {
        let ctx = Context::new();
        let a = ctx.socket(qmq_core::SocketType::Pair).unwrap();
        a.bind("inproc://reactor-reader-test").unwrap();
        let b = ctx.socket(qmq_core::SocketType::Pair).unwrap();
        b.connect("inproc://reactor-reader-test").unwrap();

        let reactor = Reactor::new(&ctx).unwrap();
        reactor.append_reader(a, Box::new(|socket| {
            let _ = socket.recv_bytes(0)?;
            Ok(Flow::Stop)
        }));

        b.send("hi", 0).unwrap();
        reactor.run().unwrap();
    }

    #[test]
    fn reset_ticket_moves_it_to_the_tail() {
        let ctx = Context::new();
        let reactor = Reactor::new(&ctx).unwrap();
        reactor.set_ticket_delay(Duration::from_millis(30));

        let (tx, rx) = mpsc::channel();
        let id = reactor.append_ticket(Box::new(move || tx.send(()).unwrap()));
        reactor.reset_ticket(id);

        let started = Instant::now();
        reactor.append_timer(Duration::from_millis(40), Some(1), Box::new(|| Flow::Stop));
        reactor.run().unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
