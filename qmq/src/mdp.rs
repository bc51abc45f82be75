//! Majordomo-style service-oriented broker, worker, and client (spec
//! §4.K). Workers register for a service name with the broker; clients
//! send requests by service name and the broker round-robins them across
//! the service's waiting workers.
//!
//! Wire layout, worker ↔ broker (DEALER → ROUTER, so the broker's receive
//! gets the sender identity prepended automatically by the transport):
//! `["", "QMDPW0X", <command>, <command-specific frames...>]`.
//! Client ↔ broker: `["", "QMDPC01", <service>, <body...>]` outbound,
//! `["", "QMDPC01", REPORT|NAK, <service>, <body...>]` inbound.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qmq_core::{Actor, Context, Error, Frame, Message, Result, SocketType};
use qmq_net::{Poller, Socket};

const CLIENT_HEADER: &str = "QMDPC01";
const WORKER_HEADER: &str = "QMDPW0X";

const CLIENT_REPORT: &str = "REPORT";
const CLIENT_NAK: &str = "NAK";

const WORKER_READY: &str = "READY";
const WORKER_REQUEST: &str = "REQUEST";
const WORKER_REPORT: &str = "REPORT";
const WORKER_HEARTBEAT: &str = "HEARTBEAT";
const WORKER_DISCONNECT: &str = "DISCONNECT";

const MMI_PREFIX: &str = "mmi.";

/// Default heartbeat tick.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);
/// Default liveness factor: a worker that misses this many intervals is purged.
pub const HEARTBEAT_LIVENESS: u32 = 3;

// ---------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------

struct ServiceEntry {
    name: String,
    requests: VecDeque<Message>,
    waiting: VecDeque<String>,
    blacklist: std::collections::HashSet<String>,
}

impl ServiceEntry {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), requests: VecDeque::new(), waiting: VecDeque::new(), blacklist: Default::default() }
    }
}

struct WorkerEntry {
    identity: Frame,
    service: Option<String>,
    expiry: Instant,
}

struct BrokerState {
    router: Socket,
    heartbeat_interval: Duration,
    heartbeat_at: Instant,
    services: HashMap<String, ServiceEntry>,
    workers: HashMap<String, WorkerEntry>,
    waiting: VecDeque<String>,
    verbose: bool,
}

impl BrokerState {
    fn require_service(&mut self, name: &str) -> &mut ServiceEntry {
        self.services.entry(name.to_string()).or_insert_with(|| ServiceEntry::new(name))
    }

    fn send_to_worker(&mut self, identity: &Frame, command: &str, option: Option<Message>) {
        let mut msg = option.unwrap_or_default();
        msg.push(Frame::from_str(command));
        msg.push(Frame::from_str(WORKER_HEADER));
        msg.wrap(identity.clone());
        if let Err(e) = msg.send(self.router.raw()) {
            tracing::warn!(error = %e, "mdp broker: failed to send to worker");
        }
    }

    fn remove_worker(&mut self, id: &str, disconnect: bool) {
        if let Some(entry) = self.workers.remove(id) {
            if disconnect {
                self.send_to_worker(&entry.identity, WORKER_DISCONNECT, None);
            }
            if let Some(service_name) = &entry.service {
                if let Some(service) = self.services.get_mut(service_name) {
                    service.waiting.retain(|w| w != id);
                }
            }
        }
        self.waiting.retain(|w| w != id);
    }

    fn dispatch(&mut self, service_name: &str) {
        loop {
            let Some(service) = self.services.get_mut(service_name) else { return };
            if service.requests.is_empty() || service.waiting.is_empty() {
                return;
            }
            let worker_id = service.waiting.pop_front().unwrap();
            let request = service.requests.pop_front().unwrap();
            let Some(worker) = self.workers.get(&worker_id) else { continue };
            let identity = worker.identity.clone();
            self.send_to_worker(&identity, WORKER_REQUEST, Some(request));
            if let Some(service) = self.services.get_mut(service_name) {
                service.waiting.push_back(worker_id);
            }
        }
    }

    fn purge(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .waiting
            .iter()
            .take_while(|id| self.workers.get(*id).is_none_or(|w| w.expiry <= now))
            .cloned()
            .collect();
        for id in expired {
            if self.verbose {
                tracing::debug!(worker = %id, "mdp broker: deleting expired worker");
            }
            self.remove_worker(&id, false);
        }
    }

    fn worker_message(&mut self, sender: Frame, mut msg: Message) {
        let Some(command) = msg.popstr() else { return };
        let id = sender.hex_string();
        let already_ready = self.workers.contains_key(&id);

        match command.as_str() {
            WORKER_READY => {
                if already_ready {
                    self.remove_worker(&id, true);
                    return;
                }
                let Some(service_name) = msg.popstr() else { return };
                if service_name.starts_with(MMI_PREFIX) {
                    self.send_to_worker(&sender, WORKER_DISCONNECT, None);
                    return;
                }
                self.require_service(&service_name);
                self.workers.insert(
                    id.clone(),
                    WorkerEntry { identity: sender, service: Some(service_name.clone()), expiry: Instant::now() + self.heartbeat_interval * HEARTBEAT_LIVENESS },
                );
                self.waiting.push_back(id.clone());
                self.require_service(&service_name).waiting.push_back(id);
                self.dispatch(&service_name);
            }
            WORKER_REPORT if already_ready => {
                let Some(client) = msg.unwrap() else { return };
                let service_name = self.workers[&id].service.clone().unwrap_or_default();
                msg.push(Frame::from_str(&service_name));
                msg.push(Frame::from_str(CLIENT_REPORT));
                msg.push(Frame::from_str(CLIENT_HEADER));
                msg.wrap(client);
                if let Err(e) = msg.send(self.router.raw()) {
                    tracing::warn!(error = %e, "mdp broker: failed to forward report to client");
                }
            }
            WORKER_REPORT => self.remove_worker(&id, true),
            WORKER_HEARTBEAT if already_ready => {
                self.waiting.retain(|w| w != &id);
                self.waiting.push_back(id.clone());
                if let Some(entry) = self.workers.get_mut(&id) {
                    entry.expiry = Instant::now() + self.heartbeat_interval * HEARTBEAT_LIVENESS;
                }
            }
            WORKER_HEARTBEAT => self.remove_worker(&id, true),
            WORKER_DISCONNECT => self.remove_worker(&id, false),
            other => tracing::warn!(command = other, "mdp broker: invalid worker message"),
        }
    }

    fn mmi_reply(&mut self, service_name: &str, mut msg: Message) -> String {
        match service_name {
            "mmi.service" => {
                let name = msg.popstr().unwrap_or_default();
                match self.services.get(&name) {
                    Some(s) if !s.waiting.is_empty() => "200".to_string(),
                    _ => "404".to_string(),
                }
            }
            "mmi.filter" if msg.len() == 2 => {
                let operation = msg.popstr().unwrap_or_default();
                let target_service = msg.popstr().unwrap_or_default();
                let command = msg.popstr().unwrap_or_default();
                match operation.as_str() {
                    "enable" => {
                        self.require_service(&target_service).blacklist.remove(&command);
                        "200".to_string()
                    }
                    "disable" => {
                        self.require_service(&target_service).blacklist.insert(command);
                        "200".to_string()
                    }
                    _ => "400".to_string(),
                }
            }
            _ => "501".to_string(),
        }
    }

    fn client_message(&mut self, sender: Frame, mut msg: Message) {
        let Some(service_name) = msg.popstr() else { return };

        if service_name.starts_with(MMI_PREFIX) {
            let code = self.mmi_reply(&service_name, msg);
            let mut reply = Message::new();
            reply.push(Frame::from_str(&code));
            reply.push(Frame::from_str(&service_name));
            reply.push(Frame::from_str(CLIENT_REPORT));
            reply.push(Frame::from_str(CLIENT_HEADER));
            reply.wrap(sender);
            if let Err(e) = reply.send(self.router.raw()) {
                tracing::warn!(error = %e, "mdp broker: failed to answer mmi request");
            }
            return;
        }

        let blacklisted = msg
            .frames()
            .next()
            .and_then(Frame::as_str)
            .is_some_and(|cmd| self.services.get(&service_name).is_some_and(|s| s.blacklist.contains(cmd)));

        if blacklisted {
            let mut reply = Message::new();
            reply.push(Frame::from_str(&service_name));
            reply.push(Frame::from_str(CLIENT_NAK));
            reply.push(Frame::from_str(CLIENT_HEADER));
            reply.wrap(sender);
            if let Err(e) = reply.send(self.router.raw()) {
                tracing::warn!(error = %e, "mdp broker: failed to send nak");
            }
            return;
        }

        msg.wrap(sender);
        self.require_service(&service_name).requests.push_back(msg);
        self.dispatch(&service_name);
    }

    fn handle_incoming(&mut self) {
        let mut msg = Message::new();
        if msg.recv(self.router.raw()).is_err() {
            return;
        }
        let Some(sender) = msg.unwrap() else { return };
        let Some(header) = msg.popstr() else { return };
        match header.as_str() {
            h if h == CLIENT_HEADER => self.client_message(sender, msg),
            h if h == WORKER_HEADER => self.worker_message(sender, msg),
            other => tracing::warn!(header = other, "mdp broker: invalid message header"),
        }
    }
}

/// A running MDP broker. Stop via [`MdpBroker::stop`] or by dropping.
pub struct MdpBroker {
    ctx: Arc<Context>,
    router: Option<Socket>,
    actor: Option<Actor>,
    heartbeat_interval: Duration,
    verbose: bool,
}

impl MdpBroker {
    /// A broker bound to no endpoint yet; call [`MdpBroker::bind`] then
    /// [`MdpBroker::start`].
    pub fn new(ctx: Arc<Context>) -> Result<Self> {
        let router = Socket::new(&ctx, SocketType::Router)?;
        Ok(Self { ctx, router: Some(router), actor: None, heartbeat_interval: HEARTBEAT_INTERVAL, verbose: false })
    }

    /// Bind the broker's ROUTER socket. Must be called before [`MdpBroker::start`].
    pub fn bind(&mut self, endpoint: &str) -> Result<i32> {
        self.router.as_mut().expect("MdpBroker::bind called after start").bind(endpoint)
    }

    /// Override the default heartbeat interval.
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Enable trace-level logging of dispatch/purge activity.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Spawn the broker's run loop on its own thread.
    pub fn start(&mut self) -> Result<()> {
        let router = self.router.take().expect("MdpBroker::start called without a prior bind");
        let args = (router, self.heartbeat_interval, self.verbose);
        let actor = Actor::spawn(&self.ctx.clone(), broker_worker, args)?;
        self.actor = Some(actor);
        Ok(())
    }

    /// Stop the broker's thread.
    pub fn stop(&mut self) {
        self.actor = None;
    }
}

fn broker_worker(pipe: zmq::Socket, args: (Socket, Duration, bool)) {
    let (router, heartbeat_interval, verbose) = args;
    let mut state = BrokerState {
        router,
        heartbeat_interval,
        heartbeat_at: Instant::now() + heartbeat_interval,
        services: HashMap::new(),
        workers: HashMap::new(),
        waiting: VecDeque::new(),
        verbose,
    };

    let _ = qmq_core::signal::signal(&pipe, 0);

    loop {
        let timeout_ms = heartbeat_interval.as_millis().min(i64::MAX as u128) as i64;
        let ready = {
            let mut poller = Poller::new();
            poller.add(&pipe);
            poller.add(state.router.raw());
            match poller.wait(timeout_ms) {
                Ok(Some(sock)) => {
                    if std::ptr::eq(sock, &pipe) {
                        Some(true)
                    } else {
                        Some(false)
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

        match ready {
            Some(true) => {
                let mut msg = Message::new();
                if msg.recv(&pipe).is_err() || qmq_core::actor::is_term(&msg) {
                    break;
                }
            }
            Some(false) => state.handle_incoming(),
            None => {}
        }

        if Instant::now() >= state.heartbeat_at {
            state.purge();
            let waiting: Vec<Frame> = state
                .waiting
                .iter()
                .filter_map(|id| state.workers.get(id).map(|w| w.identity.clone()))
                .collect();
            for identity in waiting {
                state.send_to_worker(&identity, WORKER_HEARTBEAT, None);
            }
            state.heartbeat_at = Instant::now() + heartbeat_interval;
        }
    }

    let _ = qmq_core::signal::signal(&pipe, 0);
}

// ---------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------

/// The MDP worker-side client: registers for a service, then alternates
/// [`MdpWorker::recv`] / [`MdpWorker::send_reply`].
pub struct MdpWorker {
    socket: Socket,
    broker: String,
    service: String,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
    liveness: u32,
    heartbeat_at: Instant,
    verbose: bool,
}

impl MdpWorker {
    /// Create a worker for `service`, not yet connected.
    pub fn new(ctx: &Context, broker: &str, service: &str) -> Result<Self> {
        let mut socket = Socket::new(ctx, SocketType::Dealer)?;
        socket.connect(broker)?;
        let now = Instant::now();
        let mut worker = Self {
            socket,
            broker: broker.to_string(),
            service: service.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_interval: HEARTBEAT_INTERVAL,
            liveness: HEARTBEAT_LIVENESS,
            heartbeat_at: now,
            verbose: false,
        };
        worker.send_ready()?;
        Ok(worker)
    }

    /// Enable verbose tracing of protocol traffic.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn send_ready(&mut self) -> Result<()> {
        let mut msg = Message::new();
        msg.push(Frame::from_str(&self.service));
        msg.push(Frame::from_str(WORKER_READY));
        msg.push(Frame::from_str(WORKER_HEADER));
        msg.push(Frame::empty());
        msg.send(self.socket.raw())?;
        self.liveness = HEARTBEAT_LIVENESS;
        self.heartbeat_at = Instant::now() + self.heartbeat_interval;
        Ok(())
    }

    fn send_heartbeat(&mut self) -> Result<()> {
        let mut msg = Message::new();
        msg.push(Frame::from_str(WORKER_HEARTBEAT));
        msg.push(Frame::from_str(WORKER_HEADER));
        msg.push(Frame::empty());
        msg.send(self.socket.raw())
    }

    fn reconnect(&mut self) -> Result<()> {
        std::thread::sleep(self.reconnect_interval);
        self.socket.connect(&self.broker)?;
        self.send_ready()
    }

    /// Block (up to the heartbeat interval per poll) for a REQUEST from
    /// the broker. Returns `None` on heartbeat-only wakeups; callers
    /// should loop calling this until they get `Some`.
    pub fn recv(&mut self) -> Result<Option<Message>> {
        let mut poller = Poller::new();
        poller.add(self.socket.raw());
        let timeout_ms = self.heartbeat_interval.as_millis() as i64;
        let ready = poller.wait(timeout_ms)?;

        if ready.is_some() {
            let mut msg = Message::new();
            msg.recv(self.socket.raw())?;
            self.liveness = HEARTBEAT_LIVENESS;

            let _ = msg.popstr(); // delimiter
            let header = msg.popstr();
            if header.as_deref() != Some(WORKER_HEADER) {
                return Err(Error::protocol("mdp worker: bad header from broker"));
            }
            let command = msg.popstr().unwrap_or_default();
            match command.as_str() {
                WORKER_REQUEST => {
                    let reply_to = msg.unwrap().ok_or_else(|| Error::protocol("mdp worker: missing reply-to envelope"))?;
                    let mut request = msg;
                    request.prepend(reply_to);
                    return Ok(Some(request));
                }
                WORKER_HEARTBEAT => {}
                WORKER_DISCONNECT => self.reconnect()?,
                other => tracing::warn!(command = other, "mdp worker: invalid message from broker"),
            }
        } else {
            self.liveness = self.liveness.saturating_sub(1);
            if self.liveness == 0 {
                if self.verbose {
                    tracing::debug!("mdp worker: disconnected from broker, retrying");
                }
                self.reconnect()?;
            }
        }

        if Instant::now() >= self.heartbeat_at {
            self.send_heartbeat()?;
            self.heartbeat_at = Instant::now() + self.heartbeat_interval;
        }

        Ok(None)
    }

    /// Reply to the request last returned by [`MdpWorker::recv`]; `reply_to`
    /// is the leading frame `recv` prepended, `report` the response body.
    pub fn send_reply(&mut self, mut request: Message, mut report: Message) -> Result<()> {
        let reply_to = request.pop().ok_or_else(|| Error::protocol("mdp worker: empty request has no reply-to"))?;
        report.wrap(reply_to);
        report.push(Frame::from_str(WORKER_REPORT));
        report.push(Frame::from_str(WORKER_HEADER));
        report.push(Frame::empty());
        report.send(self.socket.raw())
    }
}

impl Drop for MdpWorker {
    fn drop(&mut self) {
        let mut msg = Message::new();
        msg.push(Frame::from_str(WORKER_DISCONNECT));
        msg.push(Frame::from_str(WORKER_HEADER));
        msg.push(Frame::empty());
        let _ = msg.send(self.socket.raw());
    }
}

// ---------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------

/// The MDP client-side API: request a service by name, receive `REPORT`
/// or `NAK`.
pub struct MdpClient {
    socket: Socket,
    verbose: bool,
}

impl MdpClient {
    /// Connect to `broker`.
    pub fn new(ctx: &Context, broker: &str) -> Result<Self> {
        let mut socket = Socket::new(ctx, SocketType::Dealer)?;
        socket.connect(broker)?;
        Ok(Self { socket, verbose: false })
    }

    /// Enable verbose tracing of protocol traffic.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Send `request` to `service`.
    pub fn send(&mut self, service: &str, mut request: Message) -> Result<()> {
        request.push(Frame::from_str(service));
        request.push(Frame::from_str(CLIENT_HEADER));
        request.push(Frame::empty());
        if self.verbose {
            tracing::trace!(service, "mdp client: sending request");
        }
        request.send(self.socket.raw())
    }

    /// Receive the broker's reply: `(REPORT|NAK, service, body)`.
    pub fn recv(&mut self) -> Result<(String, String, Message)> {
        let mut msg = Message::new();
        msg.recv(self.socket.raw())?;

        let _ = msg.popstr(); // delimiter
        let header = msg.popstr();
        if header.as_deref() != Some(CLIENT_HEADER) {
            return Err(Error::protocol("mdp client: bad header from broker"));
        }
        let command = msg.popstr().ok_or_else(|| Error::protocol("mdp client: missing command"))?;
        let service = msg.popstr().ok_or_else(|| Error::protocol("mdp client: missing service"))?;
        Ok((command, service, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_endpoint(ctx: &Context) -> (Socket, String) {
        let mut router = Socket::new(ctx, SocketType::Router).unwrap();
        router.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = router.endpoint().unwrap().to_string();
        (router, endpoint)
    }

    #[test]
    fn broker_round_trips_a_request_through_one_worker() {
        let ctx = Arc::new(Context::new());
        let (router, endpoint) = ephemeral_endpoint(&ctx);
        drop(router); // free the port, broker rebinds it below

        let mut broker = MdpBroker::new(ctx.clone()).unwrap();
        broker.set_heartbeat_interval(Duration::from_millis(200));
        broker.bind(&endpoint).unwrap();
        broker.start().unwrap();

        let mut worker = MdpWorker::new(&ctx, &endpoint, "echo").unwrap();
        let mut client = MdpClient::new(&ctx, &endpoint).unwrap();

        let mut req = Message::new();
        req.append(Frame::from_str("Hello world!"));
        client.send("echo", req).unwrap();

        let request = loop {
            if let Some(req) = worker.recv().unwrap() {
                break req;
            }
        };

        let mut report = Message::new();
        report.append(Frame::from_str("Hello world!"));
        worker.send_reply(request, report).unwrap();

        let (command, service, mut body) = client.recv().unwrap();
        assert_eq!(command, CLIENT_REPORT);
        assert_eq!(service, "echo");
        assert_eq!(body.popstr(), Some("Hello world!".to_string()));

        broker.stop();
    }

    #[test]
    fn mmi_service_reports_404_for_unknown_service() {
        let ctx = Arc::new(Context::new());
        let (router, endpoint) = ephemeral_endpoint(&ctx);
        drop(router);

        let mut broker = MdpBroker::new(ctx.clone()).unwrap();
        broker.bind(&endpoint).unwrap();
        broker.start().unwrap();

        let mut client = MdpClient::new(&ctx, &endpoint).unwrap();
        let mut req = Message::new();
        req.append(Frame::from_str("nonexistent"));
        client.send("mmi.service", req).unwrap();

        let (command, service, mut body) = client.recv().unwrap();
        assert_eq!(command, CLIENT_REPORT);
        assert_eq!(service, "mmi.service");
        assert_eq!(body.popstr(), Some("404".to_string()));

        broker.stop();
    }
}
