//! A higher-level broker that, unlike the MDP broker's single-service
//! round robin, registers clients and workers independently and keeps
//! them live with a separate PUB ping / ROUTER pong heartbeat channel
//!.
//!
//! Five sockets: registrar (ROUTER, client/worker registration and
//! commands), ping (PUB, liveness broadcast), pong (ROUTER, worker
//! liveness replies), monitor (SUB, an aggregation point for monitor
//! events forwarded by other components), notifier (PUB, client
//! notification bus). Registrar wire layout:
//! `["", <SRCL010|SRWO010>, "<address>%<display-name>", "<code>-<value>"]`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qmq_core::{Actor, Context, Frame, Message, Result, SocketType};
use qmq_net::{Poller, Proxy, Socket};

const CLIENT_HEADER: &str = "SRCL010";
const WORKER_HEADER: &str = "SRWO010";

/// Client registration request: first contact, assigns the notifier port.
pub const CMD_REQ: i32 = 1;
/// Worker registration request: assigns ping/pong ports, hub id, worker id.
pub const CMD_REG: i32 = 4;
/// Client/worker lifecycle notice, e.g. `"Disconnected"`.
pub const CMD_STATE: i32 = 5;

/// Default heartbeat tick.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
/// Default liveness credits before a silent worker is purged.
pub const WORKER_LIVENESS: u32 = 2;

struct ClientEntry {
    #[allow(dead_code)]
    address: String,
    name: String,
}

struct WorkerEntry {
    #[allow(dead_code)]
    address: String,
    name: String,
    expiry: Instant,
    liveness: u32,
}

struct HubState {
    hub_id: String,
    registrar: Socket,
    ping: Socket,
    pong: Socket,
    #[allow(dead_code)]
    monitor: Socket,
    notifier: Socket,
    ping_port: i32,
    pong_port: i32,
    heartbeat_interval: Duration,
    default_liveness: u32,
    heartbeat_at: Instant,
    clients: HashMap<String, ClientEntry>,
    workers: HashMap<String, WorkerEntry>,
    verbose: bool,
}

impl HubState {
    fn notify(&self, text: &str) {
        let mut msg = Message::new();
        msg.push(Frame::from_str(text));
        msg.push(Frame::from_str(&self.hub_id));
        if let Err(e) = msg.send(self.notifier.raw()) {
            tracing::warn!(error = %e, "hub: failed to publish notification");
        }
    }

    fn remove_client(&mut self, id: &str) {
        self.clients.remove(id);
    }

    fn remove_worker(&mut self, id: &str) {
        if let Some(w) = self.workers.remove(id) {
            self.notify(&format!("disconnected Worker: {} | Worker State: lost", w.name));
        }
    }

    fn purge(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .workers
            .iter_mut()
            .filter_map(|(id, w)| {
                if w.expiry > now {
                    return None;
                }
                if w.liveness == 0 {
                    Some(id.clone())
                } else {
                    w.liveness -= 1;
                    None
                }
            })
            .collect();
        for id in expired {
            if self.verbose {
                tracing::debug!(worker = %id, "hub: purging expired worker");
            }
            self.remove_worker(&id);
        }
    }

    fn pub_ping(&self) {
        let mut msg = Message::new();
        msg.push(Frame::from_str("Ping"));
        msg.push(Frame::from_str(&self.hub_id));
        if let Err(e) = msg.send(self.ping.raw()) {
            tracing::warn!(error = %e, "hub: failed to publish ping");
        }
    }

    /// `SRCL010` registration/state messages from clients.
    fn client_message(&mut self, sender: Frame, info: &str, command: &str) {
        let mut parts = info.splitn(2, '%');
        let (Some(address), Some(name)) = (parts.next(), parts.next()) else {
            tracing::warn!(info, "hub: malformed client sender info");
            return;
        };
        let id = sender.hex_string();

        let mut cmd = command.splitn(2, '-');
        let Some(code) = cmd.next().and_then(|c| c.parse::<i32>().ok()) else {
            tracing::warn!(command, "hub: malformed client command");
            return;
        };
        let value = cmd.next().unwrap_or_default();

        if !self.clients.contains_key(&id) && code == CMD_REQ {
            let mut reply = Message::new();
            reply.push(Frame::from_str(&self.notifier.endpoint().map(port_of).unwrap_or_default()));
            reply.push(Frame::from_str(&CMD_REQ.to_string()));
            reply.push(Frame::from_str(CLIENT_HEADER));
            reply.wrap(sender);
            if let Err(e) = reply.send(self.registrar.raw()) {
                tracing::warn!(error = %e, "hub: failed to reply to client registration");
            }
            self.clients.insert(id, ClientEntry { address: address.to_string(), name: name.to_string() });
            return;
        }

        if code == CMD_STATE && value == "Disconnected" {
            self.remove_client(&id);
        }
    }

    /// `SRWO010` registration messages from workers.
    fn worker_message(&mut self, sender: Frame, info: &str, command: &str) {
        let mut parts = info.splitn(2, '%');
        let (Some(address), Some(name)) = (parts.next(), parts.next()) else {
            tracing::warn!(info, "hub: malformed worker sender info");
            return;
        };
        let id = sender.hex_string();

        let mut cmd = command.splitn(2, '-');
        let Some(code) = cmd.next().and_then(|c| c.parse::<i32>().ok()) else {
            tracing::warn!(command, "hub: malformed worker command");
            return;
        };

        if code == CMD_REG {
            let mut reply = Message::new();
            reply.push(Frame::from_str(&id));
            reply.push(Frame::from_str(&self.hub_id));
            reply.push(Frame::from_str(&self.ping_port.to_string()));
            reply.push(Frame::from_str(&self.pong_port.to_string()));
            reply.push(Frame::from_str(&CMD_REG.to_string()));
            reply.push(Frame::from_str(WORKER_HEADER));
            reply.wrap(sender);
            if let Err(e) = reply.send(self.registrar.raw()) {
                tracing::warn!(error = %e, "hub: failed to reply to worker registration");
            }
            self.notify(&format!("Connected Worker: {name} | Worker State: avail"));
        }

        if self.workers.is_empty() {
            self.heartbeat_at = Instant::now() + self.heartbeat_interval;
        }
        self.workers.entry(id).or_insert_with(|| WorkerEntry {
            address: address.to_string(),
            name: name.to_string(),
            expiry: Instant::now() + self.heartbeat_interval,
            liveness: self.default_liveness,
        });
    }

    fn handle_registrar(&mut self) {
        let mut msg = Message::new();
        if msg.recv(self.registrar.raw()).is_err() {
            return;
        }
        let Some(sender) = msg.unwrap() else { return };
        let Some(header) = msg.popstr() else { return };
        let Some(info) = msg.popstr() else { return };
        let Some(command) = msg.popstr() else { return };
        match header.as_str() {
            h if h == CLIENT_HEADER => self.client_message(sender, &info, &command),
            h if h == WORKER_HEADER => self.worker_message(sender, &info, &command),
            other => tracing::warn!(header = other, "hub: invalid registrar message"),
        }
    }

    /// Worker pongs: `["", <hub-id>, "Ping"]`, identity carried by the DEALER.
    fn handle_pong(&mut self) {
        let mut msg = Message::new();
        if msg.recv(self.pong.raw()).is_err() {
            return;
        }
        let Some(identity) = msg.unwrap() else { return };
        let Some(hub_id) = msg.popstr() else { return };
        if hub_id != self.hub_id {
            return;
        }
        let Some(tag) = msg.popstr() else { return };
        if tag != "Ping" {
            return;
        }
        let Some(id) = identity.as_str() else { return };
        if let Some(w) = self.workers.get_mut(id) {
            w.expiry = Instant::now() + self.heartbeat_interval;
            w.liveness = self.default_liveness;
        }
    }
}

fn port_of(endpoint: &str) -> String {
    endpoint.rsplit(':').next().unwrap_or_default().to_string()
}

/// A running Hub. Drop stops it cleanly.
pub struct Hub {
    actor: Actor,
    hub_id: String,
    registrar_port: i32,
    ping_port: i32,
    pong_port: i32,
    monitor_port: i32,
    notifier_port: i32,
}

impl Hub {
    /// Bind all five sockets (ephemeral, starting at port 5000) and spawn
    /// the hub's run loop.
    pub fn spawn(ctx: &Arc<Context>) -> Result<Self> {
        let mut registrar = Socket::new(ctx, SocketType::Router)?;
        let registrar_port = registrar.bind("tcp://*:*[5000-]")?;

        let mut ping = Socket::new(ctx, SocketType::Pub)?;
        let ping_port = ping.bind(&format!("tcp://*:*[{registrar_port}-]"))?;

        let mut pong = Socket::new(ctx, SocketType::Router)?;
        let pong_port = pong.bind(&format!("tcp://*:*[{ping_port}-]"))?;

        let mut monitor = Socket::new(ctx, SocketType::Sub)?;
        let monitor_port = monitor.bind(&format!("tcp://*:*[{pong_port}-]"))?;
        monitor.raw().set_subscribe(b"")?;

        let mut notifier = Socket::new(ctx, SocketType::Pub)?;
        let notifier_port = notifier.bind(&format!("tcp://*:*[{monitor_port}-]"))?;

        let hub_id = format!("hub1:{registrar_port}");

        let state = HubState {
            hub_id: hub_id.clone(),
            registrar,
            ping,
            pong,
            monitor,
            notifier,
            ping_port,
            pong_port,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            default_liveness: WORKER_LIVENESS,
            heartbeat_at: Instant::now() + HEARTBEAT_INTERVAL,
            clients: HashMap::new(),
            workers: HashMap::new(),
            verbose: false,
        };

        let actor = Actor::spawn(ctx, worker, state)?;
        Ok(Self { actor, hub_id, registrar_port, ping_port, pong_port, monitor_port, notifier_port })
    }

    /// The hub's unique id, broadcast on every ping (`"hub1:<registrar-port>"`).
    #[must_use]
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    #[must_use]
    pub fn registrar_port(&self) -> i32 {
        self.registrar_port
    }

    #[must_use]
    pub fn ping_port(&self) -> i32 {
        self.ping_port
    }

    #[must_use]
    pub fn pong_port(&self) -> i32 {
        self.pong_port
    }

    #[must_use]
    pub fn monitor_port(&self) -> i32 {
        self.monitor_port
    }

    #[must_use]
    pub fn notifier_port(&self) -> i32 {
        self.notifier_port
    }

    /// Enable trace-level logging of registration/purge activity.
    pub fn verbose(&self) -> Result<()> {
        let mut msg = Message::new();
        msg.append(Frame::from_str("VERBOSE"));
        self.actor.send(&mut msg)?;
        qmq_core::signal::wait(self.actor.pipe())?;
        Ok(())
    }
}

fn worker(pipe: zmq::Socket, mut state: HubState) {
    let _ = qmq_core::signal::signal(&pipe, 0);

    loop {
        let timeout_ms = state.heartbeat_interval.as_millis().min(i64::MAX as u128) as i64;
        let ready = {
            let mut poller = Poller::new();
            poller.add(&pipe);
            poller.add(state.registrar.raw());
            poller.add(state.pong.raw());
            match poller.wait(timeout_ms) {
                Ok(Some(sock)) => {
                    if std::ptr::eq(sock, &pipe) {
                        Some(0u8)
                    } else if std::ptr::eq(sock, state.registrar.raw()) {
                        Some(1u8)
                    } else {
                        Some(2u8)
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
            Some(0) => {
                let mut msg = Message::new();
                if msg.recv(&pipe).is_err() || qmq_core::actor::is_term(&msg) {
                    break;
                }
                if msg.popstr().as_deref() == Some("VERBOSE") {
                    state.verbose = true;
                }
                let _ = qmq_core::signal::signal(&pipe, 0);
            }
            Some(1) => state.handle_registrar(),
            Some(2) => state.handle_pong(),
            _ => {}
        }

        if Instant::now() >= state.heartbeat_at {
            state.purge();
            state.pub_ping();
            state.heartbeat_at = Instant::now() + state.heartbeat_interval;
        }
    }

    let _ = qmq_core::signal::signal(&pipe, 0);
}

// ---------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------

/// A Hub client: registers, learns the notifier port, and can be torn
/// down cleanly (sends `CMD_STATE "Disconnected"` on drop).
pub struct HubClient {
    socket: Socket,
    notifier_port: i32,
}

impl HubClient {
    /// Connect to `hub_endpoint` and register under `name`.
    pub fn register(ctx: &Context, hub_endpoint: &str, name: &str) -> Result<Self> {
        let mut socket = Socket::new(ctx, SocketType::Dealer)?;
        socket.connect(hub_endpoint)?;

        send_registration(&socket, CLIENT_HEADER, name, CMD_REQ, "")?;

        let mut msg = Message::new();
        msg.recv(socket.raw())?;
        let _ = msg.popstr(); // delimiter
        let header = msg.popstr();
        if header.as_deref() != Some(CLIENT_HEADER) {
            return Err(qmq_core::Error::protocol("hub client: bad header from hub"));
        }
        let _command = msg.popstr();
        let notifier_port = msg.popstr().and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(Self { socket, notifier_port })
    }

    /// The notifier PUB port learned at registration; subscribe here for
    /// client/worker lifecycle broadcasts.
    #[must_use]
    pub fn notifier_port(&self) -> i32 {
        self.notifier_port
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        let _ = send_registration(&self.socket, CLIENT_HEADER, "", CMD_STATE, "Disconnected");
    }
}

fn send_registration(socket: &Socket, header: &str, name: &str, code: i32, value: &str) -> Result<()> {
    let mut msg = Message::new();
    msg.push(Frame::from_str(&format!("{code}-{value}")));
    msg.push(Frame::from_str(&format!("127.0.0.1%{name}")));
    msg.push(Frame::from_str(header));
    msg.push(Frame::empty());
    msg.send(socket.raw())
}

// ---------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------

/// A Hub worker: registers, then runs an independent heartbeat forwarder
/// (a SUB on ping filtered by hub id, a DEALER on pong identified by the
/// worker id the hub assigned).
pub struct HubWorker {
    #[allow(dead_code)]
    socket: Socket,
    forwarder: Proxy,
    hub_id: String,
    worker_id: String,
}

impl HubWorker {
    /// Connect to `hub_endpoint`, register under `name`, and start the
    /// heartbeat forwarder.
    pub fn register(ctx: Arc<Context>, hub_endpoint: &str, name: &str) -> Result<Self> {
        let mut socket = Socket::new(&ctx, SocketType::Dealer)?;
        socket.connect(hub_endpoint)?;

        send_registration(&socket, WORKER_HEADER, name, CMD_REG, "")?;

        let mut msg = Message::new();
        msg.recv(socket.raw())?;
        let _ = msg.popstr(); // delimiter
        let header = msg.popstr();
        if header.as_deref() != Some(WORKER_HEADER) {
            return Err(qmq_core::Error::protocol("hub worker: bad header from hub"));
        }
        let _command = msg.popstr();
        let ping_port: i32 = msg.popstr().and_then(|s| s.parse().ok()).unwrap_or(0);
        let pong_port: i32 = msg.popstr().and_then(|s| s.parse().ok()).unwrap_or(0);
        let hub_id = msg.popstr().unwrap_or_default();
        let worker_id = msg.popstr().unwrap_or_default();

        let host = hub_endpoint.rsplit_once(':').map(|(host, _)| host).unwrap_or(hub_endpoint);
        let ping_endpoint = format!(">{host}:{ping_port}");
        let pong_endpoint = format!(">{host}:{pong_port}");

        let forwarder = Proxy::spawn_forwarder(ctx)?;
        forwarder.frontend(SocketType::Sub, &ping_endpoint)?;
        forwarder.subscriber(true, &hub_id)?;
        forwarder.backend(SocketType::Dealer, &pong_endpoint)?;
        forwarder.setid(false, &worker_id)?;

        Ok(Self { socket, forwarder, hub_id, worker_id })
    }

    /// The hub id this worker registered with.
    #[must_use]
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// The identity the hub assigned this worker.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop relaying pings to pongs without disconnecting.
    pub fn pause_heartbeat(&self) -> Result<()> {
        self.forwarder.pause()
    }

    /// Resume relaying pings to pongs.
    pub fn resume_heartbeat(&self) -> Result<()> {
        self.forwarder.resume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_assigns_ports_in_ascending_order() {
        let ctx = Arc::new(Context::new());
        let hub = Hub::spawn(&ctx).unwrap();
        assert!(hub.ping_port() >= hub.registrar_port());
        assert!(hub.pong_port() >= hub.ping_port());
        assert!(hub.monitor_port() >= hub.pong_port());
        assert!(hub.notifier_port() >= hub.monitor_port());
        assert_eq!(hub.hub_id(), format!("hub1:{}", hub.registrar_port()));
    }

    #[test]
    fn client_registers_and_learns_notifier_port() {
        let ctx = Arc::new(Context::new());
        let hub = Hub::spawn(&ctx).unwrap();
        let endpoint = format!("tcp://127.0.0.1:{}", hub.registrar_port());

        let client = HubClient::register(&ctx, &endpoint, "test-client").unwrap();
        assert_eq!(client.notifier_port(), hub.notifier_port());
    }

    #[test]
    fn worker_registration_broadcasts_a_connected_notification() {
        let ctx = Arc::new(Context::new());
        let hub = Hub::spawn(&ctx).unwrap();
        let endpoint = format!("tcp://127.0.0.1:{}", hub.registrar_port());

        let notify_sub = Socket::new(&ctx, SocketType::Sub).unwrap();
        notify_sub.raw().set_subscribe(b"").unwrap();
        notify_sub.raw().connect(&format!("tcp://127.0.0.1:{}", hub.notifier_port())).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut worker_socket = Socket::new(&ctx, SocketType::Dealer).unwrap();
        worker_socket.connect(&endpoint).unwrap();
        send_registration(&worker_socket, WORKER_HEADER, "echo-worker", CMD_REG, "").unwrap();

        let mut reply = Message::new();
        reply.recv(worker_socket.raw()).unwrap();
        assert_eq!(reply.len(), 6);

        let mut notice = Message::new();
        notice.recv(notify_sub.raw()).unwrap();
        assert_eq!(notice.len(), 2);
        assert_eq!(notice.frames().next().unwrap().as_str(), Some(hub.hub_id()));
    }
}
