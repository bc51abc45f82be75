//! UDP LAN discovery actor (external contract only; see module docs).
//!
//! `qmq::beacon` documents the wire contract of the original `qmq/beacon.cpp`
//! actor without implementing it — UDP broadcast discovery is out of scope
//! here (it doesn't route through a `zmq::Context` and has no bearing on the
//! MDP/Hub control planes this crate implements), but the contract is kept
//! as a doc-only reference for anyone wiring a beacon actor alongside a
//! [`crate::hub::Hub`] or [`crate::mdp::MdpBroker`].
//!
//! ## Actor protocol (pipe commands)
//!
//! - `"CONFIGURE" <iface>` — bind a UDP socket on the given interface (or
//!   `"*"` for `INADDR_ANY`/`INADDR_BROADCAST`) and port; replies on the
//!   pipe with the resolved hostname, or terminates the process if no
//!   broadcast-capable interface is found.
//! - `"PUBLISH" <transmit> <interval-ms>` — start periodically broadcasting
//!   `transmit` (an opaque frame, typically a short protocol + port
//!   announcement) every `interval-ms` milliseconds.
//! - `"SILENCE"` — stop publishing.
//! - `"SUBSCRIBE" <filter>` — only deliver received beacons whose payload
//!   starts with `filter` to the caller; empty filter matches everything.
//! - `"UNSUBSCRIBE"` — clear the filter.
//! - `"VERBOSE"` — enable trace logging.
//!
//! ## Delivery
//!
//! Each accepted beacon is forwarded to the caller as a two-frame message:
//! the sender's IPv4 address (as a dotted-quad string) followed by the raw
//! payload bytes.
