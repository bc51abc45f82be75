//! # qmq
//!
//! An object-oriented messaging toolkit layered on ZeroMQ.
//!
//! This crate is the application-facing layer: the Majordomo Protocol
//! broker/worker/client ([`mdp`]) and the Hub service-discovery plane
//! ([`hub`]), both built on the socket facade, actor harness, and proxy
//! primitives in `qmq-core` and `qmq-net`.
//!
//! [`beacon`] documents the LAN-discovery actor's wire contract without
//! implementing it — see its module docs.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod beacon;
/// Development helpers (examples/tests).
pub mod dev_tracing;
pub mod hub;
pub mod mdp;

pub use hub::{Hub, HubClient, HubWorker};
pub use mdp::{MdpBroker, MdpClient, MdpWorker};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::hub::{Hub, HubClient, HubWorker};
    pub use crate::mdp::{MdpBroker, MdpClient, MdpWorker};
}
