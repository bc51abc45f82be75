//! qmq-net
//!
//! Transport-facing layer built on `qmq-core`: the socket facade, a
//! level-triggered [`Poller`], a multithreaded tickless [`Reactor`],
//! the Proxy/Forwarder and Monitor actors, and the Gossip wire codec.

#![allow(clippy::module_name_repetitions)]

pub mod gossip;
pub mod monitor;
pub mod poller;
pub mod proxy;
pub mod reactor;
pub mod socket;

pub use gossip::GossipFrame;
pub use monitor::{Event, Monitor};
pub use poller::Poller;
pub use proxy::Proxy;
pub use reactor::Reactor;
pub use socket::{BinValue, Picture, Socket};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::gossip::GossipFrame;
    pub use crate::monitor::{Event, Monitor};
    pub use crate::poller::Poller;
    pub use crate::proxy::Proxy;
    pub use crate::reactor::Reactor;
    pub use crate::socket::{BinValue, Picture, Socket};
}
