//! qmq-core
//!
//! The runtime-agnostic building blocks shared by every qmq layer:
//! - Frame/Message wire codec (`frame`, `message`)
//! - Process-wide or shadowed messaging [`Context`] (`context`)
//! - The Actor primitive: worker thread + control pipe (`actor`, `signal`)
//! - Error types (`error`), environment configuration (`config`), and the
//!   single panic point for programmer errors (`fatal`)

#![allow(clippy::module_name_repetitions)]

pub mod actor;
pub mod config;
pub mod context;
pub mod error;
pub mod fatal;
pub mod frame;
pub mod message;
pub mod signal;
pub mod socket_type;

pub use actor::Actor;
pub use context::Context;
pub use error::{Error, Result};
pub use frame::{Frame, SendFlags};
pub use message::Message;
pub use socket_type::SocketType;

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::actor::{is_term, Actor, TERM};
    pub use crate::context::{self, Context};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, SendFlags};
    pub use crate::message::Message;
    pub use crate::signal::{signal, wait};
    pub use crate::socket_type::SocketType;
}
