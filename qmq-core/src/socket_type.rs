//! Socket type enumeration for the closed set of zmq socket types.

use std::fmt;

/// The closed set of socket types a [`crate::Context`] can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Exclusive bidirectional pipe; used by Actor and its sub-actors.
    Pair,
    /// Publisher half of a PUB/SUB pair.
    Pub,
    /// Subscriber half of a PUB/SUB pair.
    Sub,
    /// Synchronous request-reply client.
    Req,
    /// Synchronous request-reply server.
    Rep,
    /// Asynchronous request-reply client (MDP workers, Hub clients).
    Dealer,
    /// Routes by identity frame (MDP/Hub registrars, brokers).
    Router,
    /// Pipeline consumer.
    Pull,
    /// Pipeline producer.
    Push,
    /// Extended publisher, subscription-aware.
    XPub,
    /// Extended subscriber, dynamic subscriptions.
    XSub,
    /// Raw TCP connections.
    Stream,
}

impl SocketType {
    /// Name as it appears in log lines and in the `mmi.service` surface.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pair => "PAIR",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pull => "PULL",
            Self::Push => "PUSH",
            Self::XPub => "XPUB",
            Self::XSub => "XSUB",
            Self::Stream => "STREAM",
        }
    }

    /// Map to the zmq crate's own type constant.
    #[must_use]
    pub fn to_zmq(self) -> zmq::SocketType {
        match self {
            Self::Pair => zmq::PAIR,
            Self::Pub => zmq::PUB,
            Self::Sub => zmq::SUB,
            Self::Req => zmq::REQ,
            Self::Rep => zmq::REP,
            Self::Dealer => zmq::DEALER,
            Self::Router => zmq::ROUTER,
            Self::Pull => zmq::PULL,
            Self::Push => zmq::PUSH,
            Self::XPub => zmq::XPUB,
            Self::XSub => zmq::XSUB,
            Self::Stream => zmq::STREAM,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_zmq_names() {
        assert_eq!(SocketType::Dealer.to_string(), "DEALER");
        assert_eq!(SocketType::Router.to_string(), "ROUTER");
        assert_eq!(SocketType::Pub.to_string(), "PUB");
    }

    #[test]
    fn maps_to_zmq_constants() {
        assert_eq!(SocketType::Req.to_zmq(), zmq::REQ);
        assert_eq!(SocketType::Router.to_zmq(), zmq::ROUTER);
    }
}
