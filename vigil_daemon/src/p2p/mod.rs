//! The peer-to-peer plane: an HTTP server bound on the overlay, a poller
//! for remote node state, the peer-propagation protocol, and the knock
//! listener that seeds the admission allow-list.

pub mod allowlist;
pub mod client;
pub mod http;
pub mod knock;
pub mod poller;
pub mod propagate;
pub mod server;
pub mod statefile;

use vigil_protocol::p2p::PeerState;

/// Events the plane reports to the supervisor.
#[derive(Clone, Debug)]
pub enum PlaneEvent {
    /// A polled peer changed its `standby` or `isLeader` flag.
    PeerFlipped { name: String, state: PeerState },
    /// A previously reachable peer stopped answering `/state`.
    PeerUnreachable { name: String },
}

/// This node's view of itself, published to the plane by the supervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalState {
    pub standby: bool,
    pub is_leader: bool,
}
