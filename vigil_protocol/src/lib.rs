//! Wire types shared between the `vigild` daemon and the `vigil` CLI:
//! the control-socket protocol, join tokens, and the bodies exchanged on
//! the peer-to-peer plane.

pub mod control;
pub mod p2p;
pub mod token;

pub use control::{ControlRequest, ControlResponse, FenceAction, FenceInitiator, FenceRecord};
pub use token::{JoinToken, TokenError, TokenPeer, TOKEN_URI_SCHEME};
