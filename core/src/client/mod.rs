//! Client-side negotiation
//!
//! A [`NegotiationCoordinator`] per browser tab, one [`PeerConnection`] per
//! remote peer, and the [`PeerTransport`] seam the platform implements.

pub mod candidates;
pub mod coordinator;
pub mod peer;
pub mod transport;

#[cfg(test)]
mod fake;

pub use candidates::{CandidateQueue, DEFAULT_CANDIDATE_CAPACITY};
pub use coordinator::{ChannelOf, ChatEvent, CoordinatorError, NegotiationCoordinator, PendingRequest};
pub use peer::{PeerConnection, PeerError, PeerState, PeerUpdate, ReadyLatch, Role};
pub use transport::{
    ChannelStatus, DataChannel, PeerSignal, PeerTransport, TransportError, TransportFactory,
    TransportState, CHAT_CHANNEL_LABEL,
};
