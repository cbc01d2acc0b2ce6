//! Platform transport seam
//!
//! The browser (or a test fake) supplies the actual peer connection. The
//! state machine only drives it through these traits and learns about
//! asynchronous platform callbacks through [`PeerSignal`].

use crate::protocol::{IceCandidate, SessionDescription};
use crate::relay::IceServer;
use async_trait::async_trait;
use thiserror::Error;

/// Label of the single chat data channel
pub const CHAT_CHANNEL_LABEL: &str = "datachannel";

/// Transport error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    Unavailable(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Candidate rejected: {0}")]
    Candidate(String),
    #[error("Channel error: {0}")]
    Channel(String),
}

/// Readiness of a data channel as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Connecting; not usable yet
    Pending,
    Ready,
    Closed,
}

/// Connection state reported by the platform transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Bidirectional text channel over an established transport
pub trait DataChannel {
    fn label(&self) -> String;

    /// Current status, polled when the channel is attached
    fn status(&self) -> ChannelStatus;

    fn send(&self, text: &str) -> Result<(), TransportError>;

    fn close(&self);
}

/// One platform peer connection
#[async_trait(?Send)]
pub trait PeerTransport {
    type Channel: DataChannel;

    /// Open the local data channel; it is part of the next offer
    fn create_data_channel(&mut self, label: &str) -> Result<Self::Channel, TransportError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Creates transports for new negotiations
pub trait TransportFactory {
    type Transport: PeerTransport;

    /// `peer` identifies the remote side so platform callbacks can be
    /// routed back as [`PeerSignal`]s for that name.
    fn create(
        &mut self,
        peer: &str,
        ice_servers: &[IceServer],
    ) -> Result<Self::Transport, TransportError>;
}

/// Asynchronous notification from a platform transport
#[derive(Debug)]
pub enum PeerSignal<C> {
    /// A local candidate was gathered and should go to the peer
    LocalCandidate(IceCandidate),
    /// The remote side opened a data channel (responder)
    ChannelCreated(C),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    StateChanged(TransportState),
}
