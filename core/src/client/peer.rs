//! Peer connection state machine — one negotiation with one remote peer
//!
//! ```text
//! Idle ─initiate─▶ OfferCreated ─answer─┐
//!  └──accept_offer─▶ OfferReceived ─────┴▶ AnswerExchanged ─▶ IceNegotiating ─▶ DataChannelOpen
//! any non-Closed state ─▶ Failed(reason)            close() from anywhere ─▶ Closed
//! ```
//!
//! Remote candidates that arrive before the remote description is known are
//! held in a bounded queue and applied in arrival order once it is set.
//! Readiness fires exactly once, whether the channel opened before or after
//! it was attached.

use super::candidates::CandidateQueue;
use super::transport::{
    ChannelStatus, DataChannel, PeerTransport, TransportError, TransportState, CHAT_CHANNEL_LABEL,
};
use crate::protocol::{ClientEvent, IceCandidate, ProtocolError, SessionDescription};
use thiserror::Error;

/// Which side started the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Negotiation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    OfferCreated,
    OfferReceived,
    AnswerExchanged,
    IceNegotiating,
    DataChannelOpen,
    Closed,
    Failed(String),
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed(_))
    }
}

/// Peer connection errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Unsolicited answer in state {0:?}")]
    UnsolicitedAnswer(PeerState),
    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PeerState,
    },
    #[error("Data channel not open")]
    ChannelNotOpen,
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Effect of a platform notification on the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    Unchanged,
    /// The data channel just became usable (reported once)
    Ready,
    /// This notification closed the connection
    Closed,
    Failed(String),
}

/// One-shot flag; `fire` returns true only the first time
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadyLatch {
    fired: bool,
}

impl ReadyLatch {
    pub fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

/// A single negotiation and, once established, the chat channel
pub struct PeerConnection<T: PeerTransport> {
    local_name: String,
    remote_name: String,
    role: Role,
    state: PeerState,
    transport: T,
    channel: Option<T::Channel>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: CandidateQueue,
    ready: ReadyLatch,
}

impl<T: PeerTransport> PeerConnection<T> {
    pub fn new(
        local_name: impl Into<String>,
        remote_name: impl Into<String>,
        role: Role,
        transport: T,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            remote_name: remote_name.into(),
            role,
            state: PeerState::Idle,
            transport,
            channel: None,
            local_description: None,
            remote_description: None,
            pending_candidates: CandidateQueue::new(),
            ready: ReadyLatch::default(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// The platform transport behind this negotiation
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_fired() && self.state == PeerState::DataChannelOpen
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<(), PeerError> {
        if self.role != role || self.state != PeerState::Idle {
            return Err(PeerError::InvalidState {
                operation,
                state: self.state.clone(),
            });
        }
        Ok(())
    }

    /// Initiator: open the channel, create and set the offer.
    /// Returns the `rtc-offer` to send.
    pub async fn initiate(&mut self) -> Result<ClientEvent, PeerError> {
        self.require(Role::Initiator, "initiate")?;

        let channel = match self.transport.create_data_channel(CHAT_CHANNEL_LABEL) {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail(e)),
        };
        self.channel = Some(channel);

        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.transport.set_local_description(&offer).await {
            return Err(self.fail(e));
        }

        let payload = offer.to_payload()?;
        self.local_description = Some(offer);
        self.state = PeerState::OfferCreated;
        tracing::debug!("Offer created for {}", self.remote_name);

        Ok(ClientEvent::RtcOffer {
            recipient_name: self.remote_name.clone(),
            offer: payload,
        })
    }

    /// Responder: apply the remote offer and produce the answer.
    /// Returns the `rtc-answer` to send.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<ClientEvent, PeerError> {
        self.require(Role::Responder, "accept offer")?;
        self.state = PeerState::OfferReceived;

        if let Err(e) = self.transport.set_remote_description(&offer).await {
            return Err(self.fail(e));
        }
        self.remote_description = Some(offer);
        self.drain_candidates().await;

        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.transport.set_local_description(&answer).await {
            return Err(self.fail(e));
        }

        let payload = answer.to_payload()?;
        self.local_description = Some(answer);
        self.state = PeerState::AnswerExchanged;
        tracing::debug!("Answer created for {}", self.remote_name);

        Ok(ClientEvent::RtcAnswer {
            recipient_name: self.remote_name.clone(),
            answer: payload,
        })
    }

    /// Initiator: apply the peer's answer. An answer in any state other
    /// than `OfferCreated` is rejected and leaves the machine untouched.
    pub async fn receive_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        if self.state != PeerState::OfferCreated {
            return Err(PeerError::UnsolicitedAnswer(self.state.clone()));
        }

        if let Err(e) = self.transport.set_remote_description(&answer).await {
            return Err(self.fail(e));
        }
        self.remote_description = Some(answer);
        self.state = PeerState::AnswerExchanged;
        self.drain_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is known.
    pub async fn receive_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.state.is_terminal() {
            return Err(PeerError::Closed);
        }

        if self.remote_description.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(());
        }

        self.apply_candidate(candidate).await;
        Ok(())
    }

    async fn drain_candidates(&mut self) {
        for candidate in self.pending_candidates.drain() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        match self.transport.add_ice_candidate(&candidate).await {
            Ok(()) => {
                if self.state == PeerState::AnswerExchanged {
                    self.state = PeerState::IceNegotiating;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Skipping candidate from {}: {}",
                    self.remote_name,
                    e
                );
            }
        }
    }

    /// Attach a data channel (the responder receives it from the remote
    /// side). Its status is polled immediately since it may already be open.
    /// A connection carries one channel; any further one is closed.
    pub fn attach_channel(&mut self, channel: T::Channel) -> PeerUpdate {
        if self.state.is_terminal() {
            channel.close();
            return PeerUpdate::Unchanged;
        }
        if self.channel.is_some() {
            tracing::warn!(
                "Extra data channel '{}' from {} closed",
                channel.label(),
                self.remote_name
            );
            channel.close();
            return PeerUpdate::Unchanged;
        }

        let status = channel.status();
        self.channel = Some(channel);
        match status {
            ChannelStatus::Ready => self.mark_ready(),
            ChannelStatus::Closed => self.close_update(),
            ChannelStatus::Pending => PeerUpdate::Unchanged,
        }
    }

    /// The attached channel reported open
    pub fn on_channel_open(&mut self) -> PeerUpdate {
        if self.channel.is_none() || self.state.is_terminal() {
            return PeerUpdate::Unchanged;
        }
        self.mark_ready()
    }

    pub fn on_channel_closed(&mut self) -> PeerUpdate {
        self.close_update()
    }

    pub fn on_transport_state(&mut self, state: TransportState) -> PeerUpdate {
        match state {
            TransportState::Connecting => {
                if self.state == PeerState::AnswerExchanged {
                    self.state = PeerState::IceNegotiating;
                }
                PeerUpdate::Unchanged
            }
            TransportState::Failed => {
                if self.state.is_terminal() {
                    return PeerUpdate::Unchanged;
                }
                match self.fail(TransportError::Negotiation("transport failed".to_string())) {
                    PeerError::Transport(e) => PeerUpdate::Failed(e.to_string()),
                    other => PeerUpdate::Failed(other.to_string()),
                }
            }
            TransportState::Disconnected | TransportState::Closed => self.close_update(),
            TransportState::New | TransportState::Connected => PeerUpdate::Unchanged,
        }
    }

    fn mark_ready(&mut self) -> PeerUpdate {
        if self.ready.fire() {
            self.state = PeerState::DataChannelOpen;
            tracing::info!("Data channel to {} open", self.remote_name);
            PeerUpdate::Ready
        } else {
            PeerUpdate::Unchanged
        }
    }

    fn close_update(&mut self) -> PeerUpdate {
        if self.close() {
            PeerUpdate::Closed
        } else {
            PeerUpdate::Unchanged
        }
    }

    /// Send a chat message over the open channel
    pub fn send(&self, text: &str) -> Result<(), PeerError> {
        match (&self.state, &self.channel) {
            (PeerState::DataChannelOpen, Some(channel)) => Ok(channel.send(text)?),
            _ => Err(PeerError::ChannelNotOpen),
        }
    }

    /// Close channel and transport. Returns whether this call did the
    /// closing; later calls are no-ops.
    pub fn close(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.release();
        self.state = PeerState::Closed;
        tracing::info!("Connection to {} closed", self.remote_name);
        true
    }

    fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.transport.close();
        self.pending_candidates.clear();
    }

    fn fail(&mut self, error: TransportError) -> PeerError {
        tracing::warn!("Negotiation with {} failed: {}", self.remote_name, error);
        if !self.state.is_terminal() {
            self.release();
            self.state = PeerState::Failed(error.to_string());
        }
        PeerError::Transport(error)
    }
}

// ============================================================================
// TESTS
// ============================================================================
