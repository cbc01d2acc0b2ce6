//! Negotiation Coordinator — request/accept/reject and per-peer dispatch
//!
//! Owns one [`PeerConnection`] per remote name. Everything it wants to say
//! to the relay goes out on the outbound channel as a [`ClientEvent`];
//! everything the UI should learn about goes out as a [`ChatEvent`]. The
//! driver feeds it relay frames, platform transport callbacks and UI
//! commands one at a time.

use super::candidates::CandidateQueue;
use super::peer::{PeerConnection, PeerError, PeerState, PeerUpdate, Role};
use super::transport::{DataChannel, PeerSignal, PeerTransport, TransportError, TransportFactory};
use crate::protocol::{
    ChatResponse, ClientEvent, IceCandidate, OpaquePayload, ProtocolError, ServerEvent,
    SessionDescription,
};
use crate::relay::IceServer;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use web_time::Instant;

/// Data channel type produced by a factory's transports
pub type ChannelOf<F> = <<F as TransportFactory>::Transport as PeerTransport>::Channel;

/// A chat request awaiting the local user's decision
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub requestor_name: String,
    pub received_at: Instant,
}

/// Notifications for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Registered { name: String },
    PresenceChanged(Vec<String>),
    IncomingRequest { peer: String },
    /// The requestor withdrew or disconnected
    RequestCancelled { peer: String },
    RequestRejected { peer: String },
    PeerNotFound { peer: String },
    Blocked { retry_after: Duration },
    Connected { peer: String },
    MessageReceived { peer: String, text: String },
    ConversationEnded { peer: String },
    ConnectionFailed { peer: String, reason: String },
    /// The signalling socket went away; every negotiation was cancelled
    RelayLost,
}

/// Coordinator error types
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No name assigned yet")]
    NotRegistered,
    #[error("Cannot start a chat with yourself")]
    SelfRequest,
    #[error("Connection with {0} already exists")]
    ConnectionAlreadyExists(String),
    #[error("No pending request for {0}")]
    NoPendingRequest(String),
    #[error("No connection with {0}")]
    NoConnection(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client-side negotiation coordinator
pub struct NegotiationCoordinator<F: TransportFactory> {
    factory: F,
    local_name: Option<String>,
    ice_servers: Vec<IceServer>,
    peers: HashMap<String, PeerConnection<F::Transport>>,
    /// Peers we sent a chat request to and have not heard back from
    outgoing_requests: HashSet<String>,
    /// Requests from peers awaiting accept/reject
    pending_requests: HashMap<String, PendingRequest>,
    /// Peers whose request we accepted; only they may send an offer
    accepted: HashSet<String>,
    /// Candidates from accepted peers that beat their offer here
    early_candidates: HashMap<String, CandidateQueue>,
    outbound: UnboundedSender<ClientEvent>,
    events: UnboundedSender<ChatEvent>,
}

impl<F: TransportFactory> NegotiationCoordinator<F> {
    pub fn new(
        factory: F,
        outbound: UnboundedSender<ClientEvent>,
        events: UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            factory,
            local_name: None,
            ice_servers: Vec::new(),
            peers: HashMap::new(),
            outgoing_requests: HashSet::new(),
            pending_requests: HashMap::new(),
            accepted: HashSet::new(),
            early_candidates: HashMap::new(),
            outbound,
            events,
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Store relay credentials for connections created from now on.
    /// Without them connections still work on direct paths.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        tracing::debug!("Using {} ICE servers", servers.len());
        self.ice_servers = servers;
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn peer_state(&self, peer: &str) -> Option<&PeerState> {
        self.peers.get(peer).map(PeerConnection::state)
    }

    /// Transport of the live connection with `peer`, if any
    pub fn transport(&self, peer: &str) -> Option<&F::Transport> {
        self.peers.get(peer).map(PeerConnection::transport)
    }

    pub fn pending_requests(&self) -> Vec<&PendingRequest> {
        let mut requests: Vec<&PendingRequest> = self.pending_requests.values().collect();
        requests.sort_by_key(|r| r.received_at);
        requests
    }

    pub fn has_outgoing_request(&self, peer: &str) -> bool {
        self.outgoing_requests.contains(peer)
    }

    pub fn transport_factory(&self) -> &F {
        &self.factory
    }

    // ------------------------------------------------------------------
    // UI commands
    // ------------------------------------------------------------------

    /// Ask `peer` for a conversation
    pub fn request_chat(&mut self, peer: &str) -> Result<(), CoordinatorError> {
        let me = self.local_name.as_deref().ok_or(CoordinatorError::NotRegistered)?;
        if peer == me {
            return Err(CoordinatorError::SelfRequest);
        }
        if self.peers.contains_key(peer) || self.outgoing_requests.contains(peer) {
            return Err(CoordinatorError::ConnectionAlreadyExists(peer.to_string()));
        }

        self.outgoing_requests.insert(peer.to_string());
        tracing::info!("Requesting chat with {}", peer);
        self.send(ClientEvent::ChatRequest {
            recipient_name: peer.to_string(),
        });
        Ok(())
    }

    /// Withdraw an unanswered request
    pub fn cancel_request(&mut self, peer: &str) -> Result<(), CoordinatorError> {
        if !self.outgoing_requests.remove(peer) {
            return Err(CoordinatorError::NoPendingRequest(peer.to_string()));
        }
        self.send(ClientEvent::ChatRequestCancelled {
            recipient_name: peer.to_string(),
        });
        Ok(())
    }

    /// Accept `peer`'s request; their offer will follow
    pub fn accept(&mut self, peer: &str) -> Result<(), CoordinatorError> {
        if self.local_name.is_none() {
            return Err(CoordinatorError::NotRegistered);
        }
        if !self.pending_requests.contains_key(peer) {
            return Err(CoordinatorError::NoPendingRequest(peer.to_string()));
        }
        if self.peers.contains_key(peer) {
            return Err(CoordinatorError::ConnectionAlreadyExists(peer.to_string()));
        }

        self.pending_requests.remove(peer);
        self.accepted.insert(peer.to_string());
        self.early_candidates.entry(peer.to_string()).or_default();
        tracing::info!("Accepted chat with {}", peer);
        self.send(ClientEvent::ChatResponse {
            recipient_name: peer.to_string(),
            response: ChatResponse::Accept,
        });
        Ok(())
    }

    /// Decline `peer`'s request
    pub fn reject(&mut self, peer: &str) -> Result<(), CoordinatorError> {
        if self.pending_requests.remove(peer).is_none() {
            return Err(CoordinatorError::NoPendingRequest(peer.to_string()));
        }
        self.early_candidates.remove(peer);
        self.send(ClientEvent::ChatResponse {
            recipient_name: peer.to_string(),
            response: ChatResponse::Reject,
        });
        Ok(())
    }

    pub fn send_message(&self, peer: &str, text: &str) -> Result<(), CoordinatorError> {
        let connection = self
            .peers
            .get(peer)
            .ok_or_else(|| CoordinatorError::NoConnection(peer.to_string()))?;
        connection.send(text)?;
        Ok(())
    }

    /// Close the conversation with `peer`
    pub fn end_conversation(&mut self, peer: &str) -> Result<(), CoordinatorError> {
        let mut connection = self
            .peers
            .remove(peer)
            .ok_or_else(|| CoordinatorError::NoConnection(peer.to_string()))?;
        if connection.close() {
            self.notify(ChatEvent::ConversationEnded {
                peer: peer.to_string(),
            });
        }
        Ok(())
    }

    /// The signalling socket closed: the pseudonym is gone and every
    /// negotiation with it.
    pub fn relay_disconnected(&mut self) {
        tracing::warn!("Relay connection lost; cancelling all negotiations");
        for (peer, mut connection) in std::mem::take(&mut self.peers) {
            if connection.close() {
                self.notify(ChatEvent::ConversationEnded { peer });
            }
        }
        self.outgoing_requests.clear();
        self.pending_requests.clear();
        self.accepted.clear();
        self.early_candidates.clear();
        self.local_name = None;
        self.notify(ChatEvent::RelayLost);
    }

    // ------------------------------------------------------------------
    // Relay events
    // ------------------------------------------------------------------

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AssignName(name) => {
                tracing::info!("Assigned name {}", name);
                self.local_name = Some(name.clone());
                self.notify(ChatEvent::Registered { name });
            }
            ServerEvent::UserList(names) => {
                self.forget_departed(&names);
                self.notify(ChatEvent::PresenceChanged(names));
            }
            ServerEvent::ChatRequest { sender_name } => {
                self.pending_requests.insert(
                    sender_name.clone(),
                    PendingRequest {
                        requestor_name: sender_name.clone(),
                        received_at: Instant::now(),
                    },
                );
                self.notify(ChatEvent::IncomingRequest { peer: sender_name });
            }
            ServerEvent::ChatRequestCancelled { sender_name } => {
                let was_pending = self.pending_requests.remove(&sender_name).is_some();
                let was_accepted = self.accepted.remove(&sender_name);
                self.early_candidates.remove(&sender_name);
                if was_pending || was_accepted {
                    self.notify(ChatEvent::RequestCancelled { peer: sender_name });
                } else {
                    tracing::debug!("Stale cancellation from {}", sender_name);
                }
            }
            ServerEvent::ChatResponse {
                sender_name,
                response,
            } => {
                if !self.outgoing_requests.remove(&sender_name) {
                    tracing::warn!("Response from {} without a request", sender_name);
                    return;
                }
                match response {
                    ChatResponse::Accept if self.yields_to(&sender_name) => {
                        tracing::info!("Mutual request with {}; awaiting their offer", sender_name);
                    }
                    ChatResponse::Accept => self.start_initiator(sender_name).await,
                    ChatResponse::Reject => {
                        self.notify(ChatEvent::RequestRejected { peer: sender_name })
                    }
                }
            }
            ServerEvent::RtcOffer { sender_name, offer } => {
                self.handle_offer(sender_name, offer).await;
            }
            ServerEvent::RtcAnswer {
                sender_name,
                answer,
            } => {
                self.handle_answer(sender_name, answer).await;
            }
            ServerEvent::RtcIceCandidate {
                sender_name,
                ice_candidate,
            } => {
                self.handle_remote_candidate(sender_name, ice_candidate)
                    .await;
            }
            ServerEvent::PeerNotFound(peer) => {
                tracing::info!("{} is not connected", peer);
                self.outgoing_requests.remove(&peer);
                self.pending_requests.remove(&peer);
                self.accepted.remove(&peer);
                self.early_candidates.remove(&peer);
                if let Some(mut connection) = self.peers.remove(&peer) {
                    connection.close();
                }
                self.notify(ChatEvent::PeerNotFound { peer });
            }
            ServerEvent::Blocked { retry_after_ms } => {
                tracing::warn!("Relay rate limit hit; retry in {}ms", retry_after_ms);
                self.notify(ChatEvent::Blocked {
                    retry_after: Duration::from_millis(retry_after_ms),
                });
            }
        }
    }

    /// Both sides accepted each other's request: the lower name offers,
    /// the other keeps its allow-list entry and waits.
    fn yields_to(&self, peer: &str) -> bool {
        self.accepted.contains(peer)
            && self.local_name.as_deref().is_some_and(|me| me > peer)
    }

    /// Drop every trace of peers missing from the presence list. Names are
    /// reused by the relay, so nothing granted to a departed holder may
    /// carry over to the next one.
    fn forget_departed(&mut self, present: &[String]) {
        let present: HashSet<&str> = present.iter().map(String::as_str).collect();
        let gone = |peer: &String| !present.contains(peer.as_str());

        self.outgoing_requests.retain(|peer| !gone(peer));
        self.accepted.retain(|peer| !gone(peer));
        self.early_candidates.retain(|peer, _| !gone(peer));

        let withdrawn: Vec<String> = self
            .pending_requests
            .keys()
            .filter(|peer| gone(peer))
            .cloned()
            .collect();
        for peer in withdrawn {
            self.pending_requests.remove(&peer);
            self.notify(ChatEvent::RequestCancelled { peer });
        }

        let stalled: Vec<String> = self
            .peers
            .iter()
            .filter(|(peer, connection)| {
                gone(peer) && *connection.state() != PeerState::DataChannelOpen
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in stalled {
            tracing::info!("{} left during negotiation", peer);
            self.drop_failed(peer, "peer left the relay".to_string());
        }
    }

    fn new_connection(
        &mut self,
        peer: &str,
        role: Role,
    ) -> Result<PeerConnection<F::Transport>, CoordinatorError> {
        let me = self
            .local_name
            .clone()
            .ok_or(CoordinatorError::NotRegistered)?;
        if self.peers.contains_key(peer) {
            return Err(CoordinatorError::ConnectionAlreadyExists(peer.to_string()));
        }
        let transport = self.factory.create(peer, &self.ice_servers)?;
        Ok(PeerConnection::new(me, peer, role, transport))
    }

    async fn start_initiator(&mut self, peer: String) {
        let mut connection = match self.new_connection(&peer, Role::Initiator) {
            Ok(connection) => connection,
            Err(e) => return self.report_failure(peer, e),
        };

        match connection.initiate().await {
            Ok(offer) => {
                if self.pending_requests.remove(&peer).is_some() {
                    tracing::debug!("Request from {} superseded by our offer", peer);
                }
                self.accepted.remove(&peer);
                self.early_candidates.remove(&peer);
                self.send(offer);
                self.peers.insert(peer, connection);
            }
            Err(e) => self.report_failure(peer, e.into()),
        }
    }

    async fn handle_offer(&mut self, sender: String, offer: OpaquePayload) {
        if !self.accepted.remove(&sender) {
            tracing::warn!("Unsolicited offer from {}; dropped", sender);
            return;
        }
        self.outgoing_requests.remove(&sender);

        let offer = match SessionDescription::from_payload(offer) {
            Ok(offer) => offer,
            Err(e) => return self.report_failure(sender, e.into()),
        };
        let mut connection = match self.new_connection(&sender, Role::Responder) {
            Ok(connection) => connection,
            Err(e) => return self.report_failure(sender, e),
        };

        let early = self
            .early_candidates
            .remove(&sender)
            .map(|mut queue| queue.drain())
            .unwrap_or_default();
        for candidate in early {
            // No remote description yet, so these are only queued
            if let Err(e) = connection.receive_candidate(candidate).await {
                tracing::debug!("Early candidate from {} dropped: {}", sender, e);
            }
        }

        match connection.accept_offer(offer).await {
            Ok(answer) => {
                self.send(answer);
                self.peers.insert(sender, connection);
            }
            Err(e) => self.report_failure(sender, e.into()),
        }
    }

    async fn handle_answer(&mut self, sender: String, answer: OpaquePayload) {
        let Some(connection) = self.peers.get_mut(&sender) else {
            tracing::warn!("Answer from {} with no connection", sender);
            return;
        };
        let answer = match SessionDescription::from_payload(answer) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Malformed answer from {}: {}", sender, e);
                return;
            }
        };

        match connection.receive_answer(answer).await {
            Ok(()) => {}
            Err(PeerError::UnsolicitedAnswer(state)) => {
                tracing::warn!("Ignoring answer from {} in state {:?}", sender, state);
            }
            Err(e) => self.drop_failed(sender, e.to_string()),
        }
    }

    async fn handle_remote_candidate(&mut self, sender: String, payload: OpaquePayload) {
        let candidate = match IceCandidate::from_payload(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Malformed candidate from {}: {}", sender, e);
                return;
            }
        };

        if let Some(connection) = self.peers.get_mut(&sender) {
            if let Err(e) = connection.receive_candidate(candidate).await {
                tracing::debug!("Candidate from {} not applied: {}", sender, e);
            }
        } else if self.accepted.contains(&sender) {
            tracing::debug!("Queueing early candidate from {}", sender);
            self.early_candidates
                .entry(sender)
                .or_default()
                .push(candidate);
        } else {
            tracing::debug!("Stray candidate from {} dropped", sender);
        }
    }

    // ------------------------------------------------------------------
    // Platform callbacks
    // ------------------------------------------------------------------

    pub fn handle_transport_event(&mut self, peer: &str, signal: PeerSignal<ChannelOf<F>>) {
        let Some(connection) = self.peers.get_mut(peer) else {
            if let PeerSignal::ChannelCreated(channel) = signal {
                channel.close();
            }
            tracing::debug!("Transport event for unknown peer {}", peer);
            return;
        };

        let update = match signal {
            PeerSignal::LocalCandidate(candidate) => {
                match candidate.to_payload() {
                    Ok(ice_candidate) => self.send(ClientEvent::RtcIceCandidate {
                        recipient_name: peer.to_string(),
                        ice_candidate,
                    }),
                    Err(e) => tracing::warn!("Cannot encode local candidate: {}", e),
                }
                PeerUpdate::Unchanged
            }
            PeerSignal::ChannelCreated(channel) => connection.attach_channel(channel),
            PeerSignal::ChannelOpen => connection.on_channel_open(),
            PeerSignal::ChannelMessage(text) => {
                self.notify(ChatEvent::MessageReceived {
                    peer: peer.to_string(),
                    text,
                });
                PeerUpdate::Unchanged
            }
            PeerSignal::ChannelClosed => connection.on_channel_closed(),
            PeerSignal::StateChanged(state) => connection.on_transport_state(state),
        };

        match update {
            PeerUpdate::Unchanged => {}
            PeerUpdate::Ready => self.notify(ChatEvent::Connected {
                peer: peer.to_string(),
            }),
            PeerUpdate::Closed => {
                self.peers.remove(peer);
                self.notify(ChatEvent::ConversationEnded {
                    peer: peer.to_string(),
                });
            }
            PeerUpdate::Failed(reason) => self.drop_failed(peer.to_string(), reason),
        }
    }

    fn drop_failed(&mut self, peer: String, reason: String) {
        if let Some(mut connection) = self.peers.remove(&peer) {
            connection.close();
        }
        self.notify(ChatEvent::ConnectionFailed { peer, reason });
    }

    fn report_failure(&mut self, peer: String, error: CoordinatorError) {
        tracing::warn!("Negotiation with {} failed: {}", peer, error);
        self.notify(ChatEvent::ConnectionFailed {
            peer,
            reason: error.to_string(),
        });
    }

    fn send(&self, event: ClientEvent) {
        if self.outbound.send(event).is_err() {
            tracing::warn!("Signalling channel closed; event dropped");
        }
    }

    fn notify(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No UI listener for chat events");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
