//! Signalling Relay — names connections and forwards handshake events
//!
//! The relay never interprets offers, answers or candidates. It assigns each
//! connection a pseudonym, keeps everyone's presence list current, and
//! forwards each addressed event to exactly one recipient. All methods are
//! synchronous: a caller handles one event to completion before the next,
//! so registry and session mutations are never interleaved.

use super::rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
use super::registry::{ConnectionId, NameRegistry, RegistryError};
use crate::protocol::{ClientEvent, ServerEvent};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Outbound queue of one connection
pub type Outbox = UnboundedSender<ServerEvent>;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Event budget per connection
    pub socket_rate: RateLimitConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            socket_rate: RateLimitConfig::socket_events(),
        }
    }
}

/// Statistics about relay operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Number of live connections
    pub connections_active: usize,
    /// Events delivered to a recipient
    pub events_forwarded: u64,
    /// `peer-not-found` replies sent
    pub peers_not_found: u64,
    /// Events dropped by the rate limiter
    pub events_blocked: u64,
    /// Frames that failed to parse
    pub frames_rejected: u64,
}

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the recipient
    Forwarded { recipient: String },
    /// Recipient offline; sender told with `peer-not-found`
    PeerNotFound { recipient: String },
    /// Dropped by the rate limiter; sender told with `blocked`
    RateLimited { retry_after_ms: u64 },
    /// Frame did not parse; dropped
    Malformed,
}

/// A connected identity
#[derive(Debug)]
struct Session {
    name: String,
    outbox: Outbox,
    /// Recipients of this identity's unanswered chat requests
    outstanding_requests: HashSet<String>,
}

/// The signalling relay
pub struct SignallingRelay {
    config: RelayConfig,
    registry: NameRegistry,
    sessions: HashMap<ConnectionId, Session>,
    limiter: RateLimiter<ConnectionId>,
    stats: RelayStats,
}

impl SignallingRelay {
    /// Create a relay with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a relay with custom configuration
    pub fn with_config(config: RelayConfig) -> Self {
        Self::with_registry(config, NameRegistry::new())
    }

    /// Create a relay around an existing registry
    pub fn with_registry(config: RelayConfig, registry: NameRegistry) -> Self {
        let limiter = RateLimiter::new(config.socket_rate);
        Self {
            config,
            registry,
            sessions: HashMap::new(),
            limiter,
            stats: RelayStats::default(),
        }
    }

    /// Register a new connection: assign a name, send it, and broadcast
    /// the updated presence list (which includes the newcomer).
    pub fn connect(&mut self, outbox: Outbox) -> Result<(ConnectionId, String), RelayError> {
        if self.sessions.len() >= self.config.max_connections {
            return Err(RelayError::ConnectionLimitExceeded);
        }

        let connection = Uuid::new_v4();
        let name = self.registry.assign(connection)?;

        send(&outbox, ServerEvent::AssignName(name.clone()));
        self.sessions.insert(
            connection,
            Session {
                name: name.clone(),
                outbox,
                outstanding_requests: HashSet::new(),
            },
        );
        self.stats.connections_active = self.sessions.len();

        tracing::info!("Connection {} assigned name {}", connection, name);
        self.broadcast_presence();

        Ok((connection, name))
    }

    /// Tear down a connection. Recipients of its unanswered chat requests
    /// get a `chat-request-cancelled` before the presence update.
    pub fn disconnect(&mut self, connection: &ConnectionId) -> Option<String> {
        let session = self.sessions.remove(connection)?;

        for recipient in &session.outstanding_requests {
            if let Some(outbox) = self.outbox_for(recipient) {
                tracing::debug!(
                    "Cancelling stale request from {} to {}",
                    session.name,
                    recipient
                );
                send(
                    outbox,
                    ServerEvent::ChatRequestCancelled {
                        sender_name: session.name.clone(),
                    },
                );
            }
        }

        for other in self.sessions.values_mut() {
            other.outstanding_requests.remove(&session.name);
        }
        self.registry.release(&session.name);
        self.limiter.forget(connection);
        self.stats.connections_active = self.sessions.len();

        tracing::info!("{} disconnected", session.name);
        self.broadcast_presence();

        Some(session.name)
    }

    /// Handle a raw text frame. The frame is charged against the rate
    /// limit before it is parsed.
    pub fn handle_frame(
        &mut self,
        connection: &ConnectionId,
        frame: &str,
    ) -> Result<RouteOutcome, RelayError> {
        if let Some(blocked) = self.admit(connection)? {
            return Ok(blocked);
        }

        match ClientEvent::from_json(frame) {
            Ok(event) => self.route(connection, event),
            Err(e) => {
                tracing::warn!("Dropping malformed frame from {}: {}", connection, e);
                self.stats.frames_rejected += 1;
                Ok(RouteOutcome::Malformed)
            }
        }
    }

    /// Handle an already-decoded event
    pub fn handle_event(
        &mut self,
        connection: &ConnectionId,
        event: ClientEvent,
    ) -> Result<RouteOutcome, RelayError> {
        if let Some(blocked) = self.admit(connection)? {
            return Ok(blocked);
        }
        self.route(connection, event)
    }

    fn admit(&mut self, connection: &ConnectionId) -> Result<Option<RouteOutcome>, RelayError> {
        let session = self
            .sessions
            .get(connection)
            .ok_or(RelayError::UnknownConnection(*connection))?;

        match self.limiter.consume(connection, 1) {
            RateDecision::Allowed => Ok(None),
            RateDecision::Denied { retry_after } => {
                let retry_after_ms = retry_after.as_millis() as u64;
                tracing::warn!(
                    "Rate limit hit by {}; retry in {}ms",
                    session.name,
                    retry_after_ms
                );
                send(&session.outbox, ServerEvent::Blocked { retry_after_ms });
                self.stats.events_blocked += 1;
                Ok(Some(RouteOutcome::RateLimited { retry_after_ms }))
            }
        }
    }

    fn route(
        &mut self,
        connection: &ConnectionId,
        event: ClientEvent,
    ) -> Result<RouteOutcome, RelayError> {
        let session = self
            .sessions
            .get_mut(connection)
            .ok_or(RelayError::UnknownConnection(*connection))?;
        let sender_name = session.name.clone();
        let recipient = event.recipient_name().to_string();

        tracing::debug!(
            "{} from {} to {}",
            event.event_name(),
            sender_name,
            recipient
        );

        let recipient_online = self.registry.lookup(&recipient).is_some();
        match &event {
            ClientEvent::ChatRequest { .. } if recipient_online => {
                session.outstanding_requests.insert(recipient.clone());
            }
            ClientEvent::ChatRequestCancelled { .. } => {
                session.outstanding_requests.remove(&recipient);
            }
            ClientEvent::ChatResponse { .. } => {
                // The responder answered the recipient's request to them
                if let Some(requestor) = self
                    .registry
                    .lookup(&recipient)
                    .and_then(|id| self.sessions.get_mut(&id))
                {
                    requestor.outstanding_requests.remove(&sender_name);
                }
            }
            _ => {}
        }

        match self.outbox_for(&recipient) {
            Some(outbox) => {
                send(outbox, event.into_delivery(sender_name));
                self.stats.events_forwarded += 1;
                Ok(RouteOutcome::Forwarded { recipient })
            }
            None => {
                tracing::info!("{} not found (requested by {})", recipient, sender_name);
                if let Some(session) = self.sessions.get(connection) {
                    send(&session.outbox, ServerEvent::PeerNotFound(recipient.clone()));
                }
                self.stats.peers_not_found += 1;
                Ok(RouteOutcome::PeerNotFound { recipient })
            }
        }
    }

    fn outbox_for(&self, name: &str) -> Option<&Outbox> {
        let connection = self.registry.lookup(name)?;
        self.sessions.get(&connection).map(|s| &s.outbox)
    }

    fn broadcast_presence(&self) {
        let names = self.registry.names();
        for session in self.sessions.values() {
            send(&session.outbox, ServerEvent::UserList(names.clone()));
        }
    }

    /// Expire idle rate-limit buckets
    pub fn prune_rate_limits(&mut self) {
        self.limiter.prune();
    }

    /// Pseudonym of a connection
    pub fn name_of(&self, connection: &ConnectionId) -> Option<&str> {
        self.sessions.get(connection).map(|s| s.name.as_str())
    }

    /// Live names, sorted
    pub fn user_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Recipients of a connection's unanswered chat requests
    pub fn outstanding_requests(&self, connection: &ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .get(connection)
            .map(|s| s.outstanding_requests.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Get current relay statistics
    pub fn stats(&self) -> RelayStats {
        self.stats.clone()
    }
}

impl Default for SignallingRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn send(outbox: &Outbox, event: ServerEvent) {
    let name = event.event_name();
    if outbox.send(event).is_err() {
        // Socket task already gone; its disconnect is on the way
        tracing::debug!("Outbox closed, dropped {}", name);
    }
}

// ============================================================================
// TESTS
// ============================================================================
