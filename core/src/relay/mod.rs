//! Signalling relay
//!
//! Server-side half of the handshake: pseudonyms, presence, rate limits,
//! relay credentials and event forwarding between two named peers.

pub mod credentials;
pub mod rate_limit;
pub mod registry;
pub mod server;

pub use credentials::{
    CredentialError, CredentialIssuer, HmacCredentialIssuer, IceServer, IceUrls, RelayCredential,
    UpstreamConfig, UpstreamCredentialIssuer,
};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use registry::{ConnectionId, MonikerGenerator, NameGenerator, NameRegistry, RegistryError};
pub use server::{Outbox, RelayConfig, RelayError, RelayStats, RouteOutcome, SignallingRelay};
