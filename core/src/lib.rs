// pairchat core
//
// Two halves of one handshake: the signalling relay that names browsers and
// forwards their negotiation events, and the client-side machinery that
// turns those events into a direct data channel.

pub mod client;
pub mod protocol;
pub mod relay;

pub use client::{
    ChatEvent, CoordinatorError, NegotiationCoordinator, PeerConnection, PeerSignal, PeerState,
    PeerTransport, TransportFactory,
};
pub use protocol::{ChatResponse, ClientEvent, IceCandidate, ProtocolError, ServerEvent, SessionDescription};
pub use relay::{
    CredentialIssuer, HmacCredentialIssuer, IceServer, RelayConfig, RelayError, SignallingRelay,
    UpstreamCredentialIssuer,
};
