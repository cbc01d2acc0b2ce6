// Client driver
//
// Everything that can happen to a browser client arrives as one `Input` on
// one queue: relay frames, socket open/close, transport callbacks, fetched
// ICE servers and UI commands. The driver applies them to the coordinator
// one at a time and forwards whatever the coordinator wants to say to the
// relay.

use crate::signalling::FrameSink;
use crate::transport::Generation;
use pairchat_core::client::{
    ChannelOf, ChatEvent, CoordinatorError, DataChannel, NegotiationCoordinator, PeerSignal,
    TransportFactory,
};
use pairchat_core::protocol::{ClientEvent, ServerEvent};
use pairchat_core::relay::IceServer;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// A UI request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RequestChat(String),
    CancelRequest(String),
    Accept(String),
    Reject(String),
    SendMessage { peer: String, text: String },
    EndConversation(String),
}

/// One unit of work for the driver
#[derive(Debug)]
pub enum Input<C> {
    Relay(ServerEvent),
    RelayOpen,
    RelayClosed,
    /// A callback from the connection `generation` with `peer`
    Transport {
        peer: String,
        generation: u64,
        signal: PeerSignal<C>,
    },
    IceServers(Vec<IceServer>),
    Command(Command),
    /// Close the socket and stop
    Shutdown,
}

/// Inputs for the browser transport
pub type ClientInput = Input<crate::transport::WebRtcChannel>;

/// Coordinator plus the socket it talks through
pub struct Driver<F: TransportFactory, S> {
    coordinator: NegotiationCoordinator<F>,
    socket: S,
    outbound: UnboundedReceiver<ClientEvent>,
    events: UnboundedReceiver<ChatEvent>,
}

impl<F, S> Driver<F, S>
where
    F: TransportFactory,
    F::Transport: Generation,
    S: FrameSink + SocketControl,
{
    pub fn new(factory: F, socket: S) -> Self {
        let (out_tx, outbound) = unbounded_channel();
        let (ev_tx, events) = unbounded_channel();
        Self {
            coordinator: NegotiationCoordinator::new(factory, out_tx, ev_tx),
            socket,
            outbound,
            events,
        }
    }

    pub fn coordinator(&self) -> &NegotiationCoordinator<F> {
        &self.coordinator
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Apply one input, then flush relay-bound events to the socket.
    /// A rejected UI command comes back as the error.
    pub async fn handle(&mut self, input: Input<ChannelOf<F>>) -> Result<(), CoordinatorError> {
        let result = self.dispatch(input).await;
        while let Ok(event) = self.outbound.try_recv() {
            self.socket.send_event(&event);
        }
        result
    }

    /// Chat events produced so far, oldest first
    pub fn drain_events(&mut self) -> Vec<ChatEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    async fn dispatch(&mut self, input: Input<ChannelOf<F>>) -> Result<(), CoordinatorError> {
        match input {
            Input::Relay(event) => self.coordinator.handle_server_event(event).await,
            Input::RelayOpen => self.socket.opened(),
            Input::RelayClosed => {
                self.socket.closed();
                self.coordinator.relay_disconnected();
            }
            Input::Transport {
                peer,
                generation,
                signal,
            } => self.transport_signal(&peer, generation, signal),
            Input::IceServers(servers) => self.coordinator.set_ice_servers(servers),
            Input::Command(command) => return self.run_command(command),
            Input::Shutdown => {
                self.socket.shut();
                self.coordinator.relay_disconnected();
            }
        }
        Ok(())
    }

    /// Callbacks from a connection that has since been replaced are dropped
    fn transport_signal(&mut self, peer: &str, generation: u64, signal: PeerSignal<ChannelOf<F>>) {
        let current = self.coordinator.transport(peer).map(Generation::generation);
        match current {
            Some(current) if current != generation => {
                tracing::debug!(
                    "Signal from connection {} with {} dropped; current is {}",
                    generation,
                    peer,
                    current
                );
                if let PeerSignal::ChannelCreated(channel) = signal {
                    channel.close();
                }
            }
            _ => self.coordinator.handle_transport_event(peer, signal),
        }
    }

    fn run_command(&mut self, command: Command) -> Result<(), CoordinatorError> {
        match command {
            Command::RequestChat(peer) => self.coordinator.request_chat(&peer),
            Command::CancelRequest(peer) => self.coordinator.cancel_request(&peer),
            Command::Accept(peer) => self.coordinator.accept(&peer),
            Command::Reject(peer) => self.coordinator.reject(&peer),
            Command::SendMessage { peer, text } => self.coordinator.send_message(&peer, &text),
            Command::EndConversation(peer) => self.coordinator.end_conversation(&peer),
        }
    }
}

/// Socket lifecycle as seen by the driver
pub trait SocketControl {
    fn opened(&mut self);
    fn closed(&mut self);
    /// Close from our side
    fn shut(&mut self);
}

impl SocketControl for crate::signalling::SignallingSocket {
    fn opened(&mut self) {
        self.mark_open();
    }

    fn closed(&mut self) {
        self.mark_closed();
    }

    fn shut(&mut self) {
        self.close();
    }
}

/// A [`ChatEvent`] shaped for JavaScript
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiEvent {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl UiEvent {
    fn peer(kind: &'static str, peer: &str) -> Self {
        Self {
            kind,
            peer: Some(peer.to_string()),
            ..Default::default()
        }
    }

    /// A UI command the coordinator refused
    pub fn command_failed(reason: impl Into<String>) -> Self {
        Self {
            kind: "error",
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

impl From<&ChatEvent> for UiEvent {
    fn from(event: &ChatEvent) -> Self {
        match event {
            ChatEvent::Registered { name } => Self {
                kind: "registered",
                name: Some(name.clone()),
                ..Default::default()
            },
            ChatEvent::PresenceChanged(names) => Self {
                kind: "presence",
                names: Some(names.clone()),
                ..Default::default()
            },
            ChatEvent::IncomingRequest { peer } => Self::peer("incoming-request", peer),
            ChatEvent::RequestCancelled { peer } => Self::peer("request-cancelled", peer),
            ChatEvent::RequestRejected { peer } => Self::peer("request-rejected", peer),
            ChatEvent::PeerNotFound { peer } => Self::peer("peer-not-found", peer),
            ChatEvent::Blocked { retry_after } => Self {
                kind: "blocked",
                retry_after_ms: Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)),
                ..Default::default()
            },
            ChatEvent::Connected { peer } => Self::peer("connected", peer),
            ChatEvent::MessageReceived { peer, text } => Self {
                text: Some(text.clone()),
                ..Self::peer("message", peer)
            },
            ChatEvent::ConversationEnded { peer } => Self::peer("conversation-ended", peer),
            ChatEvent::ConnectionFailed { peer, reason } => Self {
                reason: Some(reason.clone()),
                ..Self::peer("connection-failed", peer)
            },
            ChatEvent::RelayLost => Self {
                kind: "relay-lost",
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalling::{SignallingSocket, SocketPhase};
    use crate::transport::WebRtcFactory;
    use futures::channel::mpsc;
    use pairchat_core::protocol::ChatResponse;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_test::block_on;

    type TestDriver = Driver<WebRtcFactory, SignallingSocket>;

    fn driver() -> TestDriver {
        let (inputs, _rx) = mpsc::unbounded();
        let socket = SignallingSocket::connect("ws://localhost:8000/ws", inputs.clone()).unwrap();
        Driver::new(WebRtcFactory::new(inputs), socket)
    }

    fn registered(name: &str) -> TestDriver {
        let mut driver = driver();
        block_on(driver.handle(Input::RelayOpen)).unwrap();
        block_on(driver.handle(Input::Relay(ServerEvent::AssignName(name.to_string())))).unwrap();
        driver.drain_events();
        driver
    }

    fn written<F>(driver: &mut Driver<F, SignallingSocket>) -> Vec<Value>
    where
        F: TransportFactory,
        F::Transport: Generation,
    {
        driver
            .socket_mut()
            .take_written()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    #[test]
    fn test_registration_and_presence() {
        let mut driver = driver();
        block_on(driver.handle(Input::Relay(ServerEvent::AssignName("quiet-heron".into())))).unwrap();
        block_on(driver.handle(Input::Relay(ServerEvent::UserList(vec![
            "quiet-heron".into(),
            "brave-otter".into(),
        ]))))
        .unwrap();

        assert_eq!(
            driver.drain_events(),
            vec![
                ChatEvent::Registered {
                    name: "quiet-heron".into()
                },
                ChatEvent::PresenceChanged(vec!["quiet-heron".into(), "brave-otter".into()]),
            ]
        );
        assert_eq!(driver.coordinator().local_name(), Some("quiet-heron"));
    }

    #[test]
    fn test_request_held_until_socket_opens() {
        let mut driver = driver();
        block_on(driver.handle(Input::Relay(ServerEvent::AssignName("quiet-heron".into())))).unwrap();
        block_on(driver.handle(Input::Command(Command::RequestChat("brave-otter".into())))).unwrap();
        assert!(written(&mut driver).is_empty());

        block_on(driver.handle(Input::RelayOpen)).unwrap();
        assert_eq!(
            written(&mut driver),
            vec![json!({"event": "chat-request", "data": {"recipientName": "brave-otter"}})]
        );
    }

    #[test]
    fn test_accept_then_offer_without_webrtc() {
        let mut driver = registered("quiet-heron");
        block_on(driver.handle(Input::Relay(ServerEvent::ChatRequest {
            sender_name: "brave-otter".into(),
        })))
        .unwrap();
        block_on(driver.handle(Input::Command(Command::Accept("brave-otter".into())))).unwrap();
        assert_eq!(
            written(&mut driver),
            vec![json!({"event": "chat-response", "data": {"recipientName": "brave-otter", "response": "accept"}})]
        );

        // No browser: the offer cannot be answered and the UI hears why
        block_on(driver.handle(Input::Relay(ServerEvent::RtcOffer {
            sender_name: "brave-otter".into(),
            offer: json!({"type": "offer", "sdp": "v=0"}),
        })))
        .unwrap();
        let events = driver.drain_events();
        assert!(matches!(
            events.last(),
            Some(ChatEvent::ConnectionFailed { peer, .. }) if peer == "brave-otter"
        ));
        assert!(written(&mut driver).is_empty());
    }

    #[test]
    fn test_refused_command_is_reported() {
        let mut driver = registered("quiet-heron");
        let err = block_on(driver.handle(Input::Command(Command::Accept("nobody".into()))))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPendingRequest(_)));

        let err = block_on(driver.handle(Input::Command(Command::SendMessage {
            peer: "nobody".into(),
            text: "hi".into(),
        })))
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::NoConnection(_)));
    }

    #[test]
    fn test_rejected_request() {
        let mut driver = registered("quiet-heron");
        block_on(driver.handle(Input::Command(Command::RequestChat("brave-otter".into())))).unwrap();
        block_on(driver.handle(Input::Relay(ServerEvent::ChatResponse {
            sender_name: "brave-otter".into(),
            response: ChatResponse::Reject,
        })))
        .unwrap();

        assert_eq!(
            driver.drain_events(),
            vec![ChatEvent::RequestRejected {
                peer: "brave-otter".into()
            }]
        );
    }

    #[test]
    fn test_relay_closed_ends_everything() {
        let mut driver = registered("quiet-heron");
        block_on(driver.handle(Input::Command(Command::RequestChat("brave-otter".into())))).unwrap();
        block_on(driver.handle(Input::RelayClosed)).unwrap();

        assert_eq!(driver.drain_events(), vec![ChatEvent::RelayLost]);
        assert!(!driver.coordinator().has_outgoing_request("brave-otter"));
        assert_eq!(driver.socket_mut().phase(), SocketPhase::Closed);
    }

    #[test]
    fn test_shutdown_closes_socket() {
        let mut driver = registered("quiet-heron");
        block_on(driver.handle(Input::Shutdown)).unwrap();
        assert_eq!(driver.socket_mut().phase(), SocketPhase::Closed);
        assert_eq!(driver.drain_events(), vec![ChatEvent::RelayLost]);
    }

    #[test]
    fn test_ice_servers_stored() {
        let mut driver = registered("quiet-heron");
        let servers = vec![IceServer::open("stun:turn.example.org:3478")];
        block_on(driver.handle(Input::IceServers(servers.clone()))).unwrap();
        assert_eq!(driver.coordinator().ice_servers(), servers.as_slice());
    }

    mod stub {
        use crate::transport::Generation;
        use async_trait::async_trait;
        use pairchat_core::client::{
            ChannelStatus, DataChannel, PeerTransport, TransportError, TransportFactory,
        };
        use pairchat_core::protocol::{IceCandidate, SessionDescription};
        use pairchat_core::relay::IceServer;
        use std::cell::Cell;
        use std::rc::Rc;

        #[derive(Clone)]
        pub struct StubChannel(pub Rc<Cell<ChannelStatus>>);

        impl DataChannel for StubChannel {
            fn label(&self) -> String {
                "chat".to_string()
            }

            fn status(&self) -> ChannelStatus {
                self.0.get()
            }

            fn send(&self, _text: &str) -> Result<(), TransportError> {
                Ok(())
            }

            fn close(&self) {
                self.0.set(ChannelStatus::Closed);
            }
        }

        pub struct StubTransport {
            generation: u64,
        }

        #[async_trait(?Send)]
        impl PeerTransport for StubTransport {
            type Channel = StubChannel;

            fn create_data_channel(&mut self, _label: &str) -> Result<StubChannel, TransportError> {
                Ok(StubChannel(Rc::new(Cell::new(ChannelStatus::Pending))))
            }

            async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
                Ok(SessionDescription::offer("v=0"))
            }

            async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
                Ok(SessionDescription::answer("v=0"))
            }

            async fn set_local_description(
                &mut self,
                _description: &SessionDescription,
            ) -> Result<(), TransportError> {
                Ok(())
            }

            async fn set_remote_description(
                &mut self,
                _description: &SessionDescription,
            ) -> Result<(), TransportError> {
                Ok(())
            }

            async fn add_ice_candidate(
                &mut self,
                _candidate: &IceCandidate,
            ) -> Result<(), TransportError> {
                Ok(())
            }

            fn close(&mut self) {}
        }

        impl Generation for StubTransport {
            fn generation(&self) -> u64 {
                self.generation
            }
        }

        #[derive(Default)]
        pub struct StubFactory {
            created: u64,
        }

        impl TransportFactory for StubFactory {
            type Transport = StubTransport;

            fn create(
                &mut self,
                _peer: &str,
                _ice_servers: &[IceServer],
            ) -> Result<StubTransport, TransportError> {
                self.created += 1;
                Ok(StubTransport {
                    generation: self.created,
                })
            }
        }
    }

    #[test]
    fn test_signals_from_replaced_connection_dropped() {
        use pairchat_core::client::{ChannelStatus, PeerState, TransportState};
        use pairchat_core::protocol::IceCandidate;
        use std::cell::Cell;
        use std::rc::Rc;
        use stub::{StubChannel, StubFactory};

        let (inputs, _rx) = mpsc::unbounded();
        let mut socket = SignallingSocket::connect("ws://localhost:8000/ws", inputs).unwrap();
        socket.mark_open();
        let mut driver = Driver::new(StubFactory::default(), socket);
        block_on(driver.handle(Input::Relay(ServerEvent::AssignName("quiet-heron".into())))).unwrap();

        let connect = |driver: &mut Driver<StubFactory, SignallingSocket>| {
            block_on(driver.handle(Input::Command(Command::RequestChat("brave-otter".into()))))
                .unwrap();
            block_on(driver.handle(Input::Relay(ServerEvent::ChatResponse {
                sender_name: "brave-otter".into(),
                response: ChatResponse::Accept,
            })))
            .unwrap();
        };

        connect(&mut driver);
        block_on(driver.handle(Input::Command(Command::EndConversation("brave-otter".into()))))
            .unwrap();
        connect(&mut driver);
        assert_eq!(driver.coordinator().transport("brave-otter").map(|t| t.generation()), Some(2));
        driver.socket_mut().take_written();
        driver.drain_events();

        // Late callbacks from the first connection
        block_on(driver.handle(Input::Transport {
            peer: "brave-otter".into(),
            generation: 1,
            signal: PeerSignal::StateChanged(TransportState::Failed),
        }))
        .unwrap();
        let stray = StubChannel(Rc::new(Cell::new(ChannelStatus::Ready)));
        block_on(driver.handle(Input::Transport {
            peer: "brave-otter".into(),
            generation: 1,
            signal: PeerSignal::ChannelCreated(stray.clone()),
        }))
        .unwrap();
        block_on(driver.handle(Input::Transport {
            peer: "brave-otter".into(),
            generation: 1,
            signal: PeerSignal::LocalCandidate(IceCandidate::new("candidate:1")),
        }))
        .unwrap();

        assert_eq!(
            driver.coordinator().peer_state("brave-otter"),
            Some(&PeerState::OfferCreated)
        );
        assert_eq!(stray.0.get(), ChannelStatus::Closed);
        assert!(driver.drain_events().is_empty());
        assert!(written(&mut driver).is_empty());

        // The current connection still gets through
        block_on(driver.handle(Input::Transport {
            peer: "brave-otter".into(),
            generation: 2,
            signal: PeerSignal::LocalCandidate(IceCandidate::new("candidate:2")),
        }))
        .unwrap();
        assert_eq!(
            written(&mut driver),
            vec![json!({"event": "rtc-icecandidate", "data": {
                "recipientName": "brave-otter",
                "iceCandidate": {"candidate": "candidate:2"}
            }})]
        );
    }

    #[test]
    fn test_ui_event_shapes() {
        let message = UiEvent::from(&ChatEvent::MessageReceived {
            peer: "brave-otter".into(),
            text: "hi".into(),
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"kind": "message", "peer": "brave-otter", "text": "hi"})
        );

        let blocked = UiEvent::from(&ChatEvent::Blocked {
            retry_after: Duration::from_millis(1500),
        });
        assert_eq!(
            serde_json::to_value(&blocked).unwrap(),
            json!({"kind": "blocked", "retryAfterMs": 1500})
        );

        let lost = UiEvent::from(&ChatEvent::RelayLost);
        assert_eq!(serde_json::to_value(&lost).unwrap(), json!({"kind": "relay-lost"}));

        let failed = UiEvent::command_failed("No name assigned yet");
        assert_eq!(failed.kind, "error");
    }
}
