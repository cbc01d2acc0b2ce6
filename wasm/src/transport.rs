// Browser WebRTC transport
//
// `RTCPeerConnection` and `RTCDataChannel` behind the core transport traits.
// Promise-returning calls are awaited with `JsFuture`; browser callbacks are
// turned into `PeerSignal`s and posted to the client's input queue, tagged
// with the remote peer's name and the generation of the connection that
// raised them. A name can outlive several connections, so the generation is
// what tells a late callback from a current one.
//
// On non-WASM targets the factory refuses to create transports, so the
// types stay usable in native builds and tests without conditional
// compilation at every call site.

use crate::driver::{ClientInput, Input};
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use pairchat_core::client::{
    ChannelStatus, DataChannel, PeerSignal, PeerTransport, TransportError, TransportFactory,
};
use pairchat_core::protocol::{IceCandidate, SessionDescription};
use pairchat_core::relay::IceServer;

#[cfg(target_arch = "wasm32")]
use crate::connection_state::{ManagedDataChannel, ManagedRtcConnection};
#[cfg(target_arch = "wasm32")]
use pairchat_core::client::TransportState;
#[cfg(target_arch = "wasm32")]
use std::cell::RefCell;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::{JsCast, JsValue};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen_futures::JsFuture;

/// Sender half of the client input queue
pub type InputSender = UnboundedSender<ClientInput>;

#[cfg(not(target_arch = "wasm32"))]
const UNAVAILABLE: &str = "WebRTC not available outside WASM";

/// Identifies one transport among all a factory has created
pub trait Generation {
    fn generation(&self) -> u64;
}

#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
fn post(inputs: &InputSender, peer: &str, generation: u64, signal: PeerSignal<WebRtcChannel>) {
    let input = Input::Transport {
        peer: peer.to_string(),
        generation,
        signal,
    };
    if inputs.unbounded_send(input).is_err() {
        tracing::debug!("Client stopped; transport event for {} dropped", peer);
    }
}

/// Serialize through JSON into a plain JS object
#[cfg(target_arch = "wasm32")]
fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, String> {
    let json = serde_json::to_string(value).map_err(|e| e.to_string())?;
    js_sys::JSON::parse(&json).map_err(|e| format!("{:?}", e))
}

/// Read a plain JS object (or anything with `toJSON`) back through JSON
#[cfg(target_arch = "wasm32")]
fn from_js<T: serde::de::DeserializeOwned>(value: &JsValue) -> Result<T, String> {
    let json = js_sys::JSON::stringify(value)
        .ok()
        .and_then(|s| s.as_string())
        .ok_or_else(|| "stringify failed".to_string())?;
    serde_json::from_str(&json).map_err(|e| e.to_string())
}

/// The chat data channel
pub struct WebRtcChannel {
    label: String,
    #[cfg(target_arch = "wasm32")]
    inner: RefCell<ManagedDataChannel>,
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.label)
            .field("status", &self.status())
            .finish()
    }
}

impl WebRtcChannel {
    /// Wrap a browser channel and route its events to `peer`'s connection
    #[cfg(target_arch = "wasm32")]
    fn wire(raw: web_sys::RtcDataChannel, peer: &str, generation: u64, inputs: &InputSender) -> Self {
        let mut managed = ManagedDataChannel::new(raw);

        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            managed.set_onopen(move |_| {
                tracing::info!("Data channel with {} open", peer);
                post(&inputs, &peer, generation, PeerSignal::ChannelOpen);
            });
        }
        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            managed.set_onmessage(move |evt: web_sys::MessageEvent| match evt.data().as_string() {
                Some(text) => post(&inputs, &peer, generation, PeerSignal::ChannelMessage(text)),
                None => tracing::warn!("Non-text data channel frame from {}; ignored", peer),
            });
        }
        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            managed.set_onclose(move |_| {
                tracing::info!("Data channel with {} closed", peer);
                post(&inputs, &peer, generation, PeerSignal::ChannelClosed);
            });
        }

        Self {
            label: managed.label(),
            inner: RefCell::new(managed),
        }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn status(&self) -> ChannelStatus {
        #[cfg(target_arch = "wasm32")]
        {
            use web_sys::RtcDataChannelState;
            match self.inner.borrow().ready_state() {
                RtcDataChannelState::Open => ChannelStatus::Ready,
                RtcDataChannelState::Connecting => ChannelStatus::Pending,
                _ => ChannelStatus::Closed,
            }
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            ChannelStatus::Closed
        }
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            self.inner.borrow().send(text).map_err(TransportError::Channel)
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = text;
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    fn close(&self) {
        #[cfg(target_arch = "wasm32")]
        {
            self.inner.borrow_mut().close();
        }
    }
}

/// One browser peer connection
pub struct WebRtcTransport {
    peer: String,
    generation: u64,
    #[cfg(target_arch = "wasm32")]
    connection: ManagedRtcConnection,
    #[cfg(target_arch = "wasm32")]
    inputs: InputSender,
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .finish()
    }
}

impl WebRtcTransport {
    /// Open an `RTCPeerConnection` for `peer` and wire its callbacks
    #[cfg(target_arch = "wasm32")]
    fn open(
        peer: &str,
        generation: u64,
        ice_servers: &[IceServer],
        inputs: InputSender,
    ) -> Result<Self, TransportError> {
        let config = web_sys::RtcConfiguration::new();
        let servers = to_js(&ice_servers).map_err(TransportError::Unavailable)?;
        js_sys::Reflect::set(&config, &JsValue::from_str("iceServers"), &servers)
            .map_err(|e| TransportError::Unavailable(format!("{:?}", e)))?;

        let mut connection =
            ManagedRtcConnection::new(&config).map_err(TransportError::Unavailable)?;

        // Responder side: the offerer's channel arrives here
        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            connection.set_ondatachannel(move |evt: web_sys::RtcDataChannelEvent| {
                tracing::info!("Inbound data channel from {}", peer);
                let channel = WebRtcChannel::wire(evt.channel(), &peer, generation, &inputs);
                post(&inputs, &peer, generation, PeerSignal::ChannelCreated(channel));
            });
        }

        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            connection.set_onicecandidate(move |evt: web_sys::RtcPeerConnectionIceEvent| {
                let Some(candidate) = evt.candidate() else {
                    tracing::debug!("ICE gathering complete for {}", peer);
                    return;
                };
                match from_js::<IceCandidate>(&candidate) {
                    Ok(candidate) => {
                        post(&inputs, &peer, generation, PeerSignal::LocalCandidate(candidate))
                    }
                    Err(e) => tracing::warn!("Unreadable local candidate dropped: {}", e),
                }
            });
        }

        {
            let (peer, inputs) = (peer.to_string(), inputs.clone());
            let handle = connection.handle().clone();
            connection.set_onconnectionstatechange(move |_| {
                use web_sys::RtcPeerConnectionState as Rtc;
                let state = match handle.connection_state() {
                    Rtc::New => TransportState::New,
                    Rtc::Connecting => TransportState::Connecting,
                    Rtc::Connected => TransportState::Connected,
                    Rtc::Disconnected => TransportState::Disconnected,
                    Rtc::Failed => TransportState::Failed,
                    Rtc::Closed => TransportState::Closed,
                    _ => return,
                };
                tracing::debug!("Connection with {} is {:?}", peer, state);
                post(&inputs, &peer, generation, PeerSignal::StateChanged(state));
            });
        }

        Ok(Self {
            peer: peer.to_string(),
            generation,
            connection,
            inputs,
        })
    }

    #[cfg(target_arch = "wasm32")]
    async fn describe(&self, promise: js_sys::Promise) -> Result<SessionDescription, TransportError> {
        let value = JsFuture::from(promise)
            .await
            .map_err(|e| TransportError::Negotiation(format!("{:?}", e)))?;
        from_js(&value).map_err(TransportError::Negotiation)
    }

    #[cfg(target_arch = "wasm32")]
    fn description_init(
        description: &SessionDescription,
    ) -> Result<web_sys::RtcSessionDescriptionInit, TransportError> {
        Ok(to_js(description)
            .map_err(TransportError::Negotiation)?
            .unchecked_into())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait(?Send)]
impl PeerTransport for WebRtcTransport {
    type Channel = WebRtcChannel;

    fn create_data_channel(&mut self, label: &str) -> Result<WebRtcChannel, TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let raw = self.connection.create_data_channel(label);
            Ok(WebRtcChannel::wire(raw, &self.peer, self.generation, &self.inputs))
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = label;
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let promise = self.connection.handle().create_offer();
            self.describe(promise).await
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let promise = self.connection.handle().create_answer();
            self.describe(promise).await
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let init = Self::description_init(description)?;
            JsFuture::from(self.connection.handle().set_local_description(&init))
                .await
                .map_err(|e| TransportError::Negotiation(format!("{:?}", e)))?;
            Ok(())
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = description;
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let init = Self::description_init(description)?;
            JsFuture::from(self.connection.handle().set_remote_description(&init))
                .await
                .map_err(|e| TransportError::Negotiation(format!("{:?}", e)))?;
            Ok(())
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = description;
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let init: web_sys::RtcIceCandidateInit = to_js(candidate)
                .map_err(TransportError::Candidate)?
                .unchecked_into();
            JsFuture::from(
                self.connection
                    .handle()
                    .add_ice_candidate_with_opt_rtc_ice_candidate_init(Some(&init)),
            )
            .await
            .map_err(|e| TransportError::Candidate(format!("{:?}", e)))?;
            Ok(())
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = candidate;
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }

    fn close(&mut self) {
        tracing::debug!("Closing peer connection with {}", self.peer);
        #[cfg(target_arch = "wasm32")]
        {
            self.connection.close();
        }
    }
}

impl Generation for WebRtcTransport {
    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Creates browser peer connections whose callbacks feed the input queue
pub struct WebRtcFactory {
    inputs: InputSender,
    created: usize,
    next_generation: u64,
}

impl WebRtcFactory {
    pub fn new(inputs: InputSender) -> Self {
        Self {
            inputs,
            created: 0,
            next_generation: 1,
        }
    }

    /// Peer connections opened so far
    pub fn created(&self) -> usize {
        self.created
    }
}

impl TransportFactory for WebRtcFactory {
    type Transport = WebRtcTransport;

    fn create(
        &mut self,
        peer: &str,
        ice_servers: &[IceServer],
    ) -> Result<WebRtcTransport, TransportError> {
        #[cfg(target_arch = "wasm32")]
        {
            let generation = self.next_generation;
            self.next_generation += 1;
            let transport = WebRtcTransport::open(peer, generation, ice_servers, self.inputs.clone())?;
            self.created += 1;
            tracing::info!(
                "Peer connection for {} opened with {} ICE servers",
                peer,
                ice_servers.len()
            );
            Ok(transport)
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = (peer, ice_servers, &self.inputs, self.next_generation);
            Err(TransportError::Unavailable(UNAVAILABLE.to_string()))
        }
    }
}
