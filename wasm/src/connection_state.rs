// Browser handle ownership
//
// Every browser object here carries JS callbacks backed by Rust closures.
// The closures are stored next to the handle instead of `.forget()`-ed, and
// the handlers are detached before the closures drop, so a late browser
// event can never call into freed memory.

use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{
    CloseEvent, Event, MessageEvent, RtcDataChannel, RtcDataChannelEvent, RtcDataChannelState,
    RtcPeerConnection, RtcPeerConnectionIceEvent, RtcPeerConnectionState, WebSocket,
};

/// Signalling WebSocket with its callbacks
pub struct ManagedWebSocket {
    websocket: WebSocket,
    onopen: Option<Closure<dyn FnMut(Event)>>,
    onmessage: Option<Closure<dyn FnMut(MessageEvent)>>,
    onerror: Option<Closure<dyn FnMut(Event)>>,
    onclose: Option<Closure<dyn FnMut(CloseEvent)>>,
}

impl ManagedWebSocket {
    pub fn new(url: &str) -> Result<Self, String> {
        let websocket =
            WebSocket::new(url).map_err(|e| format!("Failed to create WebSocket: {:?}", e))?;

        Ok(Self {
            websocket,
            onopen: None,
            onmessage: None,
            onerror: None,
            onclose: None,
        })
    }

    pub fn set_onopen<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(Event)>);
        self.websocket
            .set_onopen(Some(closure.as_ref().unchecked_ref()));
        self.onopen = Some(closure);
    }

    pub fn set_onmessage<F>(&mut self, callback: F)
    where
        F: FnMut(MessageEvent) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(MessageEvent)>);
        self.websocket
            .set_onmessage(Some(closure.as_ref().unchecked_ref()));
        self.onmessage = Some(closure);
    }

    pub fn set_onerror<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(Event)>);
        self.websocket
            .set_onerror(Some(closure.as_ref().unchecked_ref()));
        self.onerror = Some(closure);
    }

    pub fn set_onclose<F>(&mut self, callback: F)
    where
        F: FnMut(CloseEvent) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(CloseEvent)>);
        self.websocket
            .set_onclose(Some(closure.as_ref().unchecked_ref()));
        self.onclose = Some(closure);
    }

    /// Send one text frame
    pub fn send(&self, text: &str) -> Result<(), String> {
        self.websocket
            .send_with_str(text)
            .map_err(|e| format!("Failed to send frame: {:?}", e))
    }

    pub fn is_open(&self) -> bool {
        self.websocket.ready_state() == WebSocket::OPEN
    }

    pub fn close(&mut self) {
        let _ = self.websocket.close();
        self.cleanup_callbacks();
    }

    fn cleanup_callbacks(&mut self) {
        self.websocket.set_onopen(None);
        self.websocket.set_onmessage(None);
        self.websocket.set_onerror(None);
        self.websocket.set_onclose(None);

        self.onopen = None;
        self.onmessage = None;
        self.onerror = None;
        self.onclose = None;
    }
}

impl Drop for ManagedWebSocket {
    fn drop(&mut self) {
        self.cleanup_callbacks();
    }
}

/// `RTCPeerConnection` with its callbacks
pub struct ManagedRtcConnection {
    peer_connection: RtcPeerConnection,
    ondatachannel: Option<Closure<dyn FnMut(RtcDataChannelEvent)>>,
    onicecandidate: Option<Closure<dyn FnMut(RtcPeerConnectionIceEvent)>>,
    onconnectionstatechange: Option<Closure<dyn FnMut(Event)>>,
}

impl ManagedRtcConnection {
    pub fn new(config: &web_sys::RtcConfiguration) -> Result<Self, String> {
        let peer_connection = RtcPeerConnection::new_with_configuration(config)
            .map_err(|e| format!("Failed to create RTC peer connection: {:?}", e))?;

        Ok(Self {
            peer_connection,
            ondatachannel: None,
            onicecandidate: None,
            onconnectionstatechange: None,
        })
    }

    pub fn set_ondatachannel<F>(&mut self, callback: F)
    where
        F: FnMut(RtcDataChannelEvent) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(RtcDataChannelEvent)>);
        self.peer_connection
            .set_ondatachannel(Some(closure.as_ref().unchecked_ref()));
        self.ondatachannel = Some(closure);
    }

    pub fn set_onicecandidate<F>(&mut self, callback: F)
    where
        F: FnMut(RtcPeerConnectionIceEvent) + 'static,
    {
        let closure =
            Closure::wrap(Box::new(callback) as Box<dyn FnMut(RtcPeerConnectionIceEvent)>);
        self.peer_connection
            .set_onicecandidate(Some(closure.as_ref().unchecked_ref()));
        self.onicecandidate = Some(closure);
    }

    pub fn set_onconnectionstatechange<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(Event)>);
        self.peer_connection
            .set_onconnectionstatechange(Some(closure.as_ref().unchecked_ref()));
        self.onconnectionstatechange = Some(closure);
    }

    /// The raw handle, for promise-returning calls
    pub fn handle(&self) -> &RtcPeerConnection {
        &self.peer_connection
    }

    pub fn create_data_channel(&self, label: &str) -> RtcDataChannel {
        self.peer_connection.create_data_channel(label)
    }

    pub fn connection_state(&self) -> RtcPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub fn close(&mut self) {
        self.peer_connection.close();
        self.cleanup_callbacks();
    }

    fn cleanup_callbacks(&mut self) {
        self.peer_connection.set_ondatachannel(None);
        self.peer_connection.set_onicecandidate(None);
        self.peer_connection.set_onconnectionstatechange(None);

        self.ondatachannel = None;
        self.onicecandidate = None;
        self.onconnectionstatechange = None;
    }
}

impl Drop for ManagedRtcConnection {
    fn drop(&mut self) {
        self.cleanup_callbacks();
    }
}

/// `RTCDataChannel` with its callbacks
pub struct ManagedDataChannel {
    channel: RtcDataChannel,
    onopen: Option<Closure<dyn FnMut(Event)>>,
    onmessage: Option<Closure<dyn FnMut(MessageEvent)>>,
    onclose: Option<Closure<dyn FnMut(Event)>>,
}

impl ManagedDataChannel {
    pub fn new(channel: RtcDataChannel) -> Self {
        Self {
            channel,
            onopen: None,
            onmessage: None,
            onclose: None,
        }
    }

    pub fn set_onopen<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(Event)>);
        self.channel.set_onopen(Some(closure.as_ref().unchecked_ref()));
        self.onopen = Some(closure);
    }

    pub fn set_onmessage<F>(&mut self, callback: F)
    where
        F: FnMut(MessageEvent) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(MessageEvent)>);
        self.channel
            .set_onmessage(Some(closure.as_ref().unchecked_ref()));
        self.onmessage = Some(closure);
    }

    pub fn set_onclose<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(Event)>);
        self.channel.set_onclose(Some(closure.as_ref().unchecked_ref()));
        self.onclose = Some(closure);
    }

    pub fn label(&self) -> String {
        self.channel.label()
    }

    pub fn ready_state(&self) -> RtcDataChannelState {
        self.channel.ready_state()
    }

    pub fn send(&self, text: &str) -> Result<(), String> {
        self.channel
            .send_with_str(text)
            .map_err(|e| format!("Failed to send on data channel: {:?}", e))
    }

    pub fn close(&mut self) {
        self.channel.close();
        self.cleanup_callbacks();
    }

    fn cleanup_callbacks(&mut self) {
        self.channel.set_onopen(None);
        self.channel.set_onmessage(None);
        self.channel.set_onclose(None);

        self.onopen = None;
        self.onmessage = None;
        self.onclose = None;
    }
}

impl Drop for ManagedDataChannel {
    fn drop(&mut self) {
        self.cleanup_callbacks();
    }
}
