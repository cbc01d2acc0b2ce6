// Signalling socket
//
// One WebSocket to the relay carrying JSON text frames. Inbound frames are
// parsed into `ServerEvent`s and posted to the client's input queue; the
// socket opening and closing are posted too. Frames sent before the socket
// opens are held and flushed in order once the driver learns it is open.

use crate::transport::InputSender;
use pairchat_core::protocol::ClientEvent;

#[cfg(target_arch = "wasm32")]
use crate::connection_state::ManagedWebSocket;
#[cfg(target_arch = "wasm32")]
use crate::driver::Input;

/// Where the driver writes encoded relay frames
pub trait FrameSink {
    fn send_event(&mut self, event: &ClientEvent);
}

/// Connection phase of the signalling socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    Connecting,
    Open,
    Closed,
}

/// The client's WebSocket to the relay
pub struct SignallingSocket {
    phase: SocketPhase,
    /// Frames waiting for the socket to open
    pending: Vec<String>,
    #[cfg(target_arch = "wasm32")]
    socket: ManagedWebSocket,
    /// Frames "on the wire" when there is no browser socket
    #[cfg(not(target_arch = "wasm32"))]
    written: Vec<String>,
}

impl std::fmt::Debug for SignallingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignallingSocket")
            .field("phase", &self.phase)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SignallingSocket {
    /// Open the socket and route its events into `inputs`.
    ///
    /// On non-WASM targets no connection is made; the socket stays in
    /// `Connecting` until [`SignallingSocket::mark_open`] and keeps written
    /// frames for inspection.
    pub fn connect(url: &str, inputs: InputSender) -> Result<Self, String> {
        #[cfg(target_arch = "wasm32")]
        {
            use pairchat_core::protocol::ServerEvent;

            let mut socket = ManagedWebSocket::new(url)?;

            {
                let inputs = inputs.clone();
                socket.set_onopen(move |_| {
                    tracing::info!("Signalling socket open");
                    let _ = inputs.unbounded_send(Input::RelayOpen);
                });
            }
            {
                let inputs = inputs.clone();
                socket.set_onmessage(move |evt: web_sys::MessageEvent| {
                    let Some(text) = evt.data().as_string() else {
                        tracing::warn!("Binary signalling frame ignored");
                        return;
                    };
                    match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            tracing::debug!("Relay → {}", event.event_name());
                            let _ = inputs.unbounded_send(Input::Relay(event));
                        }
                        Err(e) => tracing::warn!("Unreadable relay frame: {}", e),
                    }
                });
            }
            socket.set_onerror(|e: web_sys::Event| {
                tracing::warn!("Signalling socket error: {:?}", e);
            });
            {
                let inputs = inputs.clone();
                socket.set_onclose(move |evt: web_sys::CloseEvent| {
                    tracing::warn!("Signalling socket closed (code {})", evt.code());
                    let _ = inputs.unbounded_send(Input::RelayClosed);
                });
            }

            tracing::info!("Connecting to relay at {}", url);
            Ok(Self {
                phase: SocketPhase::Connecting,
                pending: Vec::new(),
                socket,
            })
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = (url, inputs);
            Ok(Self {
                phase: SocketPhase::Connecting,
                pending: Vec::new(),
                written: Vec::new(),
            })
        }
    }

    pub fn phase(&self) -> SocketPhase {
        self.phase
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The socket reported open: flush everything held so far
    pub fn mark_open(&mut self) {
        if self.phase != SocketPhase::Connecting {
            return;
        }
        self.phase = SocketPhase::Open;
        for frame in std::mem::take(&mut self.pending) {
            self.write(frame);
        }
    }

    /// The socket is gone; later frames are dropped
    pub fn mark_closed(&mut self) {
        self.phase = SocketPhase::Closed;
        if !self.pending.is_empty() {
            tracing::warn!("{} unsent signalling frames dropped", self.pending.len());
            self.pending.clear();
        }
    }

    /// Close from our side
    pub fn close(&mut self) {
        #[cfg(target_arch = "wasm32")]
        {
            self.socket.close();
        }
        self.mark_closed();
    }

    pub fn send_frame(&mut self, frame: String) {
        match self.phase {
            SocketPhase::Connecting => self.pending.push(frame),
            SocketPhase::Open => self.write(frame),
            SocketPhase::Closed => tracing::debug!("Signalling socket closed; frame dropped"),
        }
    }

    fn write(&mut self, frame: String) {
        #[cfg(target_arch = "wasm32")]
        {
            if let Err(e) = self.socket.send(&frame) {
                tracing::warn!("{}", e);
            }
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            self.written.push(frame);
        }
    }

    /// Frames written so far, oldest first
    #[cfg(not(target_arch = "wasm32"))]
    pub fn take_written(&mut self) -> Vec<String> {
        std::mem::take(&mut self.written)
    }
}

impl FrameSink for SignallingSocket {
    fn send_event(&mut self, event: &ClientEvent) {
        match event.to_json() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => tracing::warn!("Failed to encode {}: {}", event.event_name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use serde_json::{json, Value};

    fn socket() -> SignallingSocket {
        let (inputs, _rx) = mpsc::unbounded();
        SignallingSocket::connect("ws://localhost:8000/ws", inputs).unwrap()
    }

    fn request(peer: &str) -> ClientEvent {
        ClientEvent::ChatRequest {
            recipient_name: peer.to_string(),
        }
    }

    #[test]
    fn test_frames_held_until_open() {
        let mut socket = socket();
        socket.send_event(&request("a"));
        socket.send_event(&request("b"));

        assert_eq!(socket.phase(), SocketPhase::Connecting);
        assert_eq!(socket.pending(), 2);
        assert!(socket.take_written().is_empty());

        socket.mark_open();
        socket.send_event(&request("c"));

        let recipients: Vec<Value> = socket
            .take_written()
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["data"]["recipientName"].clone())
            .collect();
        assert_eq!(recipients, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(socket.pending(), 0);
    }

    #[test]
    fn test_frame_shape() {
        let mut socket = socket();
        socket.mark_open();
        socket.send_event(&request("quiet-heron"));

        let frame: Value = serde_json::from_str(&socket.take_written()[0]).unwrap();
        assert_eq!(
            frame,
            json!({"event": "chat-request", "data": {"recipientName": "quiet-heron"}})
        );
    }

    #[test]
    fn test_closed_socket_drops_frames() {
        let mut socket = socket();
        socket.send_event(&request("a"));
        socket.close();

        assert_eq!(socket.phase(), SocketPhase::Closed);
        assert_eq!(socket.pending(), 0);

        socket.send_event(&request("b"));
        socket.mark_open();
        assert_eq!(socket.phase(), SocketPhase::Closed);
        assert!(socket.take_written().is_empty());
    }
}
