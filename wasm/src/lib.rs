// pairchat-wasm — browser bindings for the chat client

#[cfg(target_arch = "wasm32")]
pub mod connection_state;
pub mod driver;
pub mod ice;
pub mod signalling;
pub mod transport;

use crate::driver::{ClientInput, Command, Driver, Input, UiEvent};
use crate::signalling::SignallingSocket;
use crate::transport::{InputSender, WebRtcFactory};
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::StreamExt;
use pairchat_core::client::ChatEvent;
use wasm_bindgen::prelude::*;

static LOGGING: std::sync::Once = std::sync::Once::new();

/// Install the console logger and panic hook; later calls do nothing
#[wasm_bindgen]
pub fn init_logging() {
    console_error_panic_hook::set_once();
    LOGGING.call_once(tracing_wasm::set_as_global_default);
}

/// One browser tab's chat client.
///
/// Construction opens the signalling socket; every later event is reported
/// through `on_event` as a plain object with a `kind` field.
#[wasm_bindgen]
pub struct ChatClient {
    inputs: InputSender,
}

#[wasm_bindgen]
impl ChatClient {
    /// `signalling_url` is the relay's WebSocket (`ws://host/ws`),
    /// `ice_endpoint` its credential route (`http://host/get-ice-servers`).
    #[wasm_bindgen(constructor)]
    pub fn new(
        signalling_url: String,
        ice_endpoint: String,
        on_event: js_sys::Function,
    ) -> Result<ChatClient, JsValue> {
        init_logging();

        let (inputs, queue) = mpsc::unbounded();
        let socket = SignallingSocket::connect(&signalling_url, inputs.clone())
            .map_err(|e| JsValue::from_str(&e))?;
        let driver = Driver::new(WebRtcFactory::new(inputs.clone()), socket);

        wasm_bindgen_futures::spawn_local(run(driver, queue, inputs.clone(), ice_endpoint, on_event));
        Ok(Self { inputs })
    }

    #[wasm_bindgen(js_name = requestChat)]
    pub fn request_chat(&self, peer: String) {
        self.command(Command::RequestChat(peer));
    }

    #[wasm_bindgen(js_name = cancelRequest)]
    pub fn cancel_request(&self, peer: String) {
        self.command(Command::CancelRequest(peer));
    }

    pub fn accept(&self, peer: String) {
        self.command(Command::Accept(peer));
    }

    pub fn reject(&self, peer: String) {
        self.command(Command::Reject(peer));
    }

    #[wasm_bindgen(js_name = sendMessage)]
    pub fn send_message(&self, peer: String, text: String) {
        self.command(Command::SendMessage { peer, text });
    }

    #[wasm_bindgen(js_name = endConversation)]
    pub fn end_conversation(&self, peer: String) {
        self.command(Command::EndConversation(peer));
    }

    /// Leave the relay; every conversation ends
    pub fn disconnect(&self) {
        let _ = self.inputs.unbounded_send(Input::Shutdown);
    }

    fn command(&self, command: Command) {
        if self.inputs.unbounded_send(Input::Command(command)).is_err() {
            tracing::warn!("Chat client already stopped");
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let _ = self.inputs.unbounded_send(Input::Shutdown);
    }
}

/// The client loop: sole owner of the coordinator and the socket
async fn run(
    mut driver: Driver<WebRtcFactory, SignallingSocket>,
    mut queue: UnboundedReceiver<ClientInput>,
    inputs: InputSender,
    ice_endpoint: String,
    on_event: js_sys::Function,
) {
    while let Some(input) = queue.next().await {
        let stopping = matches!(input, Input::Shutdown);

        if let Err(e) = driver.handle(input).await {
            tracing::warn!("Command refused: {}", e);
            emit(&on_event, &UiEvent::command_failed(e.to_string()));
        }

        for event in driver.drain_events() {
            if let ChatEvent::Registered { name } = &event {
                fetch_ice_servers(ice_endpoint.clone(), name.clone(), inputs.clone());
            }
            emit(&on_event, &UiEvent::from(&event));
        }

        if stopping {
            break;
        }
    }
    tracing::info!("Chat client stopped");
}

/// Fetch relay credentials in the background; connections opened before
/// they arrive use direct paths only.
fn fetch_ice_servers(endpoint: String, username: String, inputs: InputSender) {
    wasm_bindgen_futures::spawn_local(async move {
        match ice::fetch_ice_servers(&endpoint, &username).await {
            Ok(servers) => {
                let _ = inputs.unbounded_send(Input::IceServers(servers));
            }
            Err(e) => tracing::warn!("No ICE servers: {}", e),
        }
    });
}

fn emit(on_event: &js_sys::Function, event: &UiEvent) {
    let value = match serde_wasm_bindgen::to_value(event) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Cannot convert {} event: {}", event.kind, e);
            return;
        }
    };
    if let Err(e) = on_event.call1(&JsValue::NULL, &value) {
        tracing::warn!("Event callback threw: {:?}", e);
    }
}
