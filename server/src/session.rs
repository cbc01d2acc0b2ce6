//! One signalling socket, start to finish
//!
//! The socket-facing halves are generic so sessions can run over warp's
//! WebSocket in production and plain channels in tests.

use futures::{Sink, SinkExt, Stream, StreamExt};
use pairchat_core::relay::SignallingRelay;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The relay shared by every session
pub type SharedRelay = Arc<Mutex<SignallingRelay>>;

/// An incoming socket message, reduced to what the relay cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
    /// Pings, pongs and binary frames
    Ignored,
}

/// Run one connection until the client goes away.
///
/// Each frame is handled to completion under the relay lock before the
/// next is read; outbound events are written by a separate task in the
/// order the relay produced them.
pub async fn run_session<In, Out>(relay: SharedRelay, mut incoming: In, mut outgoing: Out)
where
    In: Stream<Item = Inbound> + Unpin,
    Out: Sink<String> + Unpin + Send + 'static,
{
    let (outbox, mut events) = mpsc::unbounded_channel();
    let connected = relay.lock().connect(outbox);
    let connection = match connected {
        Ok((connection, _)) => connection,
        Err(e) => {
            tracing::warn!("Refusing socket: {}", e);
            let _ = outgoing.close().await;
            return;
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Failed to encode {}: {}", event.event_name(), e);
                    continue;
                }
            };
            if outgoing.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = incoming.next().await {
        match message {
            Inbound::Text(frame) => {
                let handled = relay.lock().handle_frame(&connection, &frame);
                if let Err(e) = handled {
                    tracing::warn!("Dropping socket {}: {}", connection, e);
                    break;
                }
            }
            Inbound::Close => break,
            Inbound::Ignored => {}
        }
    }

    relay.lock().disconnect(&connection);
    // The relay dropped our outbox, so the writer drains and stops
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use pairchat_core::protocol::ServerEvent;
    use serde_json::json;

    fn shared() -> SharedRelay {
        Arc::new(Mutex::new(SignallingRelay::new()))
    }

    struct Socket {
        to_server: fmpsc::UnboundedSender<Inbound>,
        from_server: fmpsc::UnboundedReceiver<String>,
        task: tokio::task::JoinHandle<()>,
    }

    fn open(relay: &SharedRelay) -> Socket {
        let (to_server, incoming) = fmpsc::unbounded();
        let (outgoing, from_server) = fmpsc::unbounded();
        let task = tokio::spawn(run_session(relay.clone(), incoming, outgoing));
        Socket {
            to_server,
            from_server,
            task,
        }
    }

    async fn next_event(socket: &mut Socket) -> ServerEvent {
        let frame = socket.from_server.next().await.expect("Socket closed");
        ServerEvent::from_json(&frame).expect("Bad frame")
    }

    #[tokio::test]
    async fn test_session_assigns_name_and_cleans_up() {
        let relay = shared();
        let mut socket = open(&relay);

        let name = match next_event(&mut socket).await {
            ServerEvent::AssignName(name) => name,
            other => panic!("Expected name, got {:?}", other),
        };
        assert_eq!(
            next_event(&mut socket).await,
            ServerEvent::UserList(vec![name.clone()])
        );
        assert_eq!(relay.lock().user_names(), vec![name]);

        socket.to_server.unbounded_send(Inbound::Close).unwrap();
        socket.task.await.expect("Session panicked");
        assert!(relay.lock().user_names().is_empty());
        assert!(socket.from_server.next().await.is_none());
    }

    #[tokio::test]
    async fn test_frames_routed_between_sessions() {
        let relay = shared();
        let mut a = open(&relay);
        let a_name = match next_event(&mut a).await {
            ServerEvent::AssignName(name) => name,
            other => panic!("Expected name, got {:?}", other),
        };
        next_event(&mut a).await;

        let mut b = open(&relay);
        let b_name = match next_event(&mut b).await {
            ServerEvent::AssignName(name) => name,
            other => panic!("Expected name, got {:?}", other),
        };
        next_event(&mut b).await;
        next_event(&mut a).await;

        let frame = json!({"event": "chat-request", "data": {"recipientName": b_name}});
        a.to_server
            .unbounded_send(Inbound::Text(frame.to_string()))
            .unwrap();
        assert_eq!(
            next_event(&mut b).await,
            ServerEvent::ChatRequest {
                sender_name: a_name.clone()
            }
        );

        drop(a.to_server);
        a.task.await.unwrap();
        assert_eq!(
            next_event(&mut b).await,
            ServerEvent::ChatRequestCancelled {
                sender_name: a_name
            }
        );
        assert_eq!(
            next_event(&mut b).await,
            ServerEvent::UserList(vec![b_name])
        );
    }

    #[tokio::test]
    async fn test_full_relay_refuses_socket() {
        let relay = Arc::new(Mutex::new(SignallingRelay::with_config(
            pairchat_core::RelayConfig {
                max_connections: 0,
                ..Default::default()
            },
        )));
        let mut socket = open(&relay);
        socket.task.await.unwrap();
        assert!(socket.from_server.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ignored_frames_keep_session_open() {
        let relay = shared();
        let mut socket = open(&relay);
        next_event(&mut socket).await;
        next_event(&mut socket).await;

        socket.to_server.unbounded_send(Inbound::Ignored).unwrap();
        socket
            .to_server
            .unbounded_send(Inbound::Text("{broken".to_string()))
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(relay.lock().user_names().len(), 1);
    }
}
