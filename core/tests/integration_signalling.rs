//! Relay scenarios driven by raw JSON frames, as a browser would send them
//!
//! Run with: cargo test --test integration_signalling

use pairchat_core::protocol::{ChatResponse, ServerEvent};
use pairchat_core::relay::{
    ConnectionId, RateLimitConfig, RelayConfig, RouteOutcome, SignallingRelay,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct Browser {
    id: ConnectionId,
    name: String,
    rx: UnboundedReceiver<ServerEvent>,
}

impl Browser {
    fn connect(relay: &mut SignallingRelay) -> Self {
        let (tx, rx) = unbounded_channel();
        let (id, name) = relay.connect(tx).expect("Failed to connect");
        Self { id, name, rx }
    }

    /// Received frames as JSON, the way they leave the socket
    fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            let text = event.to_json().expect("Failed to encode");
            frames.push(serde_json::from_str(&text).expect("Invalid JSON"));
        }
        frames
    }

    fn send(&self, relay: &mut SignallingRelay, frame: Value) -> RouteOutcome {
        relay
            .handle_frame(&self.id, &frame.to_string())
            .expect("Failed to handle frame")
    }
}

#[test]
fn test_request_accept_offer_flow() {
    let mut relay = SignallingRelay::new();
    let mut a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);
    a.frames();
    b.frames();

    a.send(
        &mut relay,
        json!({"event": "chat-request", "data": {"recipientName": b.name}}),
    );
    assert_eq!(
        b.frames(),
        vec![json!({"event": "chat-request", "data": {"senderName": a.name}})]
    );

    b.send(
        &mut relay,
        json!({"event": "chat-response", "data": {"recipientName": a.name, "response": "accept"}}),
    );
    assert_eq!(
        a.frames(),
        vec![json!({"event": "chat-response", "data": {"senderName": b.name, "response": "accept"}})]
    );

    let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"});
    a.send(
        &mut relay,
        json!({"event": "rtc-offer", "data": {"recipientName": b.name, "offer": offer}}),
    );
    assert_eq!(
        b.frames(),
        vec![json!({"event": "rtc-offer", "data": {"senderName": a.name, "offer": offer}})]
    );
    assert!(a.frames().is_empty());
}

#[test]
fn test_ghost_recipient() {
    let mut relay = SignallingRelay::new();
    let mut a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);
    a.frames();
    b.frames();

    let outcome = a.send(
        &mut relay,
        json!({"event": "chat-request", "data": {"recipientName": "ghost"}}),
    );

    assert!(matches!(outcome, RouteOutcome::PeerNotFound { .. }));
    assert_eq!(
        a.frames(),
        vec![json!({"event": "peer-not-found", "data": "ghost"})]
    );
    assert!(b.frames().is_empty());
    assert_eq!(relay.stats().peers_not_found, 1);
}

#[test]
fn test_names_unique_across_churn() {
    let mut relay = SignallingRelay::new();
    let mut live: Vec<Browser> = Vec::new();

    for round in 0..100 {
        live.push(Browser::connect(&mut relay));
        if round % 3 == 0 {
            let gone = live.remove(0);
            relay.disconnect(&gone.id);
        }
        let names: HashSet<&str> = live.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names.len(), live.len());
    }
    assert_eq!(relay.user_names().len(), live.len());
}

#[test]
fn test_presence_lists_every_live_name() {
    let mut relay = SignallingRelay::new();
    let mut a = Browser::connect(&mut relay);
    let b = Browser::connect(&mut relay);
    let c = Browser::connect(&mut relay);

    let last = a.frames().pop().expect("No presence update");
    let mut expected = vec![a.name.clone(), b.name.clone(), c.name.clone()];
    expected.sort();
    assert_eq!(last, json!({"event": "user-list", "data": expected}));

    relay.disconnect(&b.id);
    let after = a.frames().pop().expect("No presence update");
    let listed: Vec<String> = serde_json::from_value(after["data"].clone()).unwrap();
    assert!(!listed.contains(&b.name));
    assert_eq!(listed.len(), 2);
}

#[test]
fn test_requestor_disconnect_cancels() {
    let mut relay = SignallingRelay::new();
    let a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);
    b.frames();

    a.send(
        &mut relay,
        json!({"event": "chat-request", "data": {"recipientName": b.name}}),
    );
    b.frames();

    relay.disconnect(&a.id);
    let frames = b.frames();
    assert_eq!(
        frames[0],
        json!({"event": "chat-request-cancelled", "data": {"senderName": a.name}})
    );
    assert_eq!(frames[1]["event"], "user-list");
}

#[test]
fn test_answered_request_not_cancelled_on_disconnect() {
    let mut relay = SignallingRelay::new();
    let a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);

    a.send(
        &mut relay,
        json!({"event": "chat-request", "data": {"recipientName": b.name}}),
    );
    b.send(
        &mut relay,
        json!({"event": "chat-response", "data": {"recipientName": a.name, "response": ChatResponse::Reject}}),
    );
    b.frames();

    relay.disconnect(&a.id);
    let events: Vec<Value> = b.frames().into_iter().map(|f| f["event"].clone()).collect();
    assert_eq!(events, vec![json!("user-list")]);
}

#[test]
fn test_rate_limited_sender_blocked() {
    let config = RelayConfig {
        socket_rate: RateLimitConfig {
            points: 10,
            window: Duration::from_secs(30),
        },
        ..Default::default()
    };
    let mut relay = SignallingRelay::with_config(config);
    let mut a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);
    a.frames();
    b.frames();

    let candidate = json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0"});
    let frame = json!({"event": "rtc-icecandidate", "data": {"recipientName": b.name, "iceCandidate": candidate}});
    for _ in 0..10 {
        a.send(&mut relay, frame.clone());
    }
    let outcome = a.send(&mut relay, frame);

    assert!(matches!(outcome, RouteOutcome::RateLimited { .. }));
    assert_eq!(b.frames().len(), 10);
    let blocked = a.frames();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0]["event"], "blocked");
    assert!(blocked[0]["data"]["retryAfterMs"].as_u64().unwrap() > 0);
}

#[test]
fn test_garbage_frames_counted_against_budget() {
    let config = RelayConfig {
        socket_rate: RateLimitConfig {
            points: 1,
            window: Duration::from_secs(30),
        },
        ..Default::default()
    };
    let mut relay = SignallingRelay::with_config(config);
    let mut a = Browser::connect(&mut relay);
    a.frames();

    let first = relay.handle_frame(&a.id, "garbage").unwrap();
    let second = relay.handle_frame(&a.id, "garbage").unwrap();
    assert_eq!(first, RouteOutcome::Malformed);
    assert!(matches!(second, RouteOutcome::RateLimited { .. }));
    assert_eq!(a.frames()[0]["event"], "blocked");
}

#[test]
fn test_payload_forwarded_verbatim() {
    let mut relay = SignallingRelay::new();
    let a = Browser::connect(&mut relay);
    let mut b = Browser::connect(&mut relay);
    b.frames();

    let answer = json!({"type": "answer", "sdp": "v=0", "unknownField": [1, {"x": null}]});
    a.send(
        &mut relay,
        json!({"event": "rtc-answer", "data": {"recipientName": b.name, "answer": answer}}),
    );
    assert_eq!(b.frames()[0]["data"]["answer"], answer);
}
