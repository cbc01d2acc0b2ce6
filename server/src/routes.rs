//! HTTP + WebSocket front end

use crate::config::Config;
use crate::session::{run_session, Inbound, SharedRelay};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use pairchat_core::relay::{
    CredentialError, CredentialIssuer, IceServer, RateDecision, RateLimiter, SignallingRelay,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

/// Largest accepted credential request body
const MAX_BODY_BYTES: u64 = 4 * 1024;

/// How often idle rate-limit buckets are dropped
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state behind every route
pub struct AppState {
    pub relay: SharedRelay,
    pub issuer: Arc<dyn CredentialIssuer>,
    pub http_limiter: Mutex<RateLimiter<IpAddr>>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relay: Arc::new(Mutex::new(SignallingRelay::with_config(config.relay_config()))),
            issuer: config.credential_issuer(),
            http_limiter: Mutex::new(RateLimiter::new(config.http_rate())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IceServersRequest {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    connections: usize,
}

/// Result of a credential request before it becomes an HTTP response
#[derive(Debug, PartialEq)]
pub enum IceReply {
    Issued(Vec<IceServer>),
    RateLimited { retry_after: Duration },
    BadRequest(String),
    Unavailable(String),
}

impl IceReply {
    pub fn status(&self) -> StatusCode {
        match self {
            IceReply::Issued(_) => StatusCode::OK,
            IceReply::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            IceReply::BadRequest(_) => StatusCode::BAD_REQUEST,
            IceReply::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        match self {
            IceReply::Issued(ice_servers) => {
                warp::reply::with_status(
                    warp::reply::json(&IceServersResponse { ice_servers }),
                    status,
                )
                .into_response()
            }
            IceReply::RateLimited { retry_after } => {
                // Whole seconds, rounded up, never zero
                let secs = retry_after.as_millis().div_ceil(1000).max(1);
                let body = warp::reply::json(&ErrorBody {
                    error: "Too many requests".to_string(),
                });
                warp::reply::with_header(
                    warp::reply::with_status(body, status),
                    "Retry-After",
                    secs.to_string(),
                )
                .into_response()
            }
            IceReply::BadRequest(error) | IceReply::Unavailable(error) => {
                warp::reply::with_status(warp::reply::json(&ErrorBody { error }), status)
                    .into_response()
            }
        }
    }
}

/// Rate-limit, parse and issue for one credential request
pub async fn issue_ice_servers(state: &AppState, caller: IpAddr, body: &[u8]) -> IceReply {
    let decision = state.http_limiter.lock().consume(&caller, 1);
    if let RateDecision::Denied { retry_after } = decision {
        tracing::warn!("Credential rate limit hit by {}", caller);
        return IceReply::RateLimited { retry_after };
    }

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IceServersRequest::default()
    } else {
        match serde_json::from_slice::<IceServersRequest>(body) {
            Ok(request) => request,
            Err(e) => return IceReply::BadRequest(format!("Invalid request body: {}", e)),
        }
    };
    let subject = request.username.unwrap_or_else(|| "anonymous".to_string());

    match state.issuer.issue(&subject).await {
        Ok(servers) => IceReply::Issued(servers),
        Err(CredentialError::UpstreamUnavailable(reason)) => {
            tracing::error!("ICE provider unavailable: {}", reason);
            IceReply::Unavailable("ICE servers temporarily unavailable".to_string())
        }
        Err(e) => {
            tracing::error!("Credential issue failed: {}", e);
            IceReply::Unavailable("ICE servers temporarily unavailable".to_string())
        }
    }
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All routes, CORS applied
pub fn routes(
    state: Arc<AppState>,
    frontend_origin: &str,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    // 1. Signalling socket at /ws
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|ws: warp::ws::Ws, state: Arc<AppState>| {
            ws.on_upgrade(move |socket| handle_socket(socket, state.relay.clone()))
        });

    // 2. Relay credentials
    let ice_route = warp::path("get-ice-servers")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::addr::remote())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .then(
            |remote: Option<SocketAddr>, body: Bytes, state: Arc<AppState>| async move {
                let caller = remote
                    .map(|addr| addr.ip())
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                issue_ice_servers(&state, caller, &body).await.into_response()
            },
        );

    // 3. Health
    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            let connections = state.relay.lock().stats().connections_active;
            warp::reply::json(&HealthBody {
                status: "ok",
                connections,
            })
        });

    let cors = if frontend_origin == "*" {
        warp::cors().allow_any_origin()
    } else {
        warp::cors().allow_origin(frontend_origin)
    }
    .allow_methods(vec!["GET", "POST"])
    .allow_headers(vec!["content-type"]);

    ws_route
        .map(Reply::into_response)
        .or(ice_route)
        .unify()
        .or(health_route.map(Reply::into_response))
        .unify()
        .with(cors)
}

async fn handle_socket(socket: warp::ws::WebSocket, relay: SharedRelay) {
    let (sink, stream) = socket.split();

    let incoming = stream.map(|message| match message {
        Ok(message) if message.is_text() => match message.to_str() {
            Ok(text) => Inbound::Text(text.to_string()),
            Err(()) => Inbound::Ignored,
        },
        Ok(message) if message.is_close() => Inbound::Close,
        Ok(_) => Inbound::Ignored,
        Err(e) => {
            tracing::debug!("WebSocket error: {}", e);
            Inbound::Close
        }
    });
    let outgoing = sink.with(|frame: String| {
        future::ready(Ok::<_, warp::Error>(warp::ws::Message::text(frame)))
    });

    run_session(relay, incoming, outgoing).await;
}

/// Bind and serve until the process ends
pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(config));
    tracing::info!(
        "Credential strategy: {}",
        state.issuer.strategy()
    );

    let prune_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            prune_state.relay.lock().prune_rate_limits();
            prune_state.http_limiter.lock().prune();
        }
    });

    let routes = routes(state, &config.frontend_origin);
    tracing::info!("Signalling relay listening on 0.0.0.0:{}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
    Ok(())
}
