//! pairchat signalling relay server
//!
//! Wires the core relay to a warp front end: `/ws` for signalling sockets,
//! `POST /get-ice-servers` for relay credentials and `GET /health`.

pub mod config;
pub mod routes;
pub mod session;

pub use config::Config;
pub use routes::{routes, serve, AppState};
pub use session::{run_session, Inbound, SharedRelay};
