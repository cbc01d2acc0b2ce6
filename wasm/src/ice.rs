// ICE server fetch
//
// Asks the relay's HTTP side for STUN/TURN descriptors for this client's
// pseudonym: `POST <endpoint>` with `{"username": name}`, answered by
// `{"iceServers": [...]}`.

use pairchat_core::relay::IceServer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ICE fetch error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch not available: {0}")]
    Unavailable(String),
    #[error("Rate limited; retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("Relay answered HTTP {0}")]
    Status(u16),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Serialize)]
struct IceServersRequest<'a> {
    username: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

pub fn request_body(username: &str) -> String {
    serde_json::to_string(&IceServersRequest { username })
        .unwrap_or_else(|_| String::from("{}"))
}

pub fn parse_response(body: &str) -> Result<Vec<IceServer>, FetchError> {
    serde_json::from_str::<IceServersResponse>(body)
        .map(|response| response.ice_servers)
        .map_err(|e| FetchError::InvalidResponse(e.to_string()))
}

/// Map an HTTP status to the error it stands for, if any
pub fn check_status(status: u16, retry_after: Option<&str>) -> Result<(), FetchError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(FetchError::RateLimited {
            retry_after_secs: retry_after.and_then(|v| v.trim().parse().ok()),
        }),
        other => Err(FetchError::Status(other)),
    }
}

/// Fetch ICE servers for `username` from `endpoint`
pub async fn fetch_ice_servers(
    endpoint: &str,
    username: &str,
) -> Result<Vec<IceServer>, FetchError> {
    #[cfg(target_arch = "wasm32")]
    {
        use wasm_bindgen::{JsCast, JsValue};
        use wasm_bindgen_futures::JsFuture;
        use web_sys::{Request, RequestInit, RequestMode, Response};

        let js_err = |e: JsValue| FetchError::Unavailable(format!("{:?}", e));

        let window =
            web_sys::window().ok_or_else(|| FetchError::Unavailable("no window".to_string()))?;

        let init = RequestInit::new();
        init.set_method("POST");
        init.set_mode(RequestMode::Cors);
        init.set_body(&JsValue::from_str(&request_body(username)));

        let request = Request::new_with_str_and_init(endpoint, &init).map_err(js_err)?;
        request
            .headers()
            .set("Content-Type", "application/json")
            .map_err(js_err)?;

        let response: Response = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(js_err)?
            .dyn_into()
            .map_err(|_| FetchError::InvalidResponse("not a Response".to_string()))?;

        let retry_after = response.headers().get("Retry-After").ok().flatten();
        check_status(response.status(), retry_after.as_deref())?;

        let body = JsFuture::from(response.text().map_err(js_err)?)
            .await
            .map_err(js_err)?
            .as_string()
            .ok_or_else(|| FetchError::InvalidResponse("body is not text".to_string()))?;

        let servers = parse_response(&body)?;
        tracing::info!("Received {} ICE servers", servers.len());
        Ok(servers)
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let _ = (endpoint, username);
        Err(FetchError::Unavailable(
            "fetch not available outside WASM".to_string(),
        ))
    }
}
