// Plain HTTP status surface, served on the same port as the WebSocket
// endpoint.
//
// - `GET /count`: live lobby and socket counts as JSON.
// - `GET /lobbies`, `GET /sessions`: debug listings, 404 unless the relay was
//   started with `debug_endpoints`.
// - Anything else: a short text body. `HEAD` on any path answers 200 with no
//   body, for load-balancer probes.
//
// Handlers only read: every answer comes from the relay task via
// `AppState::query`, and a relay that has already shut down yields 503.

use axum::Json;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::server::{AppState, RelayEvent};

const BANNER: &str = "lobby relay\n";

pub(crate) async fn count(State(state): State<AppState>) -> Response {
    json_or_unavailable(state.query(|reply| RelayEvent::Stats { reply }).await)
}

pub(crate) async fn lobbies(method: Method, State(state): State<AppState>) -> Response {
    if !state.debug_endpoints {
        return disabled(&method);
    }
    json_or_unavailable(state.query(|reply| RelayEvent::Lobbies { reply }).await)
}

pub(crate) async fn sessions(method: Method, State(state): State<AppState>) -> Response {
    if !state.debug_endpoints {
        return disabled(&method);
    }
    json_or_unavailable(state.query(|reply| RelayEvent::Sessions { reply }).await)
}

pub(crate) async fn fallback(method: Method) -> Response {
    if method == Method::HEAD {
        return StatusCode::OK.into_response();
    }
    BANNER.into_response()
}

fn disabled(method: &Method) -> Response {
    if *method == Method::HEAD {
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn json_or_unavailable<T: Serialize>(answer: Option<T>) -> Response {
    match answer {
        Some(body) => Json(body).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
