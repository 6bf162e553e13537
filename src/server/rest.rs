//! REST side-channel: liveness, track resolution, descriptor decoding.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::Gateway;
use super::ws::websocket_handler;
use crate::protocol::tracks::TrackInfo;

pub fn router(gateway: Arc<Gateway>) -> Router {
    let protected = Router::new()
        .route("/loadtracks", get(load_tracks))
        .route("/decodetracks", get(decode_tracks))
        .layer(middleware::from_fn_with_state(gateway.clone(), check_auth));

    // The root path serves both the liveness probe and the WebSocket
    // upgrade, like the upstream node.
    Router::new()
        .route("/", get(root))
        .merge(protected)
        .with_state(gateway)
}

async fn root(
    headers: axum::http::HeaderMap,
    ws: Option<axum::extract::ws::WebSocketUpgrade>,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    match ws {
        Some(upgrade) => match websocket_handler(headers, upgrade, State(gateway)).await {
            Ok(response) => response,
            Err(rejection) => rejection.into_response(),
        },
        None => Json("Ok boomer.").into_response(),
    }
}

async fn check_auth(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(password) = gateway.config.password() else {
        return Ok(next.run(req).await);
    };
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok());
    if presented == Some(password) {
        Ok(next.run(req).await)
    } else {
        warn!("REST authorization failed for {}", req.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Deserialize)]
struct LoadTracksQuery {
    identifier: Option<String>,
}

async fn load_tracks(
    Query(params): Query<LoadTracksQuery>,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    let Some(identifier) = params.identifier.filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "identifier is required"})),
        )
            .into_response();
    };

    info!("loadtracks: '{identifier}'");
    Json(gateway.sources.load(&identifier).await).into_response()
}

/// `?track=` is repeatable. One value returns the bare info object, more
/// return an ordered `[{track, info}]` array.
async fn decode_tracks(Query(params): Query<Vec<(String, String)>>) -> Response {
    let blobs: Vec<&String> = params
        .iter()
        .filter(|(name, _)| name == "track")
        .map(|(_, value)| value)
        .collect();

    if blobs.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "track is required"})),
        )
            .into_response();
    }

    let mut decoded = Vec::with_capacity(blobs.len());
    for blob in &blobs {
        match TrackInfo::decode(blob) {
            Some(info) => decoded.push(info),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "could not decode track"})),
                )
                    .into_response();
            }
        }
    }

    if decoded.len() == 1 {
        return Json(decoded.remove(0)).into_response();
    }

    let entries: Vec<serde_json::Value> = blobs
        .iter()
        .zip(decoded)
        .map(|(blob, info)| json!({"track": blob, "info": info}))
        .collect();
    Json(entries).into_response()
}
