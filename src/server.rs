use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::channel::{Bandwidth, ChannelRange};
use crate::controller::ControllerHandle;
use crate::error::DfsError;
use crate::event::StartParams;
use crate::registry::SessionId;

pub struct ServerConfig {
    pub port: u16,
}

pub fn router(controller: ControllerHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/sessions/:id/start", post(start_handler))
        .route("/sessions/:id/stop", post(stop_handler))
        .route("/radar", post(radar_handler))
        .layer(cors)
        .with_state(controller)
}

pub async fn run_server(config: ServerConfig, controller: ControllerHandle) -> anyhow::Result<()> {
    let app = router(controller);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Control API listening on http://localhost:{}", config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(e: DfsError) -> Response {
    let status = match e {
        DfsError::UnknownSession(_) => StatusCode::NOT_FOUND,
        DfsError::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn accepted(id: SessionId, action: &str) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "session": id, "action": action }))).into_response()
}

async fn status_handler(State(controller): State<ControllerHandle>) -> Response {
    match controller.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartQuery {
    bandwidth: Option<Bandwidth>,
    first: Option<u8>,
    last: Option<u8>,
}

impl StartQuery {
    fn params(&self) -> Result<StartParams, DfsError> {
        let channels = match (self.first, self.last) {
            (None, None) => None,
            (first, last) => {
                let first = first.or(last).unwrap_or_default();
                Some(ChannelRange::new(first, last.unwrap_or(first))?)
            }
        };
        Ok(StartParams { bandwidth: self.bandwidth, channels })
    }
}

async fn start_handler(
    State(controller): State<ControllerHandle>,
    Path(id): Path<u32>,
    Query(query): Query<StartQuery>,
) -> Response {
    let id = SessionId(id);
    let result = query.params().and_then(|params| controller.start(id, params));
    match result {
        Ok(()) => accepted(id, "start"),
        Err(e) => error_response(e),
    }
}

async fn stop_handler(State(controller): State<ControllerHandle>, Path(id): Path<u32>) -> Response {
    let id = SessionId(id);
    let known = match controller.status().await {
        Ok(status) => status.sessions.iter().any(|s| s.id == id),
        Err(e) => return error_response(e),
    };
    if !known {
        return error_response(DfsError::UnknownSession(id));
    }
    match controller.stop(id) {
        Ok(()) => accepted(id, "stop"),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RadarQuery {
    channels: String,
}

fn parse_channels(list: &str) -> Result<Vec<u8>, DfsError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u8>()
                .map_err(|_| DfsError::Config(format!("invalid channel '{}'", s)))
        })
        .collect()
}

async fn radar_handler(
    State(controller): State<ControllerHandle>,
    Query(query): Query<RadarQuery>,
) -> Response {
    let channels = match parse_channels(&query.channels) {
        Ok(channels) if !channels.is_empty() => channels,
        Ok(_) => return error_response(DfsError::Config("no channels given".to_string())),
        Err(e) => return error_response(e),
    };
    warn!("Injected radar on {:?}", channels);
    match controller.radar(channels.clone()) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "radar": channels }))).into_response(),
        Err(e) => error_response(e),
    }
}
