//! Route handlers.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use cardstream_engine::{SessionStream, ServiceStats};
use cardstream_types::{CardId, ConnectionId, GenerationRequest, Layout, StreamError};

use crate::error::ApiError;
use crate::AppState;

pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started.elapsed().as_secs(),
        "activeConnections": state.service.store().len(),
        "shuttingDown": state.service.is_shutting_down(),
    }))
}

pub async fn topics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "topics": state.service.catalog().topics() }))
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream") || v.contains("*/*"))
}

/// Turn an opened session into a streaming response. The skeleton is already
/// buffered, so the first body chunk is always the skeleton frame.
fn sse_response(stream: SessionStream) -> Response {
    let connection_id = stream.connection_id.clone();
    let body = Body::from_stream(stream.into_stream().map(Ok::<_, Infallible>));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(connection_id.as_str()) {
        headers.insert(CONNECTION_ID_HEADER, value);
    }
    response
}

pub async fn stream_presentation(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> ApiResult<Response> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let stream = state.service.open(request)?;
    Ok(sse_response(stream))
}

/// Body of the single-card stream: one card of `topic`, optionally pinned to
/// a layout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleCardRequest {
    pub topic: String,
    #[serde(default)]
    pub layout_type: Option<Layout>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub include_images: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

impl SingleCardRequest {
    fn into_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.topic, 1);
        if let Some(style) = self.style {
            request.style = style;
        }
        request.include_images = self.include_images;
        if let Some(provider) = self.provider {
            request.image_provider = provider;
        }
        request.layouts = self.layout_type.map(|layout| vec![layout]);
        request
    }
}

pub async fn stream_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SingleCardRequest>, JsonRejection>,
) -> ApiResult<Response> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }
    let Json(card) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let stream = state.service.open(card.into_request())?;
    Ok(sse_response(stream))
}

#[derive(Debug, Deserialize)]
pub struct DemoParams {
    /// Per-card stagger in milliseconds.
    pub delay: Option<u64>,
}

/// Two cards of the first catalog topic, paced for watching in a browser.
pub async fn stream_demo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DemoParams>,
) -> ApiResult<Response> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }
    let topic = state
        .service
        .catalog()
        .topics()
        .into_iter()
        .next()
        .ok_or_else(|| StreamError::Other("The content catalog is empty".into()))?;
    let request = GenerationRequest::new(topic, 2).with_delay(params.delay.unwrap_or(500));
    let stream = state.service.open(request)?;
    Ok(sse_response(stream))
}

pub async fn stream_stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.service.stats())
}

pub async fn list_connections(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connections": state.service.store().list() }))
}

pub async fn cancel_stream(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = ConnectionId::from(connection_id);
    if state.service.cancel(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StreamError::ConnectionNotFound(id).into())
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub async fn image_providers(State(state): State<AppState>) -> Json<Value> {
    let images = state.service.images();
    Json(json!({
        "providers": images.provider_names(),
        "fallbackEnabled": images.config().fallback_enabled,
        "fallbackChain": images.config().fallback_chain,
    }))
}

pub async fn image_stats(State(state): State<AppState>) -> Json<Value> {
    let images = state.service.images();
    Json(json!({
        "jobs": images.tracker().stats(),
        "activeJobs": images.active_jobs(),
    }))
}

pub async fn image_status(
    State(state): State<AppState>,
    Path(card_id): Path<String>,
) -> ApiResult<Response> {
    let card = CardId::from(card_id);
    match state.service.images().tracker().get(&card) {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(StreamError::ImageNotFound(card).into()),
    }
}

pub async fn cancel_image(
    State(state): State<AppState>,
    Path(card_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let card = CardId::from(card_id);
    if state.service.images().cancel(&card) {
        Ok(Json(json!({
            "message": "Image generation cancelled",
            "cardId": card,
        })))
    } else {
        Err(StreamError::ImageNotFound(card).into())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegenerateBody {
    pub provider: Option<String>,
}

pub async fn regenerate_image(
    State(state): State<AppState>,
    Path(card_id): Path<String>,
    body: Option<Json<RegenerateBody>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let card = CardId::from(card_id);
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let images = state.service.images();
    images.regenerate(&card, body.provider.as_deref())?;

    let provider = images
        .tracker()
        .get(&card)
        .map(|status| status.provider)
        .unwrap_or_default();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Image regeneration started",
            "cardId": card,
            "provider": provider,
        })),
    ))
}
