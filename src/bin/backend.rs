#![forbid(unsafe_code)]

//! Axum backend for mixdeck.
//!
//! Serves the single-page client from `WWW_ROOT` and a small JSON API on top
//! of two third-party services: the YouTube Data API for the channel catalog
//! and a conversion service for download links. Handlers never see raw
//! upstream errors; the catalog degrades to an empty list and conversions come
//! back as a tagged failure.

use std::{
    any::Any,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use mime_guess::MimeGuess;
use mixdeck::{
    cache::{ResponseCache, connect_cache},
    catalog::{CatalogService, YoutubeCatalogSource},
    config::{DEFAULT_ENV_PATH, Environment, RuntimeOverrides, resolve_settings},
    conversion::{self, ConversionGateway, ConversionOutcome},
    models::{CatalogItem, ConversionRequest, DownloadOptions, MediaKind},
    rooms::{PlaybackUpdate, RoomHub, RoomMember},
    waveform::WaveformProvider,
};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// Upper bound for item ids and room names taken from the URL.
const MAX_SLUG_LEN: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Channel catalog and conversion API for mixdeck")]
struct BackendArgs {
    /// Directory holding the built single-page client.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Directory holding instance data such as stored waveforms.
    #[arg(long)]
    data_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// dotenv-style file read before the process environment.
    #[arg(long, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            www_root: self.www_root,
            data_root: self.data_root,
            port: self.port,
            host: self.host,
            env_path: Some(self.env_file),
        }
    }
}

/// Static facts about the running configuration, reported by `/api/health`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFlags {
    cache_backend: &'static str,
    catalog_configured: bool,
    converter_configured: bool,
    stored_waveforms: usize,
}

/// Shared state injected into every Axum handler. Everything is cheap to
/// clone; the services hold their own `Arc`s.
#[derive(Clone)]
struct AppState {
    catalog: CatalogService,
    converter: ConversionGateway,
    waveforms: Arc<WaveformProvider>,
    rooms: RoomHub,
    www_root: Arc<PathBuf>,
    environment: Environment,
    flags: Arc<ConfigFlags>,
    started_at: Instant,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// An upstream service failed or returned nothing usable.
    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    /// Details are only exposed in development.
    fn internal(environment: Environment, detail: impl Into<String>) -> Self {
        let message = if environment.is_development() {
            detail.into()
        } else {
            "internal server error".to_string()
        };
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime: f64,
    environment: Environment,
    config: ConfigFlags,
}

#[derive(Debug, Serialize)]
struct ChannelVideosResponse {
    success: bool,
    videos: Vec<CatalogItem>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct ChannelVideoResponse {
    success: bool,
    video: CatalogItem,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    success: bool,
    videos: Vec<CatalogItem>,
    query: String,
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadOptionsResponse {
    success: bool,
    options: DownloadOptions,
}

#[derive(Deserialize)]
struct DownloadParams {
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadLink {
    url: String,
    title: String,
    quality: String,
    format: MediaKind,
    expires: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    download: DownloadLink,
}

#[derive(Serialize)]
struct WaveformResponse {
    success: bool,
    waveform: Vec<u32>,
    duration: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = resolve_settings(BackendArgs::parse().into_overrides())
        .context("resolving runtime settings")?;
    let host = settings
        .host
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MIXDECK_HOST")?;

    let cache = connect_cache(&settings.cache).await;
    if !settings.catalog.is_configured() {
        warn!("CATALOG_API_KEY or CHANNEL_ID missing; the channel listing will be empty");
    }
    let catalog = CatalogService::new(
        cache.clone(),
        Arc::new(YoutubeCatalogSource::new(settings.catalog.clone())),
    );
    let converter = ConversionGateway::new(settings.converter.clone());
    if !converter.is_configured() {
        warn!("CONVERTER_API_URL missing; downloads and streaming will fail");
    }
    let waveforms = WaveformProvider::load(settings.data_root.as_deref());

    let flags = ConfigFlags {
        cache_backend: cache.backend_name(),
        catalog_configured: settings.catalog.is_configured(),
        converter_configured: converter.is_configured(),
        stored_waveforms: waveforms.stored_count(),
    };
    let state = AppState {
        catalog,
        converter,
        waveforms: Arc::new(waveforms),
        rooms: RoomHub::new(),
        www_root: Arc::new(settings.www_root.clone()),
        environment: settings.environment,
        flags: Arc::new(flags),
        started_at: Instant::now(),
    };

    let app = build_router(state);
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, environment = ?settings.environment, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let environment = state.environment;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/channel/videos", get(channel_videos))
        .route("/api/channel/videos/{id}", get(channel_video))
        .route("/api/search", get(search))
        .route("/api/download/options/{id}", get(download_options))
        .route("/api/download/{id}", get(download))
        .route("/api/stream/{id}", get(stream))
        .route("/api/waveform/{id}", get(waveform))
        .route("/api/sync/{room}", get(sync_room))
        .fallback(static_fallback)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(environment, panic),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still stops the process.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn panic_response(environment: Environment, panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|value| value.to_string()))
        .unwrap_or_else(|| "handler panicked".to_string());
    error!(%detail, "request handler panicked");
    ApiError::internal(environment, detail).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs_f64(),
        environment: state.environment,
        config: (*state.flags).clone(),
    })
}

/// An empty list is reported as a failure: at this layer an empty channel
/// and an unreachable catalog source look the same.
async fn channel_videos(State(state): State<AppState>) -> ApiResult<Json<ChannelVideosResponse>> {
    let videos = state.catalog.list_channel_items().await;
    if videos.is_empty() {
        return Err(ApiError::bad_gateway("failed to fetch channel videos"));
    }
    Ok(Json(ChannelVideosResponse {
        success: true,
        total: videos.len(),
        videos,
    }))
}

async fn channel_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ChannelVideoResponse>> {
    ensure_valid_slug(&id)?;
    let video = state
        .catalog
        .find_item(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("video {id} not found in channel catalog")))?;
    Ok(Json(ChannelVideoResponse {
        success: true,
        video,
    }))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let query = params
        .q
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("search query `q` is required"))?;
    let videos = state.catalog.search(&query).await;
    Ok(Json(SearchResponse {
        success: true,
        videos,
        query,
    }))
}

async fn download_options(
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadOptionsResponse>> {
    ensure_valid_slug(&id)?;
    Ok(Json(DownloadOptionsResponse {
        success: true,
        options: conversion::download_options(&id),
    }))
}

async fn download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Json<DownloadResponse>> {
    ensure_valid_slug(&id)?;
    let kind = match params.format.as_deref() {
        None => MediaKind::Audio,
        Some(raw) => MediaKind::parse(raw)
            .ok_or_else(|| ApiError::bad_request("format must be `audio` or `video`"))?,
    };
    let quality = params
        .quality
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| conversion::default_quality(kind).to_string());

    let request = ConversionRequest::new(id, kind, quality);
    match state.converter.convert(&request).await {
        ConversionOutcome::Ready(result) => Ok(Json(DownloadResponse {
            success: true,
            download: DownloadLink {
                url: result.download_url,
                title: result.title,
                quality: result.quality,
                format: result.media_kind,
                expires: result.expires_at,
            },
        })),
        ConversionOutcome::Failed { message } => {
            Err(ApiError::bad_gateway(format!("conversion failed: {message}")))
        }
    }
}

/// Redirects the player to a freshly converted audio URL.
///
/// Range requests get the same full redirect. `Accept-Ranges` is advertised
/// because the upstream file host serves ranges, but this endpoint never
/// slices bytes itself.
async fn stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_valid_slug(&id)?;
    if headers.contains_key(header::RANGE) {
        debug!(item = %id, "range request answered with a full redirect");
    }

    match state.converter.stream(&id).await {
        ConversionOutcome::Ready(result) => redirect_found(&result.download_url),
        ConversionOutcome::Failed { message } => {
            Err(ApiError::bad_gateway(format!("stream unavailable: {message}")))
        }
    }
}

fn redirect_found(location: &str) -> ApiResult<Response> {
    let location = HeaderValue::from_str(location)
        .map_err(|_| ApiError::bad_gateway("conversion service returned an unusable URL"))?;
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, location);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

async fn waveform(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<WaveformResponse>> {
    ensure_valid_slug(&id)?;
    let waveform = state.waveforms.waveform(&id);
    Ok(Json(WaveformResponse {
        success: true,
        waveform: waveform.samples,
        duration: waveform.duration,
    }))
}

async fn sync_room(
    State(state): State<AppState>,
    AxumPath(room): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    ensure_valid_slug(&room)?;
    let member = state.rooms.join(&room);
    Ok(ws.on_upgrade(move |socket| relay_room(socket, member)))
}

/// Pumps room updates to the socket and socket messages into the room until
/// either side goes away.
async fn relay_room(socket: WebSocket, member: RoomMember) {
    let publisher = member.publisher();
    let room = member.room().to_string();
    let (mut sink, mut stream) = socket.split();

    let mut outbound = tokio::spawn(async move {
        let mut member = member;
        while let Some(update) = member.next_update().await {
            let Ok(payload) = serde_json::to_string(&update) else {
                continue;
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let inbound_room = room.clone();
    let mut inbound = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<PlaybackUpdate>(text.as_str()) {
                    Ok(update) => publisher.publish(update),
                    Err(err) => debug!(room = %inbound_room, error = %err, "ignoring malformed sync message"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }
    debug!(%room, "sync connection closed");
}

/// Ids and room names are opaque to us but must stay URL- and key-safe.
fn ensure_valid_slug(value: &str) -> ApiResult<()> {
    let valid = !value.is_empty()
        && value.len() <= MAX_SLUG_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid id"))
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; anything with one is a real asset.
fn should_fallback_to_index(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
