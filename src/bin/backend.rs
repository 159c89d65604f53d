#![forbid(unsafe_code)]

//! Axum backend for the tutorial generator.
//!
//! Serves the JSON API (video metadata lookup, proxied downloads, image
//! proxy) plus the SSE endpoint that streams generated tutorials, and falls
//! back to the static frontend for everything else.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, TryStreamExt};
use log::{info, warn};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{fs::File, signal, sync::mpsc};
use tokio_util::io::ReaderStream;
use tubetutor::{
    config::{Overrides, Settings, load_settings},
    engines::{EngineError, EngineOutcome, EngineStack, TutorialRequest},
    stream::{OutboundEvent, relay_chat_stream, replay_complete_text},
    videoinfo::{BILIBILI_REFERER, BROWSER_UA, VideoInfoError, lookup_video_info},
};

const PLAYURL_API: &str = "https://api.bilibili.com/x/player/playurl";

/// Streams above this size get a yt-dlp command instead of a proxied body.
const DIRECT_DOWNLOAD_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    host: Option<String>,
    port: Option<u16>,
    www_root: Option<PathBuf>,
    env_path: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                parsed.www_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                parsed.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(value);
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    parsed.www_root = Some(PathBuf::from(value));
                }
                "--env" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env requires a value"))?;
                    parsed.env_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> Overrides {
        Overrides {
            host: self.host,
            port: self.port,
            www_root: self.www_root,
            env_path: self.env_path,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    http: reqwest::Client,
    engines: Arc<EngineStack>,
    www_root: Option<Arc<PathBuf>>,
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoCaptions => ApiError::bad_request(err.to_string()),
            EngineError::Unconfigured => ApiError::internal(err.to_string()),
            EngineError::UpstreamRejected(_) => ApiError::bad_gateway(err.to_string()),
            EngineError::Unavailable(inner) => ApiError::internal(format!("教程生成失败: {inner}")),
        }
    }
}

impl From<VideoInfoError> for ApiError {
    fn from(err: VideoInfoError) -> Self {
        match err {
            VideoInfoError::Fetch(_) => ApiError::internal(err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = BackendArgs::parse()?;
    let settings = load_settings(args.into_overrides())?;
    run(settings).await
}

async fn run(settings: Settings) -> Result<()> {
    let host: IpAddr = settings
        .host
        .parse()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBETUTOR_HOST")?;
    let addr = SocketAddr::new(host, settings.port);

    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let state = AppState {
        engines: Arc::new(EngineStack::from_settings(&settings, http.clone())),
        www_root: settings.www_root.map(Arc::new),
        http,
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tutorial", post(generate_tutorial))
        .route("/api/video-info", post(get_video_info))
        .route("/api/download", post(download_video))
        .route("/api/image-proxy", get(image_proxy))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; the process still terminates when
    // Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {err}");
    }
}

/// Adapter from the relay channel to SSE events.
struct EventStream {
    rx: mpsc::Receiver<OutboundEvent>,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                Poll::Ready(Some(Ok(Event::default().data(event.payload()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// POST /api/tutorial
///
/// Dispatches across the engine stack, then serves the result as an SSE
/// stream. Engine failures surface as JSON errors before any event is sent;
/// once streaming starts the response always ends with a `[DONE]` record.
async fn generate_tutorial(
    State(state): State<AppState>,
    Json(payload): Json<TutorialRequest>,
) -> ApiResult<Response> {
    let outcome = state.engines.dispatch(&payload).await?;

    let (tx, rx) = mpsc::channel(32);
    match outcome {
        EngineOutcome::Complete(text) => {
            tokio::spawn(replay_complete_text(text, tx));
        }
        EngineOutcome::Stream(upstream) => {
            tokio::spawn(relay_chat_stream(upstream, tx));
        }
    }

    let mut response = Sse::new(EventStream { rx }).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

/// POST /api/video-info
async fn get_video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Response> {
    let url = payload
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("缺少视频链接"))?;

    let info = lookup_video_info(&state.http, url).await?;
    Ok(Json(info).into_response())
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    bvid: Option<String>,
    cid: Option<i64>,
}

/// POST /api/download
///
/// Resolves the playback URL for a Bilibili video and proxies the stream
/// with download headers. Large files are not proxied; the response carries
/// a ready-to-run yt-dlp command instead.
async fn download_video(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let (bvid, cid) = match (payload.bvid, payload.cid) {
        (Some(bvid), Some(cid)) if !bvid.trim().is_empty() => (bvid, cid),
        _ => return Err(ApiError::bad_request("缺少 bvid 或 cid")),
    };

    let playurl: serde_json::Value = state
        .http
        .get(PLAYURL_API)
        .query(&[
            ("bvid", bvid.as_str()),
            ("cid", &cid.to_string()),
            ("qn", "80"),
            ("fnval", "1"),
        ])
        .header("User-Agent", BROWSER_UA)
        .header("Referer", BILIBILI_REFERER)
        .send()
        .await
        .map_err(|err| ApiError::internal(format!("下载失败: {err}")))?
        .json()
        .await
        .map_err(|err| ApiError::internal(format!("下载失败: {err}")))?;

    let code = playurl["code"].as_i64().unwrap_or(-1);
    let stream_url = playurl["data"]["durl"][0]["url"].as_str();
    let (stream_url, size) = match (code, stream_url) {
        (0, Some(url)) => (
            url.to_string(),
            playurl["data"]["durl"][0]["size"].as_u64().unwrap_or(0),
        ),
        _ => {
            return Err(ApiError::bad_request("获取视频流地址失败，可能需要登录"));
        }
    };

    if size > DIRECT_DOWNLOAD_LIMIT {
        let body = serde_json::json!({
            "mode": "fallback",
            "message": "视频较大，请使用以下命令下载",
            "command": format!(
                "yt-dlp -f \"bestvideo+bestaudio\" --merge-output-format mp4 \"https://www.bilibili.com/video/{bvid}\""
            ),
            "size": size,
        });
        return Ok(Json(body).into_response());
    }

    let upstream = state
        .http
        .get(&stream_url)
        .header("User-Agent", BROWSER_UA)
        .header("Referer", BILIBILI_REFERER)
        .header(header::RANGE, "bytes=0-")
        .send()
        .await
        .map_err(|err| ApiError::internal(format!("下载失败: {err}")))?;

    if !upstream.status().is_success() {
        return Err(ApiError::bad_gateway("视频流获取失败"));
    }

    let body = Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());
    if let Ok(value) = format!("attachment; filename=\"{bvid}.mp4\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if size > 0 {
        headers.insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ImageProxyQuery {
    url: Option<String>,
}

/// GET /api/image-proxy?url=
///
/// Thumbnails and avatars on Bilibili's CDN reject cross-origin requests,
/// so the frontend loads them through here.
async fn image_proxy(
    State(state): State<AppState>,
    Query(query): Query<ImageProxyQuery>,
) -> ApiResult<Response> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;

    let upstream = state
        .http
        .get(url)
        .header("User-Agent", BROWSER_UA)
        .header("Referer", BILIBILI_REFERER)
        .send()
        .await
        .map_err(|_| ApiError::internal("Proxy error"))?;

    if !upstream.status().is_success() {
        return Err(ApiError::bad_gateway("Failed to fetch image"));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|_| ApiError::internal("Proxy error"))?;

    let mut response = Body::from(bytes).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        "public, max-age=86400, immutable".parse().unwrap(),
    );
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
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

/// SPA routes have no extension; anything else that is missing is a real 404.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mime = MimeGuess::from_path(&path).first();

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = body.into_response();
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
