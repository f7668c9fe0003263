//! The streaming HTTP surface.
//!
//! Five endpoints form the playback contract: the HLS manifest, init
//! segment, and numbered media segments for a chosen variant, plus original
//! passthrough with range support and a single-blob transcode. Cache misses
//! funnel through the generation gate so one encoder run serves every
//! concurrent request for a variant.

use crate::api::middleware::RequireAuth;
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::{StreamFormat, StreamVariant, Track};
use crate::services::cache::CacheKey;
use crate::services::manifest;
use crate::services::transcoder::{HlsJob, Transcoder};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::warn;

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp4";
const IMMUTABLE_CACHE: &str = "private, max-age=31536000, immutable";

pub fn streaming_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stream/:track_id", get(stream_original))
        .route("/stream/:track_id/manifest.m3u8", get(stream_manifest))
        .route("/stream/:track_id/init.mp4", get(stream_init))
        .route("/stream/:track_id/transcoded", get(stream_transcoded))
        .route("/stream/:track_id/:segment", get(stream_segment))
        .route("/streaming/options", get(streaming_options))
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Target format; HLS endpoints fall back to the server default.
    pub format: Option<String>,
    /// Target bitrate in kbps; zero or absent picks the format default.
    pub bitrate: Option<u32>,
    /// Token accepted in lieu of the Authorization header.
    pub token: Option<String>,
}

async fn stream_manifest(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path(track_id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let track = load_track(&state, track_id).await?;
    let variant = resolve_variant(&state, track_id, &query)?;
    let params = manifest::query_suffix(&variant, query.token.as_deref());

    // Prefer the encoder's own playlist when a generation already ran; its
    // segment timing is authoritative. Otherwise compute one from the track
    // duration without waking the encoder.
    let body = match state.cache.get(&CacheKey::manifest(&variant)).await {
        Some(bytes) => manifest::rewrite(&String::from_utf8_lossy(&bytes), &params),
        None => manifest::build(&track, state.config.segment_duration_sec, &params),
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        // May change if the variant is re-transcoded
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .map_err(|e| AppError::Internal(e.into()))?)
}

async fn stream_init(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path(track_id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let track = load_track(&state, track_id).await?;
    let variant = resolve_variant(&state, track_id, &query)?;
    let key = CacheKey::init(&variant);
    serve_generated(&state, &track, variant, key).await
}

async fn stream_segment(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path((track_id, segment)): Path<(i64, String)>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let index = parse_segment_name(&segment)?;
    let track = load_track(&state, track_id).await?;
    let variant = resolve_variant(&state, track_id, &query)?;

    // Out-of-range indices never reach the encoder
    if index >= track.segment_count(state.config.segment_duration_sec) {
        return Err(AppError::NotFound(format!(
            "Track {} has no segment {}",
            track_id, index
        )));
    }

    let key = CacheKey::segment(&variant, index);
    serve_generated(&state, &track, variant, key).await
}

/// Original-container passthrough with single-range support, so players can
/// seek without the whole file.
async fn stream_original(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path(track_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response> {
    let track = load_track(&state, track_id).await?;
    let path = PathBuf::from(&track.source_path);

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("Source file for track {} is missing", track_id)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stat {}: {}", path.display(), e)))?
        .len();

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|r| parse_range(r, size))
        .transpose()?;

    match range {
        Some((start, end)) => {
            let len = end - start + 1;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("seek {}: {}", path.display(), e)))?;
            let body = Body::from_stream(ReaderStream::new(file.take(len)));

            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, len)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, size))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| AppError::Internal(e.into()))?)
        }
        None => {
            let body = Body::from_stream(ReaderStream::new(file));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, size)
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| AppError::Internal(e.into()))?)
        }
    }
}

/// Single-blob transcode, no segmentation. Not cached; every request runs
/// the encoder.
async fn stream_transcoded(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path(track_id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let track = load_track(&state, track_id).await?;
    let format = match query.format.as_deref() {
        Some(s) => StreamFormat::parse(s)
            .ok_or_else(|| AppError::BadRequest(format!("Unsupported format: {}", s)))?,
        None => StreamFormat::Mp3,
    };
    let bitrate = resolve_bitrate(&state, format, query.bitrate)?;

    let bytes = state
        .transcoder
        .transcode_blob(std::path::Path::new(&track.source_path), format, bitrate)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, blob_content_type(format))
        .header(header::ACCEPT_RANGES, "none")
        .header(header::CACHE_CONTROL, "private, no-store")
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(e.into()))?)
}

/// Capability probe for clients deciding what to request.
async fn streaming_options(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
) -> Json<serde_json::Value> {
    let formats: Vec<&str> = state
        .config
        .allowed_formats
        .iter()
        .map(|f| f.as_str())
        .collect();
    Json(json!({
        "ffmpeg_available": state.transcoder.available().await,
        "formats": formats,
        "default_format": state.config.default_format.as_str(),
        "segment_duration_sec": state.config.segment_duration_sec,
    }))
}

async fn load_track(state: &AppState, track_id: i64) -> Result<Track> {
    state
        .catalog
        .get_track(track_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Track {} not found", track_id)))
}

/// Serve a generated artifact, producing it first if the cache misses.
/// The per-variant lock is held only around the encoder run, never while
/// bytes stream out to the client.
async fn serve_generated(
    state: &AppState,
    track: &Track,
    variant: StreamVariant,
    key: CacheKey,
) -> Result<Response> {
    if let Some(response) = serve_from_cache(state, &key).await? {
        return Ok(response);
    }

    let guard = state.gate.acquire(&variant.key()).await;
    if !state.cache.has(&key) {
        let job = HlsJob {
            variant,
            source_path: PathBuf::from(&track.source_path),
            segment_duration_sec: state.config.segment_duration_sec,
        };
        state.transcoder.generate_hls(&job).await?;
    }
    drop(guard);

    match serve_from_cache(state, &key).await? {
        Some(response) => Ok(response),
        None => Err(AppError::Internal(anyhow::anyhow!(
            "artifact {} missing after generation for {}",
            key.hash,
            variant.key()
        ))),
    }
}

/// Stream a cached artifact straight from disk. An open failure purges the
/// entry and reports a miss so the caller regenerates.
async fn serve_from_cache(state: &AppState, key: &CacheKey) -> Result<Option<Response>> {
    let Some(path) = state.cache.get_path(key) else {
        return Ok(None);
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(key = %key.hash, error = %e, "cached artifact vanished, regenerating");
            state.cache.purge(key).await;
            return Ok(None);
        }
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(key = %key.hash, error = %e, "cached artifact unreadable, regenerating");
            state.cache.purge(key).await;
            return Ok(None);
        }
    };

    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, size)
        // Variant- and segment-indexed URLs are immutable for the life of
        // the variant
        .header(header::CACHE_CONTROL, IMMUTABLE_CACHE)
        .body(body)
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Some(response))
}

/// Resolve the requested variant against server policy.
fn resolve_variant(state: &AppState, track_id: i64, query: &StreamQuery) -> Result<StreamVariant> {
    let format = match query.format.as_deref() {
        Some(s) => StreamFormat::parse(s)
            .ok_or_else(|| AppError::BadRequest(format!("Unsupported format: {}", s)))?,
        None => state.config.default_format,
    };
    if !state.config.allowed_formats.contains(&format) {
        return Err(AppError::BadRequest(format!(
            "Format {} is not enabled on this server",
            format.as_str()
        )));
    }
    let bitrate_kbps = resolve_bitrate(state, format, query.bitrate)?;

    Ok(StreamVariant {
        track_id,
        format,
        bitrate_kbps,
    })
}

fn resolve_bitrate(state: &AppState, format: StreamFormat, requested: Option<u32>) -> Result<u32> {
    if format.is_lossless() {
        return Ok(0);
    }
    let bitrate = match requested.unwrap_or(0) {
        0 if state.config.default_bitrate > 0 => state.config.default_bitrate,
        0 => format.default_bitrate(),
        explicit => explicit,
    };
    if !state.config.allowed_bitrates_for(format).contains(&bitrate) {
        return Err(AppError::BadRequest(format!(
            "Bitrate {} is not allowed for {}",
            bitrate,
            format.as_str()
        )));
    }
    Ok(bitrate)
}

/// `<n>.m4s`, zero-based.
fn parse_segment_name(name: &str) -> Result<u32> {
    name.strip_suffix(".m4s")
        .and_then(|stem| stem.parse().ok())
        .ok_or_else(|| AppError::BadRequest(format!("Malformed segment name: {}", name)))
}

/// RFC 7233 single-range parsing. Multi-range requests are rejected; a start
/// past EOF is 416.
fn parse_range(range: &str, size: u64) -> Result<(u64, u64)> {
    let spec = range
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::BadRequest("Invalid range unit".to_string()))?;
    if spec.contains(',') {
        return Err(AppError::BadRequest("Multiple ranges not supported".to_string()));
    }
    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| AppError::BadRequest("Invalid range format".to_string()))?;

    let (start, end) = match (start_str.is_empty(), end_str.is_empty()) {
        (false, false) => {
            let start: u64 = start_str
                .parse()
                .map_err(|_| AppError::BadRequest("Invalid range start".to_string()))?;
            let end: u64 = end_str
                .parse()
                .map_err(|_| AppError::BadRequest("Invalid range end".to_string()))?;
            (start, end)
        }
        (false, true) => {
            let start: u64 = start_str
                .parse()
                .map_err(|_| AppError::BadRequest("Invalid range start".to_string()))?;
            (start, size.saturating_sub(1))
        }
        (true, false) => {
            let suffix: u64 = end_str
                .parse()
                .map_err(|_| AppError::BadRequest("Invalid range suffix".to_string()))?;
            (size.saturating_sub(suffix.min(size)), size.saturating_sub(1))
        }
        (true, true) => return Err(AppError::BadRequest("Empty range".to_string())),
    };

    if start >= size {
        return Err(AppError::RangeNotSatisfiable(size));
    }
    let end = end.min(size.saturating_sub(1));
    if start > end {
        return Err(AppError::BadRequest("Range start past end".to_string()));
    }
    Ok((start, end))
}

fn blob_content_type(format: StreamFormat) -> &'static str {
    match format {
        StreamFormat::Mp3 | StreamFormat::Wav => "audio/mpeg",
        StreamFormat::Aac => "audio/aac",
        StreamFormat::Opus => "audio/ogg",
        StreamFormat::Flac => "audio/flac",
        StreamFormat::Alac => "audio/mp4",
    }
}
