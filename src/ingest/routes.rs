// HTTP routes for the ingest service
// Upload contract: authenticate, validate in documented order, write the
// file durably, then commit the QUEUED row. Admin, internal and health
// endpoints delimit the rest of the surface.

use anyhow::Context;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{auth, storage, AppState};
use crate::database::{ChunkStatus, NewChunk};
use crate::error::IngestError;

/// Sanity bound on a single chunk's covered interval.
const MAX_CHUNK_SPAN_SECS: i64 = 10 * 60;

const ALLOWED_SAMPLE_RATES: [i32; 5] = [8000, 16000, 24000, 32000, 48000];

pub fn build_router(state: AppState) -> Router {
    // Body limit sits above the payload cap so the 413 check in the handler
    // fires with the documented ordering; the slack covers multipart framing.
    let body_limit = state.config.max_upload_size_bytes as usize + 64 * 1024;

    Router::new()
        .route("/api/v1/chunks", post(upload_chunk))
        .route(
            "/api/v1/admin/devices",
            post(create_device).get(list_devices),
        )
        .route("/api/v1/admin/devices/{device_id}", patch(update_device))
        .route("/api/v1/admin/chunks", get(list_chunks))
        .route(
            "/api/v1/internal/chunks/{chunk_id}/audio",
            get(fetch_chunk_audio),
        )
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ============== Upload ==============

#[derive(Debug, Default)]
struct UploadForm {
    point_id: Option<String>,
    register_id: Option<String>,
    device_id: Option<String>,
    start_ts: Option<String>,
    end_ts: Option<String>,
    codec: Option<String>,
    sample_rate: Option<String>,
    channels: Option<String>,
    payload: Option<Vec<u8>>,
}

async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, IngestError> {
    // Check 1: device token and identity triple. The token is checked before
    // the body is even parsed, so an auth failure wins over any 400.
    let device = auth::authenticate_device(&state.db, &headers).await?;

    let form = read_upload_form(multipart).await?;

    let point_id = required(&form.point_id, "point_id")?;
    let register_id = required(&form.register_id, "register_id")?;
    let device_id: Uuid = required(&form.device_id, "device_id")?
        .parse()
        .map_err(|_| IngestError::invalid("device_id is not a valid UUID"))?;

    if device.device_id != device_id
        || device.point_id != point_id
        || device.register_id != register_id
    {
        // A token that does not own the claimed identity is an auth failure,
        // not a validation failure.
        return Err(IngestError::Unauthorized);
    }

    // Check 2: timestamps.
    let start_ts = parse_timestamp(required(&form.start_ts, "start_ts")?, "start_ts")?;
    let end_ts = parse_timestamp(required(&form.end_ts, "end_ts")?, "end_ts")?;

    if end_ts <= start_ts {
        return Err(IngestError::invalid("end_ts must be after start_ts"));
    }
    if end_ts - start_ts > Duration::seconds(MAX_CHUNK_SPAN_SECS) {
        return Err(IngestError::invalid("chunk covers more than 10 minutes"));
    }

    // Check 3: codec parameters.
    let codec = required(&form.codec, "codec")?;
    if codec != "opus" {
        return Err(IngestError::invalid("codec must be \"opus\""));
    }
    let sample_rate: i32 = required(&form.sample_rate, "sample_rate")?
        .parse()
        .map_err(|_| IngestError::invalid("sample_rate is not a number"))?;
    if !ALLOWED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(IngestError::invalid("unsupported sample_rate"));
    }
    let channels: i32 = required(&form.channels, "channels")?
        .parse()
        .map_err(|_| IngestError::invalid("channels is not a number"))?;
    if channels != 1 {
        return Err(IngestError::invalid("channels must be 1"));
    }

    // Check 4: payload size.
    let payload = form
        .payload
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| IngestError::invalid("chunk_file is required"))?;
    if payload.len() as u64 > state.config.max_upload_size_bytes {
        return Err(IngestError::PayloadTooLarge);
    }

    let file_hash = hex::encode(Sha256::digest(payload));

    // Recorder retries across network blips land here: same device, same
    // second, same bytes -> answer with the original row.
    if let Some(existing) = state
        .db
        .find_duplicate_chunk(device.device_id, start_ts, &file_hash)
        .await?
    {
        log::info!(
            "Duplicate upload for device {} at {} collapsed to chunk {}",
            device.device_id,
            start_ts,
            existing.chunk_id
        );
        return Ok(Json(json!({
            "status": "ok",
            "chunk_id": existing.chunk_id,
            "stored_path": existing.file_path,
            "queued": true,
        })));
    }

    // Overlapping intervals that are not retries point at a recorder clock
    // problem; stitching depends on disjoint chunks, so refuse them here.
    if state
        .db
        .has_overlapping_chunk(device.device_id, start_ts, end_ts)
        .await?
    {
        return Err(IngestError::invalid("overlapping chunk interval"));
    }

    let chunk_id = Uuid::new_v4();
    let relative_path = storage::chunk_relative_path(point_id, register_id, start_ts, chunk_id);

    // File first, fsynced; only then the DB row. A failure in between leaves
    // an orphan file for the sweep, never a row without bytes.
    storage::store_chunk_file(&state.config.audio_storage_dir, &relative_path, payload)
        .await
        .context("Failed to persist chunk payload")?;

    let duration_sec =
        ((end_ts - start_ts).num_milliseconds() as f64 / 1000.0).round() as i32;

    let chunk = state
        .db
        .insert_queued_chunk(&NewChunk {
            chunk_id,
            device_id: device.device_id,
            point_id: point_id.to_string(),
            register_id: register_id.to_string(),
            start_ts,
            end_ts,
            duration_sec,
            codec: codec.to_string(),
            sample_rate,
            channels,
            file_path: relative_path,
            file_size: payload.len() as i64,
            file_hash,
        })
        .await?;

    if let Err(e) = state.db.touch_device_last_seen(device.device_id).await {
        log::warn!(
            "Failed to stamp last_seen_at for device {}: {:#}",
            device.device_id,
            e
        );
    }

    log::info!(
        "Queued chunk {} for device {} ({}s at {})",
        chunk.chunk_id,
        device.device_id,
        chunk.duration_sec,
        chunk.start_ts
    );

    Ok(Json(json!({
        "status": "ok",
        "chunk_id": chunk.chunk_id,
        "stored_path": chunk.file_path,
        "queued": true,
    })))
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, IngestError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IngestError::invalid(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "point_id" => form.point_id = Some(read_text(field).await?),
            "register_id" => form.register_id = Some(read_text(field).await?),
            "device_id" => form.device_id = Some(read_text(field).await?),
            "start_ts" => form.start_ts = Some(read_text(field).await?),
            "end_ts" => form.end_ts = Some(read_text(field).await?),
            "codec" => form.codec = Some(read_text(field).await?),
            "sample_rate" => form.sample_rate = Some(read_text(field).await?),
            "channels" => form.channels = Some(read_text(field).await?),
            "chunk_file" => {
                let bytes = field.bytes().await.map_err(|e| {
                    IngestError::invalid(format!("failed to read chunk_file: {}", e))
                })?;
                form.payload = Some(bytes.to_vec());
            }
            // Unknown fields are ignored so recorder agents can evolve.
            _ => {}
        }
    }

    Ok(form)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, IngestError> {
    field
        .text()
        .await
        .map(|t| t.trim().to_string())
        .map_err(|e| IngestError::invalid(format!("malformed field: {}", e)))
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, IngestError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IngestError::invalid(format!("{} is required", name)))
}

/// Parse a form timestamp. Must carry an explicit UTC offset; naive
/// timestamps are rejected rather than guessed at.
fn parse_timestamp(raw: &str, name: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            IngestError::invalid(format!(
                "{} must be an RFC 3339 timestamp with timezone",
                name
            ))
        })
}

// ============== Admin ==============

#[derive(Debug, Deserialize)]
struct CreateDeviceRequest {
    point_id: String,
    register_id: String,
    device_id: Uuid,
    token_plain: String,
    #[serde(default = "default_enabled")]
    is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<impl IntoResponse, IngestError> {
    auth::require_admin(&headers, &state.config.admin_token)?;

    if request.token_plain.len() < 16 {
        return Err(IngestError::invalid(
            "token_plain must be at least 16 characters",
        ));
    }

    let device = state
        .db
        .create_device(
            request.device_id,
            &request.point_id,
            &request.register_id,
            &auth::hash_token(&request.token_plain),
            request.is_enabled,
        )
        .await
        .map_err(|e| match e.root_cause().downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                IngestError::invalid("device already exists")
            }
            _ => IngestError::Internal(e),
        })?;

    log::info!(
        "Registered device {} at point {} register {}",
        device.device_id,
        device.point_id,
        device.register_id
    );

    Ok((StatusCode::CREATED, Json(device)))
}

async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, IngestError> {
    auth::require_admin(&headers, &state.config.admin_token)?;
    let devices = state.db.list_devices().await?;
    Ok(Json(devices))
}

#[derive(Debug, Deserialize)]
struct UpdateDeviceRequest {
    is_enabled: bool,
}

async fn update_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<Uuid>,
    Json(request): Json<UpdateDeviceRequest>,
) -> Result<impl IntoResponse, IngestError> {
    auth::require_admin(&headers, &state.config.admin_token)?;

    let device = state
        .db
        .set_device_enabled(device_id, request.is_enabled)
        .await?
        .ok_or_else(|| IngestError::NotFound(format!("device {}", device_id)))?;

    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
struct ChunkListQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_chunks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChunkListQuery>,
) -> Result<impl IntoResponse, IngestError> {
    auth::require_admin(&headers, &state.config.admin_token)?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<ChunkStatus>()
                .map_err(IngestError::InvalidRequest)?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let chunks = state.db.list_chunks(status, limit).await?;
    Ok(Json(chunks))
}

// ============== Internal ==============

async fn fetch_chunk_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chunk_id): Path<Uuid>,
) -> Result<Response, IngestError> {
    auth::require_internal(&headers, &state.config.internal_token)?;

    let chunk = state
        .db
        .get_chunk(chunk_id)
        .await?
        .ok_or_else(|| IngestError::NotFound(format!("chunk {}", chunk_id)))?;

    let bytes = storage::read_chunk_file(&state.config.audio_storage_dir, &chunk.file_path)
        .await
        .context("Failed to read chunk audio")?;
    let total = bytes.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| parse_byte_range(raw, total));

    let (status, body) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, bytes[start..=end].to_vec()),
        None => (StatusCode::OK, bytes),
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "audio/ogg")
        .header(header::ACCEPT_RANGES, "bytes")
        .header("x-chunk-sample-rate", chunk.sample_rate)
        .header("x-chunk-channels", chunk.channels)
        .header("x-chunk-duration-sec", chunk.duration_sec)
        .header("x-chunk-start-ts", chunk.start_ts.to_rfc3339());

    if let Some((start, end)) = range {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, total),
        );
    }

    response
        .body(Body::from(body))
        .map_err(|e| IngestError::Internal(anyhow::Error::new(e)))
}

/// Parse `bytes=start-end` (end inclusive, optional). Malformed or
/// out-of-range requests fall back to the full body.
fn parse_byte_range(raw: &str, total: usize) -> Option<(usize, usize)> {
    if total == 0 {
        return None;
    }
    let spec = raw.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start: usize = start_raw.parse().ok()?;
    let end: usize = if end_raw.is_empty() {
        total - 1
    } else {
        end_raw.parse().ok()?
    };

    if start > end || end >= total {
        return None;
    }
    Some((start, end))
}

// ============== Health ==============

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.ping().await;
    let storage_ok = storage::storage_writable(&state.config.audio_storage_dir).await;

    let status = if db_ok && storage_ok { "ok" } else { "degraded" };
    let code = if db_ok && storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "db": db_ok,
            "storage_writable": storage_ok,
            "time": Utc::now().to_rfc3339(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_require_timezone() {
        assert!(parse_timestamp("2025-03-01T09:00:00Z", "start_ts").is_ok());
        assert!(parse_timestamp("2025-03-01T09:00:00+03:00", "start_ts").is_ok());
        assert!(parse_timestamp("2025-03-01T09:00:00", "start_ts").is_err());
        assert!(parse_timestamp("not-a-date", "start_ts").is_err());
    }

    #[test]
    fn byte_range_parsing() {
        assert_eq!(parse_byte_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_byte_range("bytes=90-", 100), Some((90, 99)));
        assert_eq!(parse_byte_range("bytes=0-199", 100), None);
        assert_eq!(parse_byte_range("bytes=50-10", 100), None);
        assert_eq!(parse_byte_range("items=0-9", 100), None);
        assert_eq!(parse_byte_range("bytes=0-9", 0), None);
    }
}
