//! TUS 1.0.0 protocol surface.
//!
//! Implements the core protocol plus the `creation`, `creation-with-upload`,
//! `termination`, `checksum` and `expiration` extensions. These are raw HTTP
//! handlers; the wire contract lives in the headers, not in JSON bodies.

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::models::{RetentionPolicy, UploadMetadata, UploadRecord};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::middleware::map_response;
use axum::response::{IntoResponse, Response};
use axum::routing::options;
use chrono::Utc;
use sha2::Digest;
use std::sync::Arc;

pub const TUS_VERSION: &str = "1.0.0";

pub const TUS_EXTENSIONS: &[&str] = &[
    "creation",
    "creation-with-upload",
    "termination",
    "checksum",
    "expiration",
];

const CONTENT_TYPE_OFFSET: &str = "application/offset+octet-stream";

const API_TOKEN_HEADER: &str = "x-api-token";

/// Stamp the protocol headers every TUS response must carry, errors
/// included. Applied to the whole TUS router as response middleware.
async fn with_tus_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("tus-resumable"),
        HeaderValue::from_static(TUS_VERSION),
    );
    headers.insert(
        HeaderName::from_static("tus-version"),
        HeaderValue::from_static(TUS_VERSION),
    );
    response
}

fn put_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Any non-matching `Tus-Resumable` request header is a precondition failure.
fn validate_tus_version(headers: &HeaderMap) -> Result<()> {
    match headers.get("tus-resumable") {
        Some(version) if version != TUS_VERSION => Err(Error::Precondition),
        _ => Ok(()),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Verify an `Upload-Checksum: <algo> <hex>` header against the chunk body.
fn verify_checksum(header: &str, data: &[u8]) -> Result<()> {
    let Some((algo, expected)) = header.split_once(' ') else {
        return Err(Error::Validation {
            msg: "Invalid Upload-Checksum header".to_string(),
        });
    };

    let algo = algo.trim().to_ascii_lowercase();
    let actual = match algo.as_str() {
        "sha256" => format!("{:x}", sha2::Sha256::digest(data)),
        "sha1" => format!("{:x}", sha1::Sha1::digest(data)),
        "md5" => format!("{:x}", md5::compute(data)),
        _ => {
            return Err(Error::Validation {
                msg: format!("Unsupported checksum algorithm: {}", algo),
            });
        }
    };

    if actual != expected.trim() {
        return Err(Error::ChecksumMismatch { algo });
    }

    Ok(())
}

/// OPTIONS on the collection or on a file id: advertise capabilities.
async fn tus_options(State(state): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    put_header(&mut headers, "tus-extension", TUS_EXTENSIONS.join(","));
    if let Some(max) = state.config.server.max_upload_size {
        put_header(&mut headers, "tus-max-size", max.as_u64().to_string());
    }

    (StatusCode::NO_CONTENT, headers).into_response()
}

/// POST: create a new upload (creation extension), optionally writing the
/// first chunk in the same request (creation-with-upload).
async fn tus_create(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    validate_tus_version(&headers)?;

    let upload_length = header_str(&headers, "upload-length")
        .ok_or_else(|| Error::Validation {
            msg: "Missing Upload-Length header".to_string(),
        })?
        .parse::<u64>()
        .map_err(|_| Error::Validation {
            msg: "Invalid Upload-Length header".to_string(),
        })?;

    if let Some(max) = state.config.server.max_upload_size
        && upload_length > max.as_u64()
    {
        return Err(Error::TooLarge {
            msg: "Upload exceeds maximum size".to_string(),
        });
    }

    // Storage quota is checked per-chunk in PATCH, not here; creating the
    // record while quota is tight is fine, the client gets throttled
    // chunk-by-chunk.

    let metadata_header = header_str(&headers, "upload-metadata").ok_or_else(|| {
        Error::Validation {
            msg: "Missing Upload-Metadata header (filename is required)".to_string(),
        }
    })?;
    let meta = UploadMetadata::from_header(metadata_header)?;

    let token = header_str(&headers, API_TOKEN_HEADER);

    // Retention priority: client metadata, then per-token policy, then the
    // server default. Unrecognized client values fall back to permanent.
    let (retention, retention_ttl) = match meta.retention.as_deref() {
        Some(value) => (
            RetentionPolicy::parse(value).unwrap_or_default(),
            meta.retention_ttl,
        ),
        None => match token.and_then(|t| state.config.uploads.token_retention_policies.get(t)) {
            Some(policy) => (
                policy.retention,
                meta.retention_ttl.or(policy.retention_ttl),
            ),
            None => (
                state.config.uploads.default_retention,
                meta.retention_ttl
                    .or(state.config.uploads.default_retention_ttl),
            ),
        },
    };

    let file_id = uuid::Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    let expires_at =
        now + chrono::Duration::seconds(state.config.uploads.upload_expiration_seconds);

    let mut upload = UploadRecord {
        file_id: file_id.clone(),
        filename: meta.filename.clone(),
        size: upload_length,
        offset: 0,
        metadata: meta.all.clone(),
        created_at: now,
        updated_at: now,
        expires_at: Some(expires_at),
        is_final: false,
        storage_path: state.storage.upload_path(&file_id).display().to_string(),
        mime_type: meta.filetype.clone(),
        checksum: meta.checksum.clone(),
        retention,
        retention_ttl,
        retention_expires_at: None,
        download_count: 0,
        owner_id: token.map(str::to_string),
    };

    state.store.create_upload(&upload).await?;
    state.storage.create_upload_file(&file_id).await?;

    // creation-with-upload: a correctly typed non-empty body is the first chunk
    if !body.is_empty() && header_str(&headers, "content-type") == Some(CONTENT_TYPE_OFFSET) {
        state.storage.write_chunk(&file_id, &body, 0).await?;
        upload.offset = body.len() as u64;
        state.store.update_upload(&mut upload).await?;
    }

    tracing::info!(
        file_id,
        filename = upload.filename,
        size = upload.size,
        retention = %upload.retention,
        "Upload created"
    );

    let location = format!("{}/{}", uri.path().trim_end_matches('/'), file_id);

    let mut response_headers = HeaderMap::new();
    put_header(&mut response_headers, "location", location);
    put_header(
        &mut response_headers,
        "upload-offset",
        upload.offset.to_string(),
    );
    put_header(
        &mut response_headers,
        "upload-expires",
        expires_at.to_rfc3339(),
    );

    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// HEAD: report the current offset so a client can resume.
async fn tus_head(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    validate_tus_version(&headers)?;

    let Some(upload) = state.store.get_upload(&file_id).await? else {
        return Err(Error::NotFound { file_id });
    };

    if upload.is_expired(Utc::now()) {
        state.storage.delete_upload(&file_id).await?;
        return Err(Error::Gone {
            msg: "Upload has expired".to_string(),
        });
    }

    let mut response_headers = HeaderMap::new();
    put_header(
        &mut response_headers,
        "upload-offset",
        upload.offset.to_string(),
    );
    put_header(
        &mut response_headers,
        "upload-length",
        upload.size.to_string(),
    );
    if let Some(expires_at) = upload.expires_at {
        put_header(
            &mut response_headers,
            "upload-expires",
            expires_at.to_rfc3339(),
        );
    }
    response_headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );

    Ok((StatusCode::OK, response_headers).into_response())
}

/// PATCH: append one chunk at the current offset.
async fn tus_patch(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    validate_tus_version(&headers)?;

    if header_str(&headers, "content-type") != Some(CONTENT_TYPE_OFFSET) {
        return Err(Error::UnsupportedMedia {
            msg: format!("Content-Type must be {}", CONTENT_TYPE_OFFSET),
        });
    }

    let Some(mut upload) = state.store.get_upload(&file_id).await? else {
        return Err(Error::NotFound { file_id });
    };

    // Finalized uploads have moved on; the record only remains for HEAD
    if upload.is_final {
        return Err(Error::NotFound { file_id });
    }

    if upload.is_expired(Utc::now()) {
        state.storage.delete_upload(&file_id).await?;
        return Err(Error::Gone {
            msg: "Upload has expired".to_string(),
        });
    }

    let offset = header_str(&headers, "upload-offset")
        .ok_or_else(|| Error::Validation {
            msg: "Missing Upload-Offset header".to_string(),
        })?
        .parse::<u64>()
        .map_err(|_| Error::Validation {
            msg: "Invalid Upload-Offset header".to_string(),
        })?;

    if offset != upload.offset {
        return Err(Error::Conflict {
            msg: format!(
                "Offset mismatch: expected {}, got {}",
                upload.offset, offset
            ),
        });
    }

    if body.is_empty() {
        return Err(Error::Validation {
            msg: "Empty request body".to_string(),
        });
    }

    if offset + body.len() as u64 > upload.size {
        return Err(Error::Validation {
            msg: "Chunk exceeds upload size".to_string(),
        });
    }

    // Quota admission; refusal leaves the offset untouched and is retryable
    let (allowed, usage) = state.quota.check_quota(body.len() as u64).await?;
    if !allowed {
        return Err(Error::QuotaExceeded {
            usage,
            offset: upload.offset,
        });
    }

    if let Some(checksum_header) = header_str(&headers, "upload-checksum") {
        verify_checksum(checksum_header, &body)?;
    }

    state.storage.write_chunk(&file_id, &body, offset).await?;

    let new_offset = offset + body.len() as u64;
    upload.offset = new_offset;
    if new_offset >= upload.size {
        upload.is_final = true;
    }

    // Persist state before finalizing so a crash is recoverable at startup
    state.store.update_upload(&mut upload).await?;

    if upload.is_final {
        state.storage.finalize_upload(&file_id).await?;
    }

    let mut response_headers = HeaderMap::new();
    put_header(
        &mut response_headers,
        "upload-offset",
        new_offset.to_string(),
    );
    if let Some(expires_at) = upload.expires_at {
        put_header(
            &mut response_headers,
            "upload-expires",
            expires_at.to_rfc3339(),
        );
    }

    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// DELETE: terminate an upload (termination extension).
async fn tus_delete(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    validate_tus_version(&headers)?;

    if state.store.get_upload(&file_id).await?.is_none() {
        return Err(Error::NotFound { file_id });
    }

    state.storage.delete_upload(&file_id).await?;
    tracing::info!(file_id, "Upload terminated");

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Raw TUS routes, mounted at the server root. The response middleware
/// guarantees the protocol headers on every status code.
pub fn create_tus_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tus", options(tus_options).post(tus_create))
        .route(
            "/tus/{file_id}",
            options(tus_options)
                .head(tus_head)
                .patch(tus_patch)
                .delete(tus_delete),
        )
        .layer(map_response(with_tus_headers))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_checksum_algorithms() {
        let data = b"ferry payload";

        let sha256 = format!("{:x}", sha2::Sha256::digest(data));
        assert!(verify_checksum(&format!("sha256 {}", sha256), data).is_ok());
        assert!(verify_checksum(&format!("SHA256 {}", sha256), data).is_ok());

        let sha1 = format!("{:x}", sha1::Sha1::digest(data));
        assert!(verify_checksum(&format!("sha1 {}", sha1), data).is_ok());

        let md5 = format!("{:x}", md5::compute(data));
        assert!(verify_checksum(&format!("md5 {}", md5), data).is_ok());
    }

    #[test]
    fn test_verify_checksum_mismatch_and_unknown() {
        let data = b"ferry payload";

        let err = verify_checksum(&format!("sha256 {}", "0".repeat(64)), data).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));

        let err = verify_checksum("crc32 abcdef", data).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = verify_checksum("sha256", data).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_validate_tus_version() {
        let mut headers = HeaderMap::new();
        assert!(validate_tus_version(&headers).is_ok());

        headers.insert("tus-resumable", HeaderValue::from_static("1.0.0"));
        assert!(validate_tus_version(&headers).is_ok());

        headers.insert("tus-resumable", HeaderValue::from_static("0.2.2"));
        assert!(matches!(
            validate_tus_version(&headers).unwrap_err(),
            Error::Precondition
        ));
    }
}
