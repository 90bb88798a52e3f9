//! File management endpoints: listing, metadata, range downloads, deletion
//! and the manual cleanup trigger.

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::models::{
    CleanupResponse, DeleteResponse, DownloadInfo, FileInfo, FileListQuery, FileListResponse,
    FileRecord, FileStatus, RetentionInfo, RetentionPolicy,
};
use crate::storage::ChunkStorage;
use crate::store::UploadStore;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

fn chunk_count(bytes: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    bytes.div_ceil(chunk_size)
}

fn retention_info(record: &FileRecord) -> RetentionInfo {
    RetentionInfo {
        retention: record.retention,
        retention_ttl: record.retention_ttl,
        retention_expires_at: record.retention_expires_at,
        download_count: record.download_count,
    }
}

fn file_info_view(record: &FileRecord, chunk_size: u64, with_retention: bool) -> FileInfo {
    FileInfo {
        file_id: record.file_id.clone(),
        filename: record.filename.clone(),
        size: record.size,
        mime_type: record.mime_type.clone(),
        checksum: record.checksum.clone(),
        status: if record.is_complete {
            FileStatus::Complete
        } else {
            FileStatus::Partial
        },
        uploaded_size: record.available_size,
        chunk_size,
        total_chunks: chunk_count(record.size, chunk_size),
        uploaded_chunks: chunk_count(record.available_size, chunk_size),
        created_at: Some(record.created_at),
        updated_at: Some(record.updated_at),
        expires_at: record.expires_at,
        metadata: with_retention.then(|| retention_info(record)),
    }
}

/// List available files, newest activity first. Partial uploads can still
/// be downloaded for their uploaded portion.
#[utoipa::path(
    get,
    path = "/files",
    params(
        ("page" = Option<usize>, Query, description = "Page number (1-indexed)"),
        ("page_size" = Option<usize>, Query, description = "Items per page (1..=100)"),
        ("include_partial" = Option<bool>, Query, description = "Include in-progress uploads")
    ),
    responses(
        (status = 200, description = "Paginated file listing", body = FileListResponse),
        (status = 400, description = "Invalid pagination parameters")
    ),
    tag = "files"
)]
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileListQuery>,
) -> Result<Json<FileListResponse>> {
    if query.page < 1 {
        return Err(Error::Validation {
            msg: "page must be >= 1".to_string(),
        });
    }
    if query.page_size < 1 || query.page_size > 100 {
        return Err(Error::Validation {
            msg: "page_size must be in 1..=100".to_string(),
        });
    }

    let chunk_size = state.config.storage.chunk_size.as_u64();
    let mut all: Vec<FileInfo> = state
        .store
        .list_files()
        .await?
        .iter()
        .map(|record| file_info_view(record, chunk_size, false))
        .collect();

    if query.include_partial {
        let uploads = state.store.list_uploads(false, true).await?;
        all.extend(
            uploads
                .iter()
                .map(|upload| file_info_view(&FileRecord::from_partial(upload), chunk_size, false)),
        );
    }

    all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let total = all.len();
    let files: Vec<FileInfo> = all
        .into_iter()
        .skip((query.page - 1) * query.page_size)
        .take(query.page_size)
        .collect();

    Ok(Json(FileListResponse {
        files,
        total,
        page: query.page,
        page_size: query.page_size,
    }))
}

/// Get information about a specific file, including retention details and
/// derived chunk counts.
#[utoipa::path(
    get,
    path = "/files/{file_id}",
    params(("file_id" = String, Path, description = "File identifier")),
    responses(
        (status = 200, description = "File record", body = FileInfo),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn get_file_info(
    State(state): State<Arc<AppState>>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<FileInfo>> {
    let Some(record) = state.store.get_file_info(&file_id).await? else {
        return Err(Error::NotFound { file_id });
    };

    let chunk_size = state.config.storage.chunk_size.as_u64();
    Ok(Json(file_info_view(&record, chunk_size, true)))
}

/// Lightweight metadata for planning a chunked download.
#[utoipa::path(
    get,
    path = "/files/{file_id}/info/download",
    params(("file_id" = String, Path, description = "File identifier")),
    responses(
        (status = 200, description = "Download planning metadata", body = DownloadInfo),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn get_download_info(
    State(state): State<Arc<AppState>>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<DownloadInfo>> {
    let Some(record) = state.store.get_file_info(&file_id).await? else {
        return Err(Error::NotFound { file_id });
    };

    Ok(Json(DownloadInfo {
        file_id: record.file_id,
        filename: record.filename,
        size: record.size,
        available_size: record.available_size,
        mime_type: record.mime_type,
        checksum: record.checksum,
        supports_range: true,
    }))
}

/// Parse `Range: bytes=<start>-<end?>` against the downloadable size.
fn parse_range(header: &str, available_size: u64) -> Result<(u64, u64)> {
    let invalid = || Error::RangeNotSatisfiable {
        msg: "Invalid Range header".to_string(),
    };

    let spec = header.strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start_raw, end_raw) = spec.split_once('-').ok_or_else(invalid)?;

    let start = match start_raw.trim() {
        "" => 0,
        raw => raw.parse::<u64>().map_err(|_| invalid())?,
    };

    let end = match end_raw.trim() {
        "" => available_size.saturating_sub(1),
        raw => raw
            .parse::<u64>()
            .map_err(|_| invalid())?
            .min(available_size.saturating_sub(1)),
    };

    if start >= available_size || start > end {
        return Err(Error::RangeNotSatisfiable {
            msg: format!(
                "Range not satisfiable. Available: 0-{}",
                available_size.saturating_sub(1)
            ),
        });
    }

    Ok((start, end))
}

/// Runs after the response body has been fully streamed: bump the download
/// counter and, for download-once files, reclaim the bytes.
async fn finish_full_download(store: UploadStore, storage: Arc<ChunkStorage>, file_id: String) {
    match store.record_download(&file_id).await {
        Ok(outcome) => {
            if outcome.should_delete {
                tracing::info!(file_id, "Deleting download-once file after full download");
                if let Err(e) = storage.delete_upload(&file_id).await {
                    tracing::error!(file_id, error = %e, "Failed to delete download-once file");
                }
            }
        }
        Err(e) => {
            tracing::warn!(file_id, error = %e, "Failed to record download");
        }
    }
}

/// Download a file with HTTP Range support.
///
/// Partially uploaded files can be downloaded up to their current offset;
/// those responses are 206 with a `Content-Range` that signals the file is
/// incomplete, even when the client sent no Range header.
#[utoipa::path(
    get,
    path = "/files/{file_id}/download",
    params(
        ("file_id" = String, Path, description = "File identifier"),
        ("Range" = Option<String>, Header, description = "Byte range, e.g. bytes=0-1023")
    ),
    responses(
        (status = 200, description = "Complete file stream"),
        (status = 206, description = "Partial content"),
        (status = 404, description = "File not found"),
        (status = 416, description = "Range not satisfiable")
    ),
    tag = "files"
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    AxumPath(file_id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let Some(record) = state.store.get_file_info(&file_id).await? else {
        return Err(Error::NotFound { file_id });
    };

    let available_size = record.available_size;
    let total_size = record.size;

    let range_header = headers.get("range").and_then(|v| v.to_str().ok());
    let (start, end) = match range_header {
        Some(header) => parse_range(header, available_size)?,
        None => (0, available_size.saturating_sub(1)),
    };

    let content_length = if available_size == 0 { 0 } else { end - start + 1 };
    let is_full_download = available_size > 0 && start == 0 && end == available_size - 1;

    let mut response_headers = HeaderMap::new();
    let mime_type = record
        .mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let put = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::try_from(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };

    put(&mut response_headers, "content-type", mime_type);
    put(
        &mut response_headers,
        "content-disposition",
        format!(
            "attachment; filename=\"{}\"",
            record.filename.replace('"', "'")
        ),
    );
    response_headers.insert(
        HeaderName::from_static("accept-ranges"),
        HeaderValue::from_static("bytes"),
    );
    put(
        &mut response_headers,
        "content-length",
        content_length.to_string(),
    );
    put(
        &mut response_headers,
        "x-retention-policy",
        record.retention.to_string(),
    );
    if let Some(expires) = record.retention_expires_at {
        put(
            &mut response_headers,
            "x-retention-expires",
            expires.to_rfc3339(),
        );
    }
    if record.retention == RetentionPolicy::DownloadOnce && is_full_download {
        put(
            &mut response_headers,
            "x-retention-warning",
            "File will be deleted after this download".to_string(),
        );
    }
    put(
        &mut response_headers,
        "x-download-count",
        (record.download_count + 1).to_string(),
    );

    let status = if range_header.is_some() || available_size < total_size {
        put(
            &mut response_headers,
            "content-range",
            format!("bytes {}-{}/{}", start, end, total_size),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    // Stream in server-sized chunks; the retention hook fires only once the
    // final chunk has been handed to the transport.
    let chunk_size = state.config.storage.chunk_size.as_u64().max(1);
    let storage = Arc::clone(&state.storage);
    let store = state.store.clone();
    let stream_id = record.file_id.clone();

    let stream = futures::stream::try_unfold(
        (start, content_length),
        move |(offset, remaining)| {
            let storage = Arc::clone(&storage);
            let store = store.clone();
            let file_id = stream_id.clone();

            async move {
                if remaining == 0 {
                    if is_full_download {
                        tokio::spawn(finish_full_download(store, storage, file_id));
                    }
                    return Ok::<_, Error>(None);
                }

                let want = remaining.min(chunk_size) as usize;
                let chunk = match storage.read_chunk(&file_id, offset, want).await {
                    Ok(chunk) => chunk,
                    // The file vanished mid-stream; end the body short
                    Err(_) => return Ok(None),
                };
                if chunk.is_empty() {
                    return Ok(None);
                }

                let read = chunk.len() as u64;
                Ok(Some((
                    Bytes::from(chunk),
                    (offset + read, remaining - read),
                )))
            }
        },
    );

    Ok((status, response_headers, Body::from_stream(stream)).into_response())
}

/// Delete a file or in-progress upload.
#[utoipa::path(
    delete,
    path = "/files/{file_id}",
    params(("file_id" = String, Path, description = "File identifier")),
    responses(
        (status = 200, description = "File deleted", body = DeleteResponse),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<DeleteResponse>> {
    if state.store.get_file_info(&file_id).await?.is_none() {
        return Err(Error::NotFound { file_id });
    }

    state.storage.delete_upload(&file_id).await?;
    tracing::info!(file_id, "File deleted");

    Ok(Json(DeleteResponse {
        status: "deleted".to_string(),
        file_id,
    }))
}

/// Synchronously run the cleanup sweep. Normally cleanup runs periodically;
/// this endpoint exists so operators and tests can force a pass.
#[utoipa::path(
    post,
    path = "/files/cleanup",
    responses((status = 200, description = "Cleanup result", body = CleanupResponse)),
    tag = "files"
)]
pub async fn trigger_cleanup(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupResponse>> {
    let cleaned = state.cleanup.sweep().await?;

    Ok(Json(CleanupResponse {
        status: "ok".to_string(),
        cleaned,
    }))
}
