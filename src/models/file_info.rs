use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::RetentionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Complete,
    Partial,
}

/// Retention details surfaced alongside a file record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetentionInfo {
    pub retention: RetentionPolicy,
    pub retention_ttl: Option<i64>,
    pub retention_expires_at: Option<DateTime<Utc>>,
    pub download_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileInfo {
    /// Unique file identifier (32 lowercase hex chars)
    pub file_id: String,
    /// Original filename
    pub filename: String,
    /// Declared total size in bytes
    pub size: u64,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// Client-declared checksum, if any
    pub checksum: Option<String>,
    pub status: FileStatus,
    /// Bytes available for download right now
    pub uploaded_size: u64,
    /// Server chunk size used for derived counts
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploaded_chunks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RetentionInfo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileListResponse {
    pub files: Vec<FileInfo>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FileListQuery {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: usize,
    /// Items per page (1..=100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Include in-progress uploads
    #[serde(default = "default_include_partial")]
    pub include_partial: bool,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

fn default_include_partial() -> bool {
    true
}

/// Metadata needed to plan a chunked download.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadInfo {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub available_size: u64,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    pub supports_range: bool,
}

/// Quota accountant snapshot; `max`/`available` are null when unlimited.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StorageUsage {
    pub used: u64,
    pub max: Option<u64>,
    pub available: Option<u64>,
    pub usage_percent: f64,
    pub is_full: bool,
    pub files_count: usize,
    pub uploads_count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub status: String,
    pub file_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanupResponse {
    pub status: String,
    /// Number of uploads/files reclaimed by the sweep
    pub cleaned: u32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
