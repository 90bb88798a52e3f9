use crate::error::{Error, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happens to a file once its upload completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep until explicitly deleted
    #[default]
    Permanent,
    /// Delete after the first complete download
    DownloadOnce,
    /// Delete once retention_expires_at passes
    Ttl,
}

impl RetentionPolicy {
    /// Parse a client-supplied policy name. Unrecognized values yield None
    /// so callers can fall through to the configured default.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "permanent" => Some(Self::Permanent),
            "download_once" => Some(Self::DownloadOnce),
            "ttl" => Some(Self::Ttl),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::DownloadOnce => "download_once",
            Self::Ttl => "ttl",
        }
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative state of an in-progress (or just-finalized) transfer,
/// persisted under `upload:<file_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub offset: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_final: bool,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub retention_ttl: Option<i64>,
    #[serde(default)]
    pub retention_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl UploadRecord {
    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

/// Snapshot of a completed upload, persisted under `file:<file_id>`.
///
/// Also used as the merged metadata view for partial uploads, in which case
/// `is_complete` is false, `completed_at` is absent and `available_size`
/// reflects the current offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub available_size: u64,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub storage_path: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub retention_ttl: Option<i64>,
    #[serde(default)]
    pub retention_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl FileRecord {
    /// Merged metadata view for an upload that has not finalized yet.
    pub fn from_partial(upload: &UploadRecord) -> Self {
        Self {
            file_id: upload.file_id.clone(),
            filename: upload.filename.clone(),
            size: upload.size,
            available_size: upload.offset,
            mime_type: upload.mime_type.clone(),
            checksum: upload.checksum.clone(),
            is_complete: false,
            created_at: upload.created_at,
            updated_at: upload.updated_at,
            expires_at: upload.expires_at,
            completed_at: None,
            storage_path: upload.storage_path.clone(),
            retention: upload.retention,
            retention_ttl: upload.retention_ttl,
            retention_expires_at: upload.retention_expires_at,
            download_count: upload.download_count,
            owner_id: upload.owner_id.clone(),
        }
    }
}

/// Parsed `Upload-Metadata` header.
///
/// Wire format: comma-separated `key base64value` pairs; a bare key is an
/// empty string. Recognized keys are lifted into fields; the full map is
/// kept so unknown keys round-trip without affecting behavior.
#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub filename: String,
    pub filetype: Option<String>,
    pub checksum: Option<String>,
    pub retention: Option<String>,
    pub retention_ttl: Option<i64>,
    pub all: HashMap<String, String>,
}

impl UploadMetadata {
    pub fn from_header(header_value: &str) -> Result<Self> {
        if header_value.trim().is_empty() {
            return Err(Error::Validation {
                msg: "Empty Upload-Metadata header".to_string(),
            });
        }

        let mut all = HashMap::new();
        for item in header_value.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }

            let (key, value) = match item.split_once(' ') {
                Some((key, encoded)) => {
                    let encoded = encoded.trim();
                    // Tolerate unencoded values the way permissive clients send them
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                        .unwrap_or_else(|| encoded.to_string());
                    (key.trim().to_string(), decoded)
                }
                None => (item.to_string(), String::new()),
            };

            all.insert(key, value);
        }

        let filename = all
            .get("filename")
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or_else(|| Error::Validation {
                msg: "filename is required in Upload-Metadata".to_string(),
            })?;

        let retention_ttl = match all.get("retention_ttl") {
            Some(raw) if !raw.is_empty() => {
                Some(raw.parse::<i64>().map_err(|_| Error::Validation {
                    msg: format!("Invalid retention_ttl in Upload-Metadata: {}", raw),
                })?)
            }
            _ => None,
        };

        Ok(Self {
            filename,
            filetype: all.get("filetype").cloned().filter(|v| !v.is_empty()),
            checksum: all.get("checksum").cloned().filter(|v| !v.is_empty()),
            retention: all.get("retention").cloned().filter(|v| !v.is_empty()),
            retention_ttl,
            all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(value: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(value)
    }

    #[test]
    fn test_metadata_parses_base64_values() {
        let header = format!(
            "filename {},filetype {},retention {}",
            b64("report.pdf"),
            b64("application/pdf"),
            b64("ttl")
        );

        let meta = UploadMetadata::from_header(&header).unwrap();
        assert_eq!(meta.filename, "report.pdf");
        assert_eq!(meta.filetype.as_deref(), Some("application/pdf"));
        assert_eq!(meta.retention.as_deref(), Some("ttl"));
    }

    #[test]
    fn test_metadata_bare_key_is_empty_string() {
        let header = format!("filename {},is_confidential", b64("a.bin"));
        let meta = UploadMetadata::from_header(&header).unwrap();
        assert_eq!(meta.all.get("is_confidential").map(String::as_str), Some(""));
    }

    #[test]
    fn test_metadata_requires_filename() {
        let header = format!("filetype {}", b64("text/plain"));
        assert!(UploadMetadata::from_header(&header).is_err());
        assert!(UploadMetadata::from_header("").is_err());
    }

    #[test]
    fn test_metadata_preserves_unknown_keys() {
        let header = format!("filename {},x-trace-id {}", b64("a.bin"), b64("abc123"));
        let meta = UploadMetadata::from_header(&header).unwrap();
        assert_eq!(meta.all.get("x-trace-id").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_metadata_unencoded_value_kept_verbatim() {
        // ':' and '!' are outside the base64 alphabet, so decoding fails
        let header = format!("filename {},checksum sha256:ab!!", b64("a.bin"));
        let meta = UploadMetadata::from_header(&header).unwrap();
        assert_eq!(meta.checksum.as_deref(), Some("sha256:ab!!"));
    }

    #[test]
    fn test_retention_policy_parse_fallback() {
        assert_eq!(
            RetentionPolicy::parse("download_once"),
            Some(RetentionPolicy::DownloadOnce)
        );
        assert_eq!(RetentionPolicy::parse("keep_forever"), None);
    }

    #[test]
    fn test_upload_record_roundtrip() {
        let now = Utc::now();
        let record = UploadRecord {
            file_id: "ab".repeat(16),
            filename: "movie.mkv".to_string(),
            size: 1024,
            offset: 512,
            metadata: HashMap::from([("filetype".to_string(), "video/x-matroska".to_string())]),
            created_at: now,
            updated_at: now,
            expires_at: Some(now + chrono::Duration::hours(24)),
            is_final: false,
            storage_path: "/tmp/uploads/x".to_string(),
            mime_type: Some("video/x-matroska".to_string()),
            checksum: None,
            retention: RetentionPolicy::Ttl,
            retention_ttl: Some(60),
            retention_expires_at: None,
            download_count: 0,
            owner_id: None,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"retention\":\"ttl\""));

        let parsed: UploadRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.offset, 512);
        assert_eq!(parsed.retention, RetentionPolicy::Ttl);
        assert!(!parsed.is_complete());
    }
}
