use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    #[display("IO error at {path}: {error}")]
    Io { error: std::io::Error, path: String },

    #[display("Invalid request: {msg}")]
    Validation { msg: String },

    #[display("Not found: {file_id}")]
    NotFound { file_id: String },

    #[display("Conflict: {msg}")]
    Conflict { msg: String },

    #[display("Gone: {msg}")]
    Gone { msg: String },

    #[display("Unsupported media type: {msg}")]
    UnsupportedMedia { msg: String },

    #[display("Payload too large: {msg}")]
    TooLarge { msg: String },

    #[display("Checksum mismatch ({algo})")]
    ChecksumMismatch { algo: String },

    #[display("Storage quota exceeded")]
    QuotaExceeded {
        usage: crate::models::StorageUsage,
        offset: u64,
    },

    #[display("Precondition failed: unsupported Tus-Resumable version")]
    Precondition,

    #[display("Range not satisfiable: {msg}")]
    RangeNotSatisfiable { msg: String },

    #[display("State backend error: {msg}")]
    Backend { msg: String, transient: bool },

    #[display("Serialization error: {msg}")]
    Serialization { msg: String },

    #[display("Configuration error: {msg}")]
    Config { msg: String },

    #[display("Internal error: {msg}")]
    Internal { msg: String },
}

impl std::error::Error for Error {}

// Implement From<std::io::Error> for cases where path context is not available
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization {
            msg: error.to_string(),
        }
    }
}

/// Non-standard status used by the TUS checksum extension.
const STATUS_CHECKSUM_MISMATCH: u16 = 460;

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            Error::Validation { msg } => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::NotFound { file_id } => (
                StatusCode::NOT_FOUND,
                format!("File not found: {}", file_id),
            ),
            Error::Conflict { msg } => (StatusCode::CONFLICT, msg.clone()),
            Error::Gone { msg } => (StatusCode::GONE, msg.clone()),
            Error::UnsupportedMedia { msg } => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg.clone()),
            Error::TooLarge { msg } => (StatusCode::PAYLOAD_TOO_LARGE, msg.clone()),
            Error::ChecksumMismatch { algo } => (
                StatusCode::from_u16(STATUS_CHECKSUM_MISMATCH).unwrap_or(StatusCode::BAD_REQUEST),
                format!("Checksum mismatch ({})", algo),
            ),
            // The quota refusal is retryable from the unchanged offset and
            // carries the storage snapshot so clients can back off sensibly
            Error::QuotaExceeded { usage, offset } => {
                let mut headers = axum::http::HeaderMap::new();
                let mut put = |name: &'static str, value: String| {
                    if let Ok(value) = axum::http::HeaderValue::try_from(value) {
                        headers.insert(axum::http::HeaderName::from_static(name), value);
                    }
                };
                put("upload-offset", offset.to_string());
                put("retry-after", "10".to_string());
                put("x-storage-used", usage.used.to_string());
                put("x-storage-max", usage.max.unwrap_or(0).to_string());
                put("x-storage-available", usage.available.unwrap_or(0).to_string());

                let body = axum::Json(serde_json::json!({
                    "error": "Storage quota exceeded. Retry after space is freed.",
                }));
                return (StatusCode::INSUFFICIENT_STORAGE, headers, body).into_response();
            }
            Error::Precondition => (
                StatusCode::PRECONDITION_FAILED,
                "Unsupported Tus-Resumable version".to_string(),
            ),
            Error::RangeNotSatisfiable { msg } => (StatusCode::RANGE_NOT_SATISFIABLE, msg.clone()),
            Error::Backend { msg, transient } => {
                // Log full error internally for debugging
                tracing::error!(transient, "State backend error: {}", msg);
                if *transient {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "State backend temporarily unavailable".to_string(),
                    )
                } else {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "State backend error".to_string(),
                    )
                }
            }
            Error::Io { error, path } => {
                // Log full error with path internally; never expose file paths
                tracing::error!("IO error at path {}: {}", path, error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Error::Serialization { msg } => {
                tracing::error!("Serialization error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Error::Config { msg } => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Configuration error".to_string(),
                )
            }
            Error::Internal { msg } => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = axum::Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    /// Map I/O errors with path context
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| Error::Io {
            error,
            path: path.display().to_string(),
        })
    }
}
