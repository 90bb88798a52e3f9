mod file_info;
mod upload;

pub use file_info::{
    CleanupResponse, DeleteResponse, DownloadInfo, FileInfo, FileListQuery, FileListResponse,
    FileStatus, HealthResponse, RetentionInfo, StorageUsage,
};
pub use upload::{FileRecord, RetentionPolicy, UploadMetadata, UploadRecord};
