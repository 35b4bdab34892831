use thiserror::Error;

/// Failure kinds surfaced by the version core.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("invalid option {option}: {kind}")]
    InvalidOption { option: &'static str, kind: &'static str },
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("file is too large (limit {limit} bytes)")]
    MaxFilesizeExceeded { limit: u64 },
    #[error("version code {code} already exists for project {project_id}")]
    DuplicateCode { project_id: String, code: String },
    #[error("version {version_id} has a build in flight")]
    BuildInFlight { version_id: String },
    #[error("artifact deletion failed (src: {}, dist: {})", .src.as_deref().unwrap_or("ok"), .dist.as_deref().unwrap_or("ok"))]
    DeleteFailed { src: Option<String>, dist: Option<String> },
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl VersionError {
    pub fn invalid(option: &'static str, kind: &'static str) -> Self { Self::InvalidOption { option, kind } }
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self { Self::NotFound { resource, id: id.into() } }
    pub fn storage(err: impl Into<anyhow::Error>) -> Self { Self::Storage(err.into()) }

    /// Stable machine readable code, same vocabulary as the API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOption { .. } => "invalid_option",
            Self::NotFound { .. } => "not_found",
            Self::UploadFailed(_) => "upload_failed",
            Self::MaxFilesizeExceeded { .. } => "max_filesize_exceeded",
            Self::DuplicateCode { .. } => "duplicate_code",
            Self::BuildInFlight { .. } => "build_in_flight",
            Self::DeleteFailed { .. } => "delete_failed",
            Self::Storage(_) => "storage",
        }
    }

    /// HTTP equivalent status for the layer that maps these onto responses.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidOption { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::DuplicateCode { .. } | Self::BuildInFlight { .. } => 409,
            Self::MaxFilesizeExceeded { .. } => 413,
            Self::UploadFailed(_) | Self::DeleteFailed { .. } | Self::Storage(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

impl From<sqlx::Error> for VersionError {
    fn from(e: sqlx::Error) -> Self { Self::Storage(e.into()) }
}

pub type VersionResult<T> = Result<T, VersionError>;
