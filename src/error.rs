use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildSearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Search engine is closed")]
    EngineClosed,

    #[error("Field not found in schema: {0}")]
    FieldNotFound(String),

    #[error("Extension field {keyword} failed: {message}")]
    Extension { keyword: String, message: String },

    #[error("Rebuild aborted")]
    Aborted,

    #[error("Executor must be started before waiting for completion")]
    NotStarted,

    #[error("Failed to index build {id}: {message}")]
    ItemFailed { id: String, message: String },

    #[error("Record source error: {0}")]
    Source(String),

    #[error("Remote server returned {status} for {url}")]
    RemoteStatus { status: u16, url: String },

    #[error("Remote request failed: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, BuildSearchError>;

impl From<std::io::Error> for BuildSearchError {
    fn from(e: std::io::Error) -> Self {
        BuildSearchError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for BuildSearchError {
    fn from(e: tantivy::TantivyError) -> Self {
        BuildSearchError::Tantivy(e.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for BuildSearchError {
    fn from(e: tantivy::directory::error::OpenDirectoryError) -> Self {
        BuildSearchError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BuildSearchError {
    fn from(e: serde_json::Error) -> Self {
        BuildSearchError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for BuildSearchError {
    fn from(e: reqwest::Error) -> Self {
        match (e.status(), e.url()) {
            (Some(status), Some(url)) => BuildSearchError::RemoteStatus {
                status: status.as_u16(),
                url: url.to_string(),
            },
            _ => BuildSearchError::Remote(e.to_string()),
        }
    }
}

impl BuildSearchError {
    /// Errors a caller can surface as "bad input" rather than a server fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BuildSearchError::InvalidQuery(_)
                | BuildSearchError::Config(_)
                | BuildSearchError::FieldNotFound(_)
        )
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
