use vigil_common::types::InDomId;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connection refused by {host}")]
    ConnectionRefused { host: String },

    #[error("permission denied connecting to {host}")]
    PermissionDenied { host: String },

    #[error("connection limit reached on {host}")]
    ConnectionLimit { host: String },

    #[error("connection to {host} lost")]
    ConnectionLost { host: String },

    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("{0} not available")]
    InDomUnavailable(InDomId),

    #[error("invalid connection handle {0}")]
    BadHandle(u32),

    #[error("end of archive")]
    EndOfArchive,

    #[error("archive: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SourceError {
    /// True for failures of the connection itself, as opposed to failures
    /// to find something on a working connection.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            SourceError::ConnectionRefused { .. }
                | SourceError::PermissionDenied { .. }
                | SourceError::ConnectionLimit { .. }
                | SourceError::ConnectionLost { .. }
                | SourceError::UnknownHost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
