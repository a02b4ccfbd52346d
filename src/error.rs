use thiserror::Error;

/// Main error type for swgraph
#[derive(Error, Debug)]
pub enum SwgraphError {
    /// Store errors (transaction could not commit, constraint failure, busy database)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote fetch failed. `status` is the HTTP status when one was received.
    #[error("Fetch error{}: {message}", status_suffix(.status))]
    Fetch {
        status: Option<u16>,
        message: String,
    },

    /// Fetched payload is missing its key field or has an unexpected shape
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Entity kind has no schema entry
    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SwgraphError {
    /// Build a fetch error without an HTTP status (network, timeout, body read).
    pub fn network(message: impl Into<String>) -> Self {
        SwgraphError::Fetch {
            status: None,
            message: message.into(),
        }
    }

    /// Whether retrying the same fetch can plausibly succeed.
    ///
    /// Network failures, 429 and 5xx are transient. Any other status, and every
    /// non-fetch error, is permanent for the entity at hand.
    pub fn is_transient(&self) -> bool {
        match self {
            SwgraphError::Fetch { status: None, .. } => true,
            SwgraphError::Fetch {
                status: Some(code), ..
            } => *code == 429 || (500..=599).contains(code),
            _ => false,
        }
    }

    /// Whether the store itself is unavailable (busy, locked, unreadable).
    ///
    /// These are retried at the transaction boundary and end the drain when
    /// they persist. Other database errors, such as constraint violations, are
    /// deterministic and stay with the entity being processed.
    pub fn is_store_failure(&self) -> bool {
        use rusqlite::ErrorCode;

        match self {
            SwgraphError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
            ),
            _ => false,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Convenient Result type using SwgraphError
pub type Result<T> = std::result::Result<T, SwgraphError>;
