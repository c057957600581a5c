use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Engine-level errors surfaced across the service boundary.
///
/// The variants map onto distinct caller-visible conditions: transport
/// failures may be recoverable per feed, storage errors abort the batch,
/// invalid input is rejected before any mutation, and `Busy` signals that
/// another batch operation holds the single-flight guard.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-level error fetching a feed document or resource
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    /// Feed document could not be parsed
    #[error("Failed to parse feed {url}: {message}")]
    Malformed { url: String, message: String },

    /// Storage integrity or query error
    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Request rejected before any mutation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another batch operation is already in progress
    #[error("Another fetch or archive operation is already in progress")]
    Busy,

    /// Archive cache I/O error
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource body exceeded the configured size cap
    #[error("Resource too large (over {0} bytes)")]
    TooLarge(u64),

    /// HTML fragment could not be rewritten
    #[error("HTML rewrite error: {0}")]
    Rewrite(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
