use thiserror::Error;

/// Fatal failures of an ingestion run.  Per-field parse problems never show
/// up here, they are absorbed by the normalizer.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Non-200 (or >= 400, depending on the policy) status, malformed
    /// envelope, or `success: false` from the remote service.
    #[error("remote service error (status {}): {message}", .status.map_or_else(|| "n/a".to_string(), |s| s.to_string()))]
    RemoteService { status: Option<u16>, message: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(#[from] duckdb::Error),

    #[error("storage error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Keep at most `max_chars` characters of a response body for error messages.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
