// Error taxonomy for scanner commands, block downloads and local delivery.

use thiserror::Error;

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("response carried no body")]
    NoResponseBody,

    #[error("unexpected MIME type: {found}")]
    UnexpectedMimeType { found: String },

    #[error("multipart response has no boundary")]
    MissingBoundary,

    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),

    #[error("image block {block} download failed (code {code:?})")]
    DownloadFailed { block: u64, code: Option<String> },

    #[error("image block {block} response has no metadata part")]
    MissingMetadata { block: u64 },

    #[error("image block {block} response has no payload part")]
    MissingPayload { block: u64 },

    #[error("releasing image blocks {from}..={to} failed (code {code:?})")]
    ReleaseImageBlocksFailed {
        from: u64,
        to: u64,
        code: Option<String>,
    },

    #[error("{method} failed (code {code:?})")]
    CommandFailed {
        method: &'static str,
        code: Option<String>,
    },

    #[error("scanner reported success but returned no session id")]
    MissingSessionId,

    #[error("infoex response lists no api endpoint")]
    MissingApi,

    #[error("no open session")]
    NoSession,

    #[error("event polling abandoned after {attempts} failed attempts")]
    PollingAbandoned { attempts: u32 },

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("invalid scanner url: {0}")]
    InvalidUrl(String),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Whether the failure came from the network rather than from the scanner's answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::NoResponseBody | ScanError::Transport(_) | ScanError::HttpStatus(_)
        )
    }

    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::NoResponseBody => "no_response_body",
            ScanError::UnexpectedMimeType { .. } => "unexpected_mime_type",
            ScanError::MissingBoundary => "missing_boundary",
            ScanError::MalformedMultipart(_) => "malformed_multipart",
            ScanError::DownloadFailed { .. } => "download_failed",
            ScanError::MissingMetadata { .. } => "missing_metadata",
            ScanError::MissingPayload { .. } => "missing_payload",
            ScanError::ReleaseImageBlocksFailed { .. } => "release_image_blocks_failed",
            ScanError::CommandFailed { .. } => "command_failed",
            ScanError::MissingSessionId => "missing_session_id",
            ScanError::MissingApi => "missing_api",
            ScanError::NoSession => "no_session",
            ScanError::PollingAbandoned { .. } => "polling_abandoned",
            ScanError::HttpStatus(_) => "http_status",
            ScanError::InvalidUrl(_) => "invalid_url",
            ScanError::Transport(_) => "transport",
            ScanError::Json(_) => "json",
            ScanError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScanError::NoResponseBody.is_transient());
        assert!(ScanError::HttpStatus(503).is_transient());
        assert!(!ScanError::MissingBoundary.is_transient());
        assert!(!ScanError::DownloadFailed { block: 4, code: None }.is_transient());
    }

    #[test]
    fn test_display_names_block() {
        let err = ScanError::DownloadFailed {
            block: 7,
            code: Some("invalidImageBlockNumber".into()),
        };
        assert!(err.to_string().contains("block 7"));
        assert_eq!(err.kind(), "download_failed");
    }
}
