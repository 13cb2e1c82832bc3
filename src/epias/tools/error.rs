use std::path::PathBuf;

use thiserror::Error;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Fatal errors that abort a run before or after the download phase.
///
/// Per-meter failures never surface through this type; the fetch orchestrator
/// folds them into [`FetchOutcome::NotFound`](crate::model::FetchOutcome).
#[derive(Debug, Error)]
pub enum ToolError {
    /// Wrapper for IO failures such as reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised when JSON serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors bubbled up from the Excel writer implementation.
    #[error("Excel write error: {0}")]
    ExcelWrite(#[from] rust_xlsxwriter::XlsxError),

    /// Errors bubbled up from the Excel reader implementation.
    #[error("Excel read error: {0}")]
    ExcelRead(#[from] calamine::XlsxError),

    /// The ticket authority refused to issue the run's authorization ticket.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Raised when a sheet does not follow the expected conventions.
    #[error("invalid workbook structure: {0}")]
    InvalidWorkbook(String),

    /// Raised when the input workbook does not exist.
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    /// Raised when none of the accepted id headers is present.
    #[error("no meter id column found, expected one of {expected:?}")]
    MissingIdColumn { expected: Vec<String> },

    /// Raised when an id cell cannot be read as an integer meter id.
    #[error("invalid meter id '{value}' in row {row}")]
    InvalidEntityId { row: usize, value: String },

    /// Raised when configuration cannot be loaded or fails validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Raised when the HTTP client cannot be constructed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

/// Failures talking to the CAS ticket authority.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The authority answered with a non-success status.
    #[error("ticket authority rejected the request with status {status}")]
    Rejected { status: u16 },

    /// The ticket-granting response did not point at a TGT resource.
    #[error("no ticket-granting ticket in Location header '{location}'")]
    MissingTicket { location: String },

    /// The service ticket response body was empty.
    #[error("empty service ticket returned")]
    EmptyServiceTicket,

    /// The call never produced a usable response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Wire-level failures from the retrying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other client-side request failure.
    #[error("request failed: {0}")]
    Request(String),

    /// Every attempt ended with a retryable status.
    #[error("status {status} persisted after {attempts} attempts")]
    RetriesExhausted { status: u16, attempts: u32 },
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_convert_into_fatal_tool_errors() {
        let error: ToolError = AuthError::Rejected { status: 401 }.into();
        assert!(matches!(error, ToolError::Auth(AuthError::Rejected { status: 401 })));
        assert_eq!(
            error.to_string(),
            "authentication failed: ticket authority rejected the request with status 401"
        );
    }

    #[test]
    fn missing_id_column_lists_expected_headers() {
        let error = ToolError::MissingIdColumn {
            expected: vec!["Meter ID".into(), "SayacID".into()],
        };
        assert!(error.to_string().contains("\"Meter ID\""));
    }
}
