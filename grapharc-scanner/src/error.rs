use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// "Please reduce the amount of data you're asking for"
pub const TOO_MUCH_DATA_CODE: i64 = 1;
/// GraphMethodException code; paired with [`UNSUPPORTED_REQUEST_SUBCODE`] it
/// marks an "Unsupported get request" that is sometimes transient.
pub const UNSUPPORTED_REQUEST_CODE: i64 = 100;
pub const UNSUPPORTED_REQUEST_SUBCODE: i64 = 33;

/// An error object returned by the remote API in place of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphApiError {
    pub code: i64,
    pub subcode: Option<i64>,
    pub message: String,
    pub kind: Option<String>,
    pub transient: bool,
}

impl GraphApiError {
    /// Parses `{"error": {...}}` bodies. Returns `None` when the body is not an
    /// API error envelope.
    pub fn from_body(body: &Value) -> Option<Self> {
        let error = body.get("error")?.as_object()?;
        Some(Self {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            subcode: error.get("error_subcode").and_then(Value::as_i64),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            kind: error.get("type").and_then(Value::as_str).map(str::to_string),
            transient: error
                .get("is_transient")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn is_too_much_data(&self) -> bool {
        self.code == TOO_MUCH_DATA_CODE
    }

    pub fn is_unsupported_request(&self) -> bool {
        self.code == UNSUPPORTED_REQUEST_CODE && self.subcode == Some(UNSUPPORTED_REQUEST_SUBCODE)
    }
}

impl fmt::Display for GraphApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}", self.message, self.code)?;
        if let Some(subcode) = self.subcode {
            write!(f, ", subcode {}", subcode)?;
        }
        write!(f, ")")
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Graph API error: {0}")]
    RemoteProtocol(GraphApiError),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP status {status} for {url}")]
    RetryableStatus { status: u16, url: String },

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Resume error: {0}")]
    Resume(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error processing {node_id}: {source}")]
    Node {
        node_id: String,
        #[source]
        source: Box<ScanError>,
    },
}

impl ScanError {
    /// The API error behind this error, looking through node context.
    pub fn api_error(&self) -> Option<&GraphApiError> {
        match self {
            ScanError::RemoteProtocol(e) => Some(e),
            ScanError::Node { source, .. } => source.api_error(),
            _ => None,
        }
    }

    /// The node being processed when the error happened, if known.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ScanError::Node { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn for_node(self, node_id: impl Into<String>) -> Self {
        match self {
            ScanError::Node { .. } => self,
            other => ScanError::Node {
                node_id: node_id.into(),
                source: Box::new(other),
            },
        }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
