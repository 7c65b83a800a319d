use serde::{Deserialize, Serialize};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Download,
    Upload,
}

/// Stable error code reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorCode {
    /// Local file missing, unreadable, or its directory cannot be created.
    FileNotFound,
    /// Bad scheme, failed handshake, or malformed server reply.
    InvalidUrl,
    /// Network failure (after retries, for downloads).
    ConnectionError,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::FileNotFound => 1,
            ErrorCode::InvalidUrl => 2,
            ErrorCode::ConnectionError => 3,
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code.as_u8()
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::FileNotFound),
            2 => Ok(ErrorCode::InvalidUrl),
            3 => Ok(ErrorCode::ConnectionError),
            other => Err(format!("unknown transfer error code: {other}")),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::InvalidUrl => "invalid url",
            ErrorCode::ConnectionError => "connection error",
        };
        write!(f, "{name} ({})", self.as_u8())
    }
}

/// Terminal failure of a transfer, as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub code: ErrorCode,
    pub source: String,
    pub target: String,
}

impl TransferFailure {
    pub fn new(code: ErrorCode, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            code,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Descriptor of a downloaded file inside an application workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalArtifact {
    /// File name without directories.
    pub name: String,
    /// Path relative to the workspace root, starting with `/`.
    pub full_path: String,
    /// Size in bytes.
    pub size: u64,
}

/// Event reported for a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// Bytes confirmed so far.
    Progress {
        source: String,
        complete: u64,
        total: u64,
    },
    /// Transfer finished. Downloads carry the local artifact.
    Completed {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<LocalArtifact>,
    },
    /// Transfer stopped with an error.
    Failed(TransferFailure),
}

impl TransferEvent {
    /// Returns `true` for completion and failure events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress { .. })
    }
}
