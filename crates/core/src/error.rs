// Error handling for the playback engine

use std::fmt;

/// Engine error types
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// A data source failed to open or read
    DataSourceError(String),

    /// The data source does not exist (file missing, HTTP 404)
    DataNotFound(String),

    /// The stream parser rejected the bytes it was given
    ParseError(String),

    /// Audio format not supported
    UnsupportedFormat(String),

    /// The playback sink failed to start, stop or reconfigure
    SinkError(String),

    /// Buffer bookkeeping went wrong (pool exhausted, unknown buffer returned)
    ResourceError(String),

    /// Operation is not valid in the current state
    InvalidState(String),

    /// Operation attempted after the player was disposed
    Disposed,

    /// IO error
    IoError(String),

    /// Network error (download/streaming)
    NetworkError(String),
}

/// Error codes reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DataSource,
    DataNotFound,
    StreamParseBytesFailed,
    CodecError,
    AudioSystemError,
    ResourceExhausted,
    Misuse,
    Other,
}

impl AudioError {
    /// Public error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AudioError::DataSourceError(_)
            | AudioError::NetworkError(_)
            | AudioError::IoError(_) => {
                ErrorCode::DataSource
            }
            AudioError::DataNotFound(_) => ErrorCode::DataNotFound,
            AudioError::ParseError(_) => ErrorCode::StreamParseBytesFailed,
            AudioError::UnsupportedFormat(_) => ErrorCode::CodecError,
            AudioError::SinkError(_) => ErrorCode::AudioSystemError,
            AudioError::ResourceError(_) => ErrorCode::ResourceExhausted,
            AudioError::InvalidState(_) | AudioError::Disposed => ErrorCode::Misuse,
        }
    }

    /// Errors raised while reading or parsing a single item.
    /// These can be recovered from when the item has not started playing yet.
    pub fn is_item_error(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::DataSource
                | ErrorCode::DataNotFound
                | ErrorCode::StreamParseBytesFailed
                | ErrorCode::CodecError
        )
    }
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AudioError::DataSourceError(msg) => write!(f, "Data source error: {}", msg),
            AudioError::DataNotFound(msg) => write!(f, "Data not found: {}", msg),
            AudioError::ParseError(msg) => write!(f, "Stream parse error: {}", msg),
            AudioError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            AudioError::SinkError(msg) => write!(f, "Sink error: {}", msg),
            AudioError::ResourceError(msg) => write!(f, "Resource error: {}", msg),
            AudioError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            AudioError::Disposed => write!(f, "Player has been disposed"),
            AudioError::IoError(msg) => write!(f, "IO error: {}", msg),
            AudioError::NetworkError(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for AudioError {}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AudioError>;

// Conversion implementations
impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AudioError::DataNotFound(err.to_string())
        } else {
            AudioError::IoError(err.to_string())
        }
    }
}
