//! Error taxonomy for the conversation engine.
//!
//! Each external concern gets its own error type so callers can decide
//! per-conversation whether a failure is fatal. `BackendError` unifies them
//! for code paths that touch more than one concern.

use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    MissingCredential(&'static str),

    #[error("invalid entry {entry:?} in ignored chats list (expected an integer chat id)")]
    InvalidIgnoreEntry { entry: String },

    #[error("unknown driver {0:?} (expected \"listen\" or \"poll\")")]
    UnknownDriver(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("system prompt file {path:?} could not be read: {source}")]
    PromptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Completion call failures. Recoverable per call.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("completion request failed: {0}")]
    Network(String),

    #[error("completion provider rejected credentials (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("completion provider quota exceeded (HTTP {status}): {body}")]
    Quota { status: u16, body: String },

    #[error("completion provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    #[error("completion provider returned no choices")]
    EmptyResponse,
}

/// Messaging transport failures. Recoverable per operation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Network(String),

    #[error("transport API error: {0}")]
    Api(String),

    #[error("malformed transport response: {0}")]
    MalformedResponse(String),

    #[error("transport stream closed")]
    Closed,
}

/// Disk read/write failures for conversation records and cursors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt conversation record {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize conversation record: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Shortens text for log lines so a long message does not flood the output.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("zażółć gęślą", 4), "zażó...");
    }

    #[test]
    fn backend_error_wraps_provider_error_transparently() {
        let err: BackendError = ProviderError::EmptyResponse.into();
        assert_eq!(err.to_string(), "completion provider returned no choices");
        assert!(matches!(err, BackendError::Provider(_)));
    }
}
