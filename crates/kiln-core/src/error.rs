//! Error types for Kiln

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Kiln operations
#[derive(Debug, Error)]
pub enum KilnError {
    /// Unresolvable or incompatible generation policy. Fatal at plan time,
    /// raised before any provider call is made.
    #[error("Policy error: {0}")]
    Policy(String),

    /// A provider call failed after retries and fallback were exhausted.
    #[error("Provider '{provider}' failed: {message}")]
    Provider {
        provider: String,
        code: String,
        message: String,
    },

    /// A resolved path escapes the run's output root. Never retried,
    /// no I/O is attempted on the offending path.
    #[error("Path escapes output root: {path} (root: {root})")]
    PathSafety { path: PathBuf, root: PathBuf },

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Lock file error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::TomlParse(err.to_string())
    }
}
