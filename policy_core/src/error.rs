// Error taxonomy for the policy core.
//
// Every variant is recoverable: administrative callers turn them into reply
// values, list/import paths log and skip, and the evaluation path never sees
// them at all (it degrades to the fail-safe verdict instead).

use thiserror::Error;

/// Errors raised by policy core operations
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Profile already exists: {0}")]
    DuplicateName(String),

    #[error("Invalid profile name: {0:?}")]
    InvalidName(String),

    #[error("Profile is active and cannot be deleted: {0}")]
    ProfileInUse(String),

    #[error("Invalid list entry at line {line}: {reason}")]
    InvalidEntry { line: usize, reason: String },

    #[error("Malformed flow: {0}")]
    MalformedFlow(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported rule blob version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Invalid rule blob: {0}")]
    InvalidBlob(String),
}

impl PolicyError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        PolicyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
