use policy_core::PolicyError;
use thiserror::Error;

/// Failures of the daemon's own machinery. Policy decisions never produce
/// these; they surface from storage, configuration and the admin channel.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Snapshot storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Admin service is not running")]
    ChannelClosed,

    #[error("Unexpected admin reply: {0}")]
    UnexpectedReply(String),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
