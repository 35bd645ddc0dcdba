use thiserror::Error;

/// Every failure the scanning core can report.
///
/// Connection-level kinds abort a single target, `CommandTimeout` is recovered
/// per test, and `Plugin` is raised while validating plugin documents.
#[derive(Error, Debug)]
pub enum StarescError {
    #[error("malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("unsupported scheme `{scheme}` (supported: {supported})")]
    UnsupportedScheme { scheme: String, supported: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("command `{0}` timed out")]
    CommandTimeout(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("file transfer failed: {0}")]
    FileTransfer(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StarescError>;
