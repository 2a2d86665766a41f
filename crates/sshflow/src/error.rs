use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("queue {0:?} not found")]
    QueueNotFound(String),

    #[error("queue {0:?} is paused")]
    QueuePaused(String),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("custom id {0:?} is already taken")]
    DuplicateCustomId(String),

    #[error("job {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: i64,
        actual: String,
        expected: &'static str,
    },

    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh authentication rejected for user {0:?}")]
    AuthRejected(String),

    #[error("remote host did not answer the connection test")]
    Unreachable,

    #[error("ssh session is not connected")]
    NotConnected,

    #[error("command timed out after {0}s")]
    Timeout(i32),

    #[error("execution cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
