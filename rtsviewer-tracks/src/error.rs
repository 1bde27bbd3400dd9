use thiserror::Error;

/// Failures reported by a video track collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("Track is not active")]
    Inactive,

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Track error: {0}")]
    Track(#[from] TrackError),

    #[error("Serial queue closed for source {0}")]
    QueueClosed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
