//! Error types for shmkit

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("no space: cannot allocate {requested} bytes")]
    NoSpace { requested: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object already registered: {0}")]
    AlreadyRegistered(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("doorbell error: {0}")]
    Doorbell(#[from] std::io::Error),

    #[error("queue signalled but empty")]
    QueueEmpty,
}

pub type Result<T> = std::result::Result<T, Error>;
