//! Error types of this crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration fault detected before any device work is enqueued.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The Newton refiner produced an effective sample size of zero or a
    /// non-finite one. Decrease gamma or increase the pseudocount damping.
    #[error("divergence: {0}")]
    Divergence(String),
    /// A device worker died; the underlying cause is in the worker's panic
    /// message on stderr.
    #[error("device fault: {0}")]
    Device(String),
    /// I/O error while reading or writing run state.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failed to write a checkpoint tensor.
    #[error(transparent)]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
    /// Failed to read a tensor from disk.
    #[error(transparent)]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand for a result with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
