use thiserror::Error;

use crate::circuit::WireId;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal session failures.
///
/// Every variant aborts the session; no retries are attempted at the
/// protocol layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection lost, or a frame could not be read or decoded.
    #[error("transport error: {0}")]
    Transport(String),

    /// A well-formed message arrived that the current state cannot accept,
    /// or transmitted protocol data is structurally inconsistent.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Decryption of a garbled-table entry yielded an ill-formed plaintext.
    #[error("garbled table corrupt at gate {0}")]
    GarbledTableCorrupt(WireId),

    /// Prime generation, factoring or generator search failed.
    #[error("group error: {0}")]
    Group(String),

    /// Empty input file, non-integer token or negative integer.
    #[error("input error: {0}")]
    Input(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
