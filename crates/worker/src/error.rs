//! Worker-side error type.

use spider_core::envelope::CodecError;
use spider_core::error::StorageErr;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageErr),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("cannot spawn task executor: {0}")]
    Spawn(String),
    #[error("unknown task library: {0}")]
    UnknownLibrary(String),
    #[error("{0}")]
    Protocol(String),
}
