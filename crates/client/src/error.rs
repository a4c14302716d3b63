//! Client-facing error type.

use uuid::Uuid;

use spider_core::envelope::CodecError;
use spider_core::error::StorageErr;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageErr),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("driver id {0} already in use")]
    DriverIdInUse(Uuid),
    #[error("invalid task graph: {0}")]
    InvalidGraph(String),
    #[error("{0}")]
    Other(String),
}
