use thiserror::Error;

use crate::RecordId;

/// Errors raised by the record model and codec layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("codec: {0}")]
    Codec(String),
    #[error("payload too large (>{max} bytes)")]
    TooLarge { max: usize },
    #[error("content missing {0}")]
    MissingField(&'static str),
    #[error("record not found: {0}")]
    NotFound(RecordId),
}

pub type CoreResult<T> = Result<T, CoreError>;
