use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid attribution model: {0}")]
    InvalidModel(String),

    #[error("invalid lookback window: {0} days")]
    InvalidLookback(u32),
}
