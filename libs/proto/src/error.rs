use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed control message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer did not switch protocols: expected '{expected}', got '{actual}'")]
    UpgradeMismatch {
        expected: &'static str,
        actual: String,
    },
}
