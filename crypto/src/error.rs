use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("invalid signature")]
    InvalidSignature,
}

impl From<hex::FromHexError> for CryptoError {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidHex(err.to_string())
    }
}
