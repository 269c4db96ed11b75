use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA error: {0}")]
    Rsa(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid blinding factor")]
    InvalidBlindingFactor,

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Message too large for modulus")]
    MessageTooLarge,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
