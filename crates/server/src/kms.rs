use crate::error::AppError;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use llmmask_crypto::envelope::DekCipher;
use sha2::{Digest, Sha256};

/// Key-management contract: wrapping and unwrapping of data-encryption
/// keys. The cloud-vault-backed implementation is deployment glue; the
/// server only depends on this trait.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Unwraps a DEK. `key_id` names the wrapping key that produced the
    /// ciphertext, so mismatched key material fails loudly instead of
    /// producing garbage.
    async fn unwrap_dek(&self, wrapped_b64: &str, key_id: &str) -> Result<Vec<u8>, AppError>;

    /// Wraps a DEK, returning `(wrapped_b64, key_id)`.
    async fn wrap_dek(&self, dek: &[u8]) -> Result<(String, String), AppError>;
}

/// KMS over a single master key supplied via configuration.
pub struct StaticKms {
    cipher: DekCipher,
    key_id: String,
}

impl StaticKms {
    pub fn from_master_key_b64(master_key_b64: &str) -> Result<Self, AppError> {
        let key = general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| AppError::Config(format!("invalid KMS master key: {e}")))?;
        let cipher = DekCipher::from_slice(&key)?;

        let fingerprint = Sha256::digest(&key);
        let key_id = format!("static-{}", hex::encode(&fingerprint[..8]));

        Ok(Self { cipher, key_id })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

#[async_trait]
impl Kms for StaticKms {
    async fn unwrap_dek(&self, wrapped_b64: &str, key_id: &str) -> Result<Vec<u8>, AppError> {
        if key_id != self.key_id {
            return Err(AppError::Internal(format!(
                "DEK wrapped under unknown KMS key {key_id}"
            )));
        }
        Ok(self.cipher.open_b64(wrapped_b64)?)
    }

    async fn wrap_dek(&self, dek: &[u8]) -> Result<(String, String), AppError> {
        let wrapped = self.cipher.seal_b64(dek)?;
        Ok((wrapped, self.key_id.clone()))
    }
}
