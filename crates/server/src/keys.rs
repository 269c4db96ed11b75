use crate::error::AppError;
use crate::kms::Kms;
use crate::models::RsaKeyRecord;
use crate::store::DocumentStore;
use llmmask_crypto::blind_signature::BlindSigner;
use llmmask_crypto::envelope::DekCipher;
use llmmask_crypto::keys::RsaKeyPair;
use std::collections::HashMap;

/// Holds one blind-RSA signer per model. Built once at startup and never
/// mutated afterwards; inject it, don't make it a global.
pub struct KeyManager {
    signers: HashMap<String, BlindSigner>,
}

impl KeyManager {
    pub fn from_pairs(pairs: HashMap<String, RsaKeyPair>) -> Self {
        let signers = pairs
            .into_iter()
            .map(|(model, pair)| (model, BlindSigner::new(pair)))
            .collect();
        Self { signers }
    }

    /// Loads every model's keypair from the store, unwrapping the DEK via
    /// the KMS and the private PEM via the DEK. Any single failure is fatal:
    /// the process must not start with a partial keyset.
    pub async fn load_all(
        models: &[String],
        kms: &dyn Kms,
        store: &dyn DocumentStore,
    ) -> Result<Self, AppError> {
        let mut pairs = HashMap::new();

        for model in models {
            tracing::info!(model = %model, "Loading RSA keys");

            let record: RsaKeyRecord = store
                .fetch(model)
                .await?
                .ok_or_else(|| AppError::Config(format!("no RSA key record for model {model}")))?;

            let dek = kms.unwrap_dek(&record.dek_wrapped, &record.kms_key_id).await?;
            let cipher = DekCipher::from_slice(&dek)?;

            let private_pem_bytes = cipher.open_b64(&record.private_key_wrapped)?;
            let private_pem = String::from_utf8(private_pem_bytes).map_err(|_| {
                AppError::Internal(format!("private key PEM for {model} is not UTF-8"))
            })?;

            let pair = llmmask_crypto::keys::load_keypair(&private_pem, &record.public_key_pem)?;
            pairs.insert(model.clone(), pair);

            tracing::info!(model = %model, "Loaded RSA keys");
        }

        Ok(Self::from_pairs(pairs))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.signers.contains_key(model)
    }

    pub fn sign_blinded(&self, model: &str, blinded: &[u8]) -> Result<Vec<u8>, AppError> {
        let signer = self
            .signers
            .get(model)
            .ok_or_else(|| AppError::UnknownModel(model.to_string()))?;
        Ok(signer.sign_blinded(blinded)?)
    }

    /// `false` means the signature does not check out; cryptographic
    /// mismatch is never an error here.
    pub fn verify_unblinded(
        &self,
        model: &str,
        token: &[u8],
        signed_token: &[u8],
    ) -> Result<bool, AppError> {
        let signer = self
            .signers
            .get(model)
            .ok_or_else(|| AppError::UnknownModel(model.to_string()))?;
        Ok(signer.verify_unblinded(token, signed_token))
    }

    pub fn public_key_pem(&self, model: &str) -> Result<String, AppError> {
        let signer = self
            .signers
            .get(model)
            .ok_or_else(|| AppError::UnknownModel(model.to_string()))?;
        Ok(signer.public_key_pem()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::StaticKms;
    use crate::store::MemDocumentStore;
    use base64::{engine::general_purpose, Engine as _};
    use llmmask_crypto::blind_signature::BlindClient;
    use llmmask_crypto::envelope::random_key;
    use std::sync::Arc;

    const MODEL: &str = "gemini-2.5-flash";

    pub(crate) async fn provision_key_record(
        store: &dyn DocumentStore,
        kms: &dyn Kms,
        model: &str,
    ) -> RsaKeyRecord {
        let (public_pem, private_pem) = llmmask_crypto::keys::generate_keypair_pem(2048).unwrap();

        let dek = random_key();
        let cipher = DekCipher::new(&dek);
        let private_key_wrapped = cipher.seal_b64(private_pem.as_bytes()).unwrap();
        let (dek_wrapped, kms_key_id) = kms.wrap_dek(&dek).await.unwrap();

        let record = RsaKeyRecord {
            id: model.to_string(),
            partition_key: "primary".to_string(),
            public_key_pem: public_pem,
            private_key_wrapped,
            dek_wrapped,
            kms_key_id,
        };
        store.upsert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_load_all_and_sign_verify() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemDocumentStore::new());
        let kms =
            StaticKms::from_master_key_b64(&general_purpose::STANDARD.encode(random_key()))
                .unwrap();

        let record = provision_key_record(store.as_ref(), &kms, MODEL).await;

        let models = vec![MODEL.to_string()];
        let manager = KeyManager::load_all(&models, &kms, store.as_ref())
            .await
            .unwrap();

        assert!(manager.contains(MODEL));
        assert_eq!(manager.public_key_pem(MODEL).unwrap(), record.public_key_pem);

        let client = BlindClient::from_pem(&record.public_key_pem).unwrap();
        let token = b"thirty-two bytes of token stuff!";
        let blinded = client.blind(token).unwrap();
        let blind_sig = manager.sign_blinded(MODEL, &blinded.blinded_message).unwrap();
        let signature = client
            .unblind(&blind_sig, &blinded.blinding_factor)
            .unwrap();

        assert!(manager.verify_unblinded(MODEL, token, &signature).unwrap());
        assert!(!manager
            .verify_unblinded(MODEL, b"some other token bytes here pls!", &signature)
            .unwrap());
    }

    #[tokio::test]
    async fn test_load_all_fails_on_missing_record() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemDocumentStore::new());
        let kms =
            StaticKms::from_master_key_b64(&general_purpose::STANDARD.encode(random_key()))
                .unwrap();

        let models = vec![MODEL.to_string()];
        assert!(KeyManager::load_all(&models, &kms, store.as_ref())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_model_errors() {
        let manager = KeyManager::from_pairs(HashMap::new());
        assert!(matches!(
            manager.sign_blinded("nope", b"x"),
            Err(AppError::UnknownModel(_))
        ));
        assert!(matches!(
            manager.verify_unblinded("nope", b"x", b"y"),
            Err(AppError::UnknownModel(_))
        ));
    }
}
