use crate::store::Document;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Reserved for future partitioning; every document carries it today.
pub const DEFAULT_PARTITION_KEY: &str = "primary";

pub const RSA_KEYS_CONTAINER: &str = "rsa_keys";
pub const USERS_CONTAINER: &str = "users";
pub const AUTH_TOKENS_CONTAINER: &str = "auth_tokens";
pub const MODERATION_CONTAINER: &str = "moderation_verdicts";

fn default_partition_key() -> String {
    DEFAULT_PARTITION_KEY.to_string()
}

/// One RSA keypair per model, created out-of-band by the keygen tool.
/// The private key PEM is AES-wrapped under a DEK, which is itself wrapped
/// by the KMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaKeyRecord {
    pub id: String,
    #[serde(rename = "PartitionKey", default = "default_partition_key")]
    pub partition_key: String,
    pub public_key_pem: String,
    pub private_key_wrapped: String,
    pub dek_wrapped: String,
    pub kms_key_id: String,
}

impl Document for RsaKeyRecord {
    const CONTAINER: &'static str = RSA_KEYS_CONTAINER;

    fn doc_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(rename = "PartitionKey", default = "default_partition_key")]
    pub partition_key: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subscription_info: SubscriptionInfo,
}

impl UserRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key: default_partition_key(),
            email: String::new(),
            name: String::new(),
            subscription_info: SubscriptionInfo::default(),
        }
    }
}

impl Document for UserRecord {
    const CONTAINER: &'static str = USERS_CONTAINER;

    fn doc_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub active_credits: HashMap<String, i64>,
    #[serde(default)]
    pub used_credits: HashMap<String, i64>,
    /// Append-only; kept so credit counts can be recomputed if they are
    /// ever corrupted.
    #[serde(default)]
    pub payment_log: Vec<PaymentLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLog {
    pub transaction_id: String,
    pub credits_granted: HashMap<String, i64>,
}

/// Per-token bookkeeping. Written pre-expired at issuance as a tombstone for
/// the blinded token, then rewritten live by the first redemption. Once
/// `request_hash` is set it never changes for the life of the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    #[serde(rename = "PartitionKey", default = "default_partition_key")]
    pub partition_key: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, with = "base64_bytes_opt")]
    pub request_hash: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes_opt")]
    pub cached_response: Option<Vec<u8>>,
}

impl TokenRecord {
    /// Lifetime of a redeemable token from first redemption.
    pub const VALIDITY_DAYS: i64 = 5;

    /// The live record created by the first redemption of `token`.
    pub fn new_bound(token_id: String, model_id: String, request_hash: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: token_id,
            partition_key: default_partition_key(),
            model_id,
            created_at: now,
            expires_at: now + chrono::Duration::days(Self::VALIDITY_DAYS),
            request_hash: Some(request_hash),
            cached_response: None,
        }
    }

    /// The pre-expired tombstone written at issuance to reserve the blinded
    /// token's id.
    pub fn new_tombstone(tombstone_id: String, model_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: tombstone_id,
            partition_key: default_partition_key(),
            model_id,
            created_at: now,
            expires_at: now - chrono::Duration::days(7),
            request_hash: None,
            cached_response: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl Document for TokenRecord {
    const CONTAINER: &'static str = AUTH_TOKENS_CONTAINER;

    fn doc_id(&self) -> &str {
        &self.id
    }
}

/// Content-addressed moderation verdict, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: String,
    #[serde(rename = "PartitionKey", default = "default_partition_key")]
    pub partition_key: String,
    #[serde(with = "base64_bytes")]
    pub cached_response: Vec<u8>,
}

impl Document for ModerationRecord {
    const CONTAINER: &'static str = MODERATION_CONTAINER;

    fn doc_id(&self) -> &str {
        &self.id
    }
}

/// Redemption records are keyed by the unblinded token bytes.
pub fn token_record_id(token: &[u8]) -> String {
    general_purpose::STANDARD.encode(token)
}

/// Issuance tombstones are keyed by a hash of the blinded token; the client
/// has not unblinded yet, so the redemption-time id cannot be known here.
pub fn blinded_tombstone_id(blinded_token: &[u8]) -> String {
    let hash = Sha256::digest(blinded_token);
    general_purpose::STANDARD.encode(hash)
}

/// Moderation verdicts are keyed by the MD5 of the raw chunk bytes.
pub fn moderation_record_id(chunk: &[u8]) -> String {
    let hash = Md5::digest(chunk);
    general_purpose::STANDARD.encode(hash)
}

/// Binary fields cross the wire as base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

pub mod base64_bytes_opt {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_ids_are_stable_and_distinct() {
        let a = moderation_record_id(b"some chunk");
        let b = moderation_record_id(b"some chunk");
        let c = moderation_record_id(b"another chunk");
        assert_eq!(a, b);
        assert_ne!(a, c);

        assert_ne!(
            blinded_tombstone_id(b"token bytes"),
            token_record_id(b"token bytes")
        );
    }

    #[test]
    fn test_token_record_serde_roundtrip() {
        let record = TokenRecord::new_bound(
            token_record_id(b"tok"),
            "gemini-2.5-flash".to_string(),
            vec![1, 2, 3, 4],
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["PartitionKey"], DEFAULT_PARTITION_KEY);
        // Binary fields travel as base64 strings, not arrays.
        assert!(json["request_hash"].is_string());

        let back: TokenRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.request_hash, record.request_hash);
        assert_eq!(back.cached_response, None);
    }

    #[test]
    fn test_tombstone_is_pre_expired() {
        let tomb = TokenRecord::new_tombstone(
            blinded_tombstone_id(b"blinded"),
            "gemini-2.5-flash".to_string(),
        );
        assert!(tomb.is_expired(Utc::now()));
        assert!(tomb.request_hash.is_none());
    }

    #[test]
    fn test_user_record_defaults() {
        let user: UserRecord = serde_json::from_value(serde_json::json!({
            "id": "user-1",
        }))
        .unwrap();
        assert_eq!(user.partition_key, DEFAULT_PARTITION_KEY);
        assert!(user.subscription_info.active_credits.is_empty());
        assert!(user.subscription_info.payment_log.is_empty());
    }
}
