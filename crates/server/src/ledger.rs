use crate::cache::TtlCache;
use crate::error::AppError;
use crate::keys::KeyManager;
use crate::models::{base64_bytes, blinded_tombstone_id, PaymentLog, TokenRecord, UserRecord};
use crate::semaphore::{issue_handle, SemaphoreRegistry};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Retried issuance requests replay the original signature for this long,
/// so a client-side retry never costs a second credit.
const ISSUE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const ISSUE_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueTokenRequest {
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "BlindedToken", with = "base64_bytes")]
    pub blinded_token: Vec<u8>,
    #[serde(rename = "ModelName")]
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueTokenResponse {
    #[serde(rename = "ModelName")]
    pub model_name: String,
    #[serde(rename = "SignedBlindedToken", with = "base64_bytes")]
    pub signed_blinded_token: Vec<u8>,
}

/// Per-user credit accounting. Debits happen under the user's semaphore so
/// counts decrease monotonically and never go negative, fleet-wide.
pub struct CreditLedger {
    store: Arc<dyn DocumentStore>,
    keys: Arc<KeyManager>,
    semaphores: Arc<SemaphoreRegistry>,
    issue_cache: TtlCache<IssueTokenResponse>,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        keys: Arc<KeyManager>,
        semaphores: Arc<SemaphoreRegistry>,
    ) -> Self {
        Self {
            store,
            keys,
            semaphores,
            issue_cache: TtlCache::new(ISSUE_CACHE_CAPACITY, ISSUE_CACHE_TTL),
        }
    }

    /// Debits one credit from `user_id` for the requested model and signs
    /// the blinded token.
    ///
    /// If signing succeeds but the user write fails, the user keeps the
    /// credit and also holds a signature. That at-least-once window is
    /// accepted; the request-id cache keeps retries at exactly one debit.
    pub async fn issue(
        &self,
        user_id: &str,
        req: &IssueTokenRequest,
    ) -> Result<IssueTokenResponse, AppError> {
        let cache_key = format!("issue-token-{}", req.request_id);
        if let Some(cached) = self.issue_cache.get(&cache_key) {
            tracing::debug!(request_id = %req.request_id, "Replaying cached issuance response");
            return Ok(cached);
        }

        if !self.keys.contains(&req.model_name) {
            return Err(AppError::UnknownModel(req.model_name.clone()));
        }

        let _guard = self.semaphores.acquire(&issue_handle(user_id), 1).await;

        // A blinded token is signed at most once.
        let tombstone_id = blinded_tombstone_id(&req.blinded_token);
        if self
            .store
            .fetch::<TokenRecord>(&tombstone_id)
            .await?
            .is_some()
        {
            return Err(AppError::TokenReused);
        }

        // Re-read under the lock; the handler's copy may be stale.
        let mut user: UserRecord = self
            .store
            .fetch(user_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("user {user_id} not found")))?;

        let active = user
            .subscription_info
            .active_credits
            .get(&req.model_name)
            .copied()
            .unwrap_or(0);
        if active <= 0 {
            return Err(AppError::NoQuota);
        }
        let used = user
            .subscription_info
            .used_credits
            .get(&req.model_name)
            .copied()
            .unwrap_or(0);

        user.subscription_info
            .active_credits
            .insert(req.model_name.clone(), active - 1);
        user.subscription_info
            .used_credits
            .insert(req.model_name.clone(), used + 1);

        let signed_blinded_token = self.keys.sign_blinded(&req.model_name, &req.blinded_token)?;

        self.store.upsert(&user).await?;

        let tombstone = TokenRecord::new_tombstone(tombstone_id, req.model_name.clone());
        self.store.upsert(&tombstone).await?;

        let response = IssueTokenResponse {
            model_name: req.model_name.clone(),
            signed_blinded_token,
        };
        self.issue_cache.put(cache_key, response.clone());

        tracing::info!(user = %user_id, model = %req.model_name, "Issued signed blinded token");
        Ok(response)
    }

    /// Applies a payment event: grants credits and appends to the payment
    /// log. The log is what makes credit counts recomputable.
    pub async fn grant(
        &self,
        user_id: &str,
        transaction_id: &str,
        model_name: &str,
        credits: i64,
    ) -> Result<(), AppError> {
        let _guard = self.semaphores.acquire(&issue_handle(user_id), 1).await;

        let mut user: UserRecord = self
            .store
            .fetch(user_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("user {user_id} not found")))?;

        *user
            .subscription_info
            .active_credits
            .entry(model_name.to_string())
            .or_insert(0) += credits;
        user.subscription_info.payment_log.push(PaymentLog {
            transaction_id: transaction_id.to_string(),
            credits_granted: HashMap::from([(model_name.to_string(), credits)]),
        });

        self.store.upsert(&user).await?;

        tracing::info!(user = %user_id, model = %model_name, credits, "Granted credits");
        Ok(())
    }
}
