use crate::error::AppError;
use crate::keys::KeyManager;
use crate::models::{base64_bytes, base64_bytes_opt, token_record_id, TokenRecord};
use crate::moderation::ContentModerator;
use crate::semaphore::{token_handle, SemaphoreRegistry};
use crate::store::DocumentStore;
use crate::upstream::{family_for, LlmUpstream};
use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// The envelope key inside `extra_body`. Dropped from the body before
/// anything reaches a vendor.
pub const ENVELOPE_KEY: &str = "llmmask";

/// Redemption credentials carried on the proxied body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionEnvelope {
    #[serde(rename = "Token", with = "base64_bytes")]
    pub token: Vec<u8>,
    #[serde(rename = "SignedToken", with = "base64_bytes")]
    pub signed_token: Vec<u8>,
    #[serde(rename = "ModelName")]
    pub model_name: String,
}

impl RedemptionEnvelope {
    /// Canonical bytes for hashing: the typed struct re-serialized with a
    /// fixed field order and encoding, so clients reordering JSON keys
    /// cannot change the hash.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self)
            .map_err(|e| AppError::Internal(format!("failed to serialize envelope: {e}")))
    }

    /// The binding hash covers the envelope and the canonical proxied body,
    /// so a token redeemed once cannot be replayed against different
    /// message content.
    pub fn request_hash(&self, canonical_body: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut hasher = Md5::new();
        hasher.update(self.canonical_bytes()?);
        hasher.update(canonical_body);
        Ok(hasher.finalize().to_vec())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub blocked_reason: String,
    #[serde(default)]
    pub size_limit_exceeded: bool,
    #[serde(default)]
    pub size_limit_reason: String,
    #[serde(default, with = "base64_bytes_opt")]
    pub metadata: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes_opt")]
    pub proxy_response: Option<Vec<u8>>,
}

/// Proxies chat-completion requests with token auth and all the bookkeeping
/// around them: replay protection, request binding, and response caching so
/// a network flake cannot waste a credit.
///
/// All vendors accept OpenAI-format calls, so clients send one format and
/// carry their credentials in `extra_body.llmmask`.
pub struct LlmProxy {
    store: Arc<dyn DocumentStore>,
    keys: Arc<KeyManager>,
    semaphores: Arc<SemaphoreRegistry>,
    moderator: Arc<ContentModerator>,
    upstream: Arc<dyn LlmUpstream>,
}

impl LlmProxy {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        keys: Arc<KeyManager>,
        semaphores: Arc<SemaphoreRegistry>,
        moderator: Arc<ContentModerator>,
        upstream: Arc<dyn LlmUpstream>,
    ) -> Self {
        Self {
            store,
            keys,
            semaphores,
            moderator,
            upstream,
        }
    }

    /// For a fixed token, the set of valid request envelopes is a singleton
    /// fixed by the first successful call, and every redemption after it
    /// returns the first call's bytes. A token cannot probe the vendor with
    /// varied inputs.
    pub async fn serve(&self, body_bytes: &[u8]) -> Result<ProxyResponse, AppError> {
        let mut body: Map<String, Value> = serde_json::from_slice(body_bytes)
            .map_err(|e| AppError::BadRequest(format!("request body is not a JSON object: {e}")))?;

        // Peel the envelope off before the body can go anywhere.
        let envelope_value = body
            .get_mut("extra_body")
            .and_then(Value::as_object_mut)
            .and_then(|extra| extra.remove(ENVELOPE_KEY))
            .ok_or_else(|| {
                AppError::BadRequest("missing extra_body.llmmask envelope".to_string())
            })?;
        let envelope: RedemptionEnvelope = serde_json::from_value(envelope_value)
            .map_err(|e| AppError::BadRequest(format!("malformed envelope: {e}")))?;

        let canonical = canonical_proxy_body(&mut body);

        let body_model = canonical
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("missing model field".to_string()))?;
        if body_model != envelope.model_name {
            return Err(AppError::ModelMismatch {
                expected: envelope.model_name,
            });
        }
        let model_name = envelope.model_name.clone();

        if family_for(&model_name).is_none() {
            return Err(AppError::UnknownModel(model_name));
        }

        if !self
            .keys
            .verify_unblinded(&model_name, &envelope.token, &envelope.signed_token)?
        {
            return Err(AppError::BadToken);
        }

        let proxy_body = serde_json::to_vec(&canonical)
            .map_err(|e| AppError::Internal(format!("failed to serialize proxy body: {e}")))?;

        // Concurrent redemptions of one token are totally ordered from here.
        let _guard = self
            .semaphores
            .acquire(&token_handle(&envelope.token), 1)
            .await;

        let token_id = token_record_id(&envelope.token);
        let request_hash = envelope.request_hash(&proxy_body)?;
        let now = Utc::now();

        let mut record = match self.store.fetch::<TokenRecord>(&token_id).await? {
            Some(record) => {
                if record.is_expired(now) {
                    return Err(AppError::TokenExpired);
                }
                if record.request_hash.as_deref() != Some(request_hash.as_slice()) {
                    return Err(AppError::RequestMismatch);
                }
                if let Some(cached) = &record.cached_response {
                    tracing::info!(token = %token_id, "Replaying cached redemption response");
                    let response = serde_json::from_slice(cached).map_err(|e| {
                        AppError::Internal(format!("malformed cached response: {e}"))
                    })?;
                    return Ok(response);
                }
                record
            }
            None => {
                TokenRecord::new_bound(token_id.clone(), model_name.clone(), request_hash)
            }
        };

        let analysis = self.moderator.analyze_request(&canonical).await?;
        let response = if self.moderator.is_offensive(&analysis) {
            tracing::info!(model = %model_name, "Blocked offensive request");
            ProxyResponse {
                is_blocked: true,
                blocked_reason: serde_json::to_string(&analysis.categories_analysis)
                    .map_err(|e| AppError::Internal(format!("failed to serialize verdict: {e}")))?,
                ..Default::default()
            }
        } else {
            let upstream_body = self.upstream.forward(&model_name, &proxy_body).await?;
            ProxyResponse {
                metadata: Some(b"lgtm".to_vec()),
                proxy_response: Some(upstream_body),
                ..Default::default()
            }
        };

        // Commit point: binding and cached response land in one upsert. Any
        // failure before this line leaves the token unbound and retryable.
        record.cached_response = Some(
            serde_json::to_vec(&response)
                .map_err(|e| AppError::Internal(format!("failed to serialize response: {e}")))?,
        );
        self.store.upsert(&record).await?;

        Ok(response)
    }
}

/// Strips the body down to `model` and `messages`. Everything else is
/// client-controlled noise that would destabilize the request hash and leak
/// fields upstream.
pub fn canonical_proxy_body(body: &mut Map<String, Value>) -> Value {
    let mut canonical = Map::new();
    if let Some(model) = body.remove("model") {
        canonical.insert("model".to_string(), model);
    }
    if let Some(messages) = body.remove("messages") {
        canonical.insert("messages".to_string(), messages);
    }
    Value::Object(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyManager;
    use crate::moderation::{ContentModerator, FakeModerationApi, DEFAULT_MAX_OFFENSIVE_SEVERITY};
    use crate::store::MemDocumentStore;
    use async_trait::async_trait;
    use llmmask_crypto::blind_signature::BlindClient;
    use rand::RngCore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MODEL: &str = "gemini-2.5-flash";

    struct FakeUpstream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmUpstream for FakeUpstream {
        async fn forward(&self, _model: &str, _body: &[u8]) -> Result<Vec<u8>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(br#"{"choices":[{"message":{"content":"ok"}}]}"#.to_vec())
        }
    }

    struct Fixture {
        proxy: LlmProxy,
        store: Arc<MemDocumentStore>,
        client: BlindClient,
        upstream: Arc<FakeUpstream>,
        moderation: Arc<FakeModerationApi>,
    }

    fn fixture() -> Fixture {
        let (public_pem, private_pem) = llmmask_crypto::keys::generate_keypair_pem(2048).unwrap();
        let pair = llmmask_crypto::keys::load_keypair(&private_pem, &public_pem).unwrap();
        let client = BlindClient::from_pem(&public_pem).unwrap();

        let keys = Arc::new(KeyManager::from_pairs(HashMap::from([(
            MODEL.to_string(),
            pair,
        )])));
        let store = Arc::new(MemDocumentStore::new());
        let store_dyn: Arc<dyn DocumentStore> = store.clone();

        let moderation = Arc::new(FakeModerationApi::new());
        let moderator = Arc::new(ContentModerator::new(
            moderation.clone(),
            store_dyn.clone(),
            DEFAULT_MAX_OFFENSIVE_SEVERITY,
        ));
        let upstream = Arc::new(FakeUpstream {
            calls: AtomicUsize::new(0),
        });

        let proxy = LlmProxy::new(
            store_dyn,
            keys,
            SemaphoreRegistry::new(),
            moderator,
            upstream.clone(),
        );

        Fixture {
            proxy,
            store,
            client,
            upstream,
            moderation,
        }
    }

    /// Blind-sign-unblind, exactly as a real client and the ledger would.
    fn redeemed_credentials(f: &Fixture) -> (Vec<u8>, Vec<u8>) {
        let mut token = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut token);

        let blinded = f.client.blind(&token).unwrap();
        let blind_sig = f
            .proxy
            .keys
            .sign_blinded(MODEL, &blinded.blinded_message)
            .unwrap();
        let signature = f
            .client
            .unblind(&blind_sig, &blinded.blinding_factor)
            .unwrap();
        (token.to_vec(), signature)
    }

    fn request_body(token: &[u8], signature: &[u8], model: &str, content: &str) -> Vec<u8> {
        let envelope = RedemptionEnvelope {
            token: token.to_vec(),
            signed_token: signature.to_vec(),
            model_name: model.to_string(),
        };
        serde_json::to_vec(&json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": content}],
            "temperature": 0.7,
            "stream": false,
            "extra_body": { "llmmask": serde_json::to_value(&envelope).unwrap() },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_forwards_and_caches() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let body = request_body(&token, &signature, MODEL, "hello");
        let response = f.proxy.serve(&body).await.unwrap();

        assert!(!response.is_blocked);
        assert!(response.proxy_response.is_some());
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 1);

        let record: TokenRecord = {
            let store: Arc<dyn DocumentStore> = f.store.clone();
            store
                .fetch(&token_record_id(&token))
                .await
                .unwrap()
                .unwrap()
        };
        assert!(record.request_hash.is_some());
        assert!(record.cached_response.is_some());
    }

    #[tokio::test]
    async fn test_replay_returns_identical_bytes_without_upstream_call() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let body = request_body(&token, &signature, MODEL, "hello");
        let first = f.proxy.serve(&body).await.unwrap();
        let second = f.proxy.serve(&body).await.unwrap();

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_is_bound_to_first_request() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let body = request_body(&token, &signature, MODEL, "hello");
        f.proxy.serve(&body).await.unwrap();

        // Same valid credentials, altered messages: the token stays bound
        // to the first body it saw.
        let altered = request_body(&token, &signature, MODEL, "something else entirely");
        assert!(matches!(
            f.proxy.serve(&altered).await,
            Err(AppError::RequestMismatch)
        ));
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_envelope_key_order_does_not_change_the_binding() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let body = request_body(&token, &signature, MODEL, "hello");
        f.proxy.serve(&body).await.unwrap();

        // Re-send with envelope keys in a different order; still the same
        // canonical envelope, so this is a plain replay.
        let b64 = |bytes: &[u8]| {
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
        };
        let reordered = serde_json::to_vec(&json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.7,
            "stream": false,
            "extra_body": { "llmmask": {
                "ModelName": MODEL,
                "SignedToken": b64(&signature),
                "Token": b64(&token),
            }},
        }))
        .unwrap();

        let replayed = f.proxy.serve(&reordered).await.unwrap();
        assert!(replayed.proxy_response.is_some());
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_model_mismatch_is_rejected() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let envelope = RedemptionEnvelope {
            token,
            signed_token: signature,
            model_name: "gpt-4o".to_string(),
        };
        let body = serde_json::to_vec(&json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hello"}],
            "extra_body": { "llmmask": serde_json::to_value(&envelope).unwrap() },
        }))
        .unwrap();

        assert!(matches!(
            f.proxy.serve(&body).await,
            Err(AppError::ModelMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let f = fixture();
        let (token, mut signature) = redeemed_credentials(&f);
        signature[0] ^= 0x01;

        let body = request_body(&token, &signature, MODEL, "hello");
        assert!(matches!(f.proxy.serve(&body).await, Err(AppError::BadToken)));
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_envelope_is_rejected() {
        let f = fixture();
        let body = serde_json::to_vec(&json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .unwrap();

        assert!(matches!(
            f.proxy.serve(&body).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let expired = TokenRecord {
            expires_at: Utc::now() - chrono::Duration::days(1),
            ..TokenRecord::new_bound(token_record_id(&token), MODEL.to_string(), vec![0; 16])
        };
        {
            let store: Arc<dyn DocumentStore> = f.store.clone();
            store.upsert(&expired).await.unwrap();
        }

        let body = request_body(&token, &signature, MODEL, "hello");
        assert!(matches!(
            f.proxy.serve(&body).await,
            Err(AppError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_offensive_request_is_blocked_bound_and_replayable() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);

        let body = request_body(&token, &signature, MODEL, "plan a rampage");
        let response = f.proxy.serve(&body).await.unwrap();

        assert!(response.is_blocked);
        assert!(response.blocked_reason.contains("Violence"));
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 0);

        // The block is cached: replay returns it without re-moderating.
        let moderation_calls = f.moderation.calls.load(Ordering::SeqCst);
        let replayed = f.proxy.serve(&body).await.unwrap();
        assert_eq!(replayed, response);
        assert_eq!(f.moderation.calls.load(Ordering::SeqCst), moderation_calls);
        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_make_one_upstream_call() {
        let f = fixture();
        let (token, signature) = redeemed_credentials(&f);
        let body = request_body(&token, &signature, MODEL, "hello");

        let proxy = Arc::new(f.proxy);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let proxy = Arc::clone(&proxy);
            let body = body.clone();
            tasks.push(tokio::spawn(async move { proxy.serve(&body).await }));
        }

        let mut responses = Vec::new();
        for task in tasks {
            responses.push(task.await.unwrap().unwrap());
        }

        assert_eq!(f.upstream.calls.load(Ordering::SeqCst), 1);
        for response in &responses[1..] {
            assert_eq!(response, &responses[0]);
        }
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let mut body: Map<String, Value> = serde_json::from_value(json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.9,
            "tools": [{"type": "function"}],
        }))
        .unwrap();

        let once = canonical_proxy_body(&mut body);
        let once_bytes = serde_json::to_vec(&once).unwrap();

        let mut again: Map<String, Value> = serde_json::from_slice(&once_bytes).unwrap();
        let twice = canonical_proxy_body(&mut again);

        assert_eq!(once_bytes, serde_json::to_vec(&twice).unwrap());
        assert!(once.get("temperature").is_none());
        assert!(once.get("tools").is_none());
    }
}
