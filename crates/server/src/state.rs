use crate::auth::SessionKeys;
use crate::config::Config;
use crate::error::AppError;
use crate::keys::KeyManager;
use crate::kms::StaticKms;
use crate::ledger::CreditLedger;
use crate::moderation::{AzureContentSafety, ContentModerator};
use crate::proxy::LlmProxy;
use crate::semaphore::SemaphoreRegistry;
use crate::store::{DocumentStore, PgDocumentStore};
use crate::upstream::{HttpLlmUpstream, UpstreamConfig};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn DocumentStore>,
    pub keys: Arc<KeyManager>,
    pub sessions: Arc<SessionKeys>,
    pub ledger: Arc<CreditLedger>,
    pub proxy: Arc<LlmProxy>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let db = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await
            .map_err(AppError::Database)?;

        let store: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(db.clone()));

        let kms = StaticKms::from_master_key_b64(&config.kms_master_key)?;
        let keys = Arc::new(KeyManager::load_all(&config.models, &kms, store.as_ref()).await?);

        let semaphores = SemaphoreRegistry::new();
        let http_client = reqwest::Client::new();

        let moderation_api = Arc::new(AzureContentSafety::new(
            config.moderation_endpoint.clone(),
            config.moderation_api_key.clone(),
            http_client.clone(),
        ));
        let moderator = Arc::new(ContentModerator::new(
            moderation_api,
            Arc::clone(&store),
            config.max_offensive_severity,
        ));

        let upstream = Arc::new(HttpLlmUpstream::new(
            http_client,
            UpstreamConfig {
                google_api_key: config.google_api_key.clone(),
                azure_openai_api_key: config.azure_openai_api_key.clone(),
                azure_chat_completions_url: config.azure_chat_completions_url.clone(),
            },
        ));

        let ledger = Arc::new(CreditLedger::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&semaphores),
        ));
        let proxy = Arc::new(LlmProxy::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            semaphores,
            moderator,
            upstream,
        ));

        let sessions = Arc::new(SessionKeys::new(config.session_secret.as_bytes()));

        Ok(Self {
            db,
            store,
            keys,
            sessions,
            ledger,
            proxy,
        })
    }
}
