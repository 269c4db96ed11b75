use anyhow::Result;
use clap::Parser;
use llmmask_crypto::envelope::{random_key, DekCipher};
use llmmask_server::config::Config;
use llmmask_server::kms::{Kms, StaticKms};
use llmmask_server::models::{RsaKeyRecord, DEFAULT_PARTITION_KEY};
use llmmask_server::store::{DocumentStore, PgDocumentStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Provisions a model's RSA key record: generates a keypair, wraps the
/// private PEM under a fresh DEK, wraps the DEK under the KMS, and upserts
/// the record the server loads at startup.
#[derive(Parser, Debug)]
#[command(name = "keygen")]
#[command(about = "Provision a model's RSA key record", long_about = None)]
struct Args {
    #[arg(long, help = "Model id to provision keys for")]
    model: String,

    #[arg(long, default_value = "2048", help = "RSA modulus size in bits")]
    bits: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool));
    let kms = StaticKms::from_master_key_b64(&config.kms_master_key)?;

    tracing::info!(model = %args.model, bits = args.bits, "Generating RSA keypair");
    let (public_key_pem, private_pem) = llmmask_crypto::keys::generate_keypair_pem(args.bits)?;

    let dek = random_key();
    let private_key_wrapped = DekCipher::new(&dek).seal_b64(private_pem.as_bytes())?;
    let (dek_wrapped, kms_key_id) = kms.wrap_dek(&dek).await?;

    let record = RsaKeyRecord {
        id: args.model.clone(),
        partition_key: DEFAULT_PARTITION_KEY.to_string(),
        public_key_pem: public_key_pem.clone(),
        private_key_wrapped,
        dek_wrapped,
        kms_key_id,
    };
    store.upsert(&record).await?;

    tracing::info!(model = %args.model, "Key record provisioned");
    println!("{public_key_pem}");

    Ok(())
}
