use std::sync::Arc;

use anyhow::Result;
use dog_axum::{ServerConfig, TusApp};
use dog_blob::{MemoryObjectStore, ObjectStore, S3Config, S3ObjectStore};
use dog_core::{DogConfig, DogConfigSnapshot};
use dog_tus::{ExpirationReaper, FileSessionStore, MemorySessionStore, SessionStore, TusConfig, TusCoordinator};

async fn object_store(config: &DogConfigSnapshot) -> Arc<dyn ObjectStore> {
    let Some(bucket) = config.get_string("s3.bucket") else {
        tracing::warn!("s3.bucket is not set, uploads are kept in memory");
        return Arc::new(MemoryObjectStore::new());
    };

    let mut s3 = S3Config::new(bucket);
    if let Some(region) = config.get_string("s3.region") {
        s3 = s3.with_region(region);
    }
    if let Some(endpoint) = config.get_string("s3.endpoint") {
        s3 = s3.with_endpoint(endpoint);
    }
    if let (Some(key), Some(secret)) = (
        config.get_string("s3.access_key_id"),
        config.get_string("s3.secret_access_key"),
    ) {
        s3 = s3.with_credentials(key, secret);
    }
    Arc::new(S3ObjectStore::new(s3).await)
}

async fn session_store(config: &DogConfigSnapshot) -> Result<Arc<dyn SessionStore>> {
    let sessions: Arc<dyn SessionStore> = match config.get_string("sessions.dir") {
        Some(dir) => Arc::new(FileSessionStore::open(dir).await?),
        None => {
            tracing::warn!("sessions.dir is not set, upload sessions will not survive a restart");
            Arc::new(MemorySessionStore::new())
        }
    };
    Ok(sessions)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // DOGTUS__S3__BUCKET=uploads -> s3.bucket
    let mut raw = DogConfig::new();
    raw.load_env("DOGTUS__");
    let config = raw.snapshot();

    let uploads = TusCoordinator::new(
        object_store(&config).await,
        session_store(&config).await?,
        TusConfig::from_config(&config),
    );
    ExpirationReaper::new(uploads.clone()).spawn();

    let server = ServerConfig::from_config(&config);
    println!("[tus] listening on http://{}{}", server.addr(), server.base_path);

    TusApp::new(Arc::new(uploads), server).listen().await?;

    Ok(())
}
