use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use voxlogica_core::config::EngineConfig;
use voxlogica_core::engine::ExecutionEngine;
use voxlogica_core::jobs::JobManager;
use voxlogica_core::resolver::ValueResolver;
use voxlogica_core::stdlib;
use voxlogica_core::store::ContentStore;
use voxlogica_core::store_memory::MemoryStore;
use voxlogica_core::store_sqlite::SqliteStore;
use voxlogica_server::http::{router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Arc::new(EngineConfig::from_env());
    std::fs::create_dir_all(&config.data_root)?;
    std::fs::create_dir_all(&config.scratch_dir)?;

    let store: Arc<dyn ContentStore> = match database_path() {
        Some(path) => {
            tracing::info!(path = %path, "using sqlite store");
            Arc::new(SqliteStore::open(std::path::Path::new(&path), config.lease_ttl).await?)
        }
        None => {
            tracing::info!("using in-memory store (no VOX_DB configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = Arc::new(stdlib::registry());
    let engine = Arc::new(ExecutionEngine::new(store, registry, config.clone()));
    let jobs = Arc::new(JobManager::new(engine)?);
    let resolver = Arc::new(ValueResolver::new(jobs.clone()));

    let app = router(AppState { jobs, resolver })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::env::var("VOX_LISTEN").unwrap_or_else(|_| "127.0.0.1:8090".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("voxlogica server listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Database file from `--db <path>` or the `VOX_DB` env var. No value
/// means the in-memory store.
fn database_path() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args.windows(2).find(|w| w[0] == "--db").map(|w| w[1].clone()) {
        return Some(path);
    }
    std::env::var("VOX_DB").ok()
}
