mod auth;
mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};

use anyhow::{bail, Context};
use lexguard_agent::{GeminiBackend, OllamaBackend};
use lexguard_core::{
    agent::AnalysisBackend,
    config::Config,
    db::Db,
    pipeline::DocumentPipeline,
    storage::FsBlobStore,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{auth::JwtKeys, logging::BroadcastLayer};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub pipeline: Arc<DocumentPipeline>,
    pub jwt: JwtKeys,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

fn select_backend(config: &Config) -> anyhow::Result<Arc<dyn AnalysisBackend>> {
    match config.analysis_backend.as_str() {
        "gemini" => {
            if config.gemini_api_key.is_empty() {
                warn!("GEMINI_API_KEY is not set; every analysis will fail");
            }
            Ok(Arc::new(GeminiBackend::new(
                config.gemini_base_url.clone(),
                config.gemini_model.clone(),
                config.gemini_api_key.clone(),
                config.provider_request_timeout(),
            )?))
        }
        "ollama" => Ok(Arc::new(
            OllamaBackend::new(config.ollama_url.clone(), config.ollama_model.clone())
                .with_timeout(config.provider_request_timeout()),
        )),
        other => bail!("unknown ANALYSIS_BACKEND {other:?} (expected gemini or ollama)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
        logging::RING_CAPACITY,
    )));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "lexguard_server=info,lexguard_core=info,lexguard_agent=info,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    if config.jwt_secret.is_empty() {
        bail!("JWT_SECRET must be set");
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir))?;
    let mut db = Db::open(&config.db_path().to_string_lossy())?;
    db.migrate()?;

    // Seed DB with .env values on first run, then load DB overrides
    config.seed_db(&db)?;
    let config = config.load_from_db(&db);

    let db = Arc::new(db);
    let storage = Arc::new(FsBlobStore::new(config.blob_root()));
    let analyzer = select_backend(&config)?;
    info!(
        "analysis backend {} (timeout {}s)",
        analyzer.name(),
        config.analysis_timeout().as_secs()
    );

    let jwt = JwtKeys::new(&config.jwt_secret);
    let addr = format!("{}:{}", config.web_bind, config.web_port);
    let pipeline = Arc::new(DocumentPipeline::new(
        db,
        storage,
        analyzer,
        Arc::new(config),
    ));

    let recovered = pipeline.recover_interrupted()?;
    if recovered > 0 {
        warn!("marked {recovered} interrupted analyses as failed");
    }

    let state = Arc::new(AppState {
        pipeline,
        jwt,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });
    let app = routes::router(state);

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
