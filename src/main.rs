use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use workspace_rag::bootstrap::{init_tracing, Components};
use workspace_rag::llm::Generator;
use workspace_rag::rag::jobs::IngestQueue;
use workspace_rag::rag::query::QueryService;
use workspace_rag::rag::retrieval::Retriever;
use workspace_rag::server::{router, AppState};
use workspace_rag::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング初期化
    init_tracing();

    let settings = Settings::load().context("failed to load settings")?;

    tracing::info!("Object store root: {}", settings.storage.root_dir.display());
    tracing::info!("Vector index: {:?} at {}", settings.vector_index.backend, settings.vector_index.url);
    tracing::info!("Embedding model: {} ({} dims)", settings.embedding.model, settings.embedding.dims);

    // コンポーネント初期化
    let components = Components::build(&settings).await?;
    let generator = Arc::new(Generator::from_settings(&settings.llm)?);

    let pipeline = Arc::new(components.pipeline(&settings));
    let jobs = IngestQueue::start(pipeline, settings.ingest);

    let retriever = Retriever::new(
        components.embedder.clone(),
        components.index.clone(),
        settings.retrieval.min_score,
    );
    let query = Arc::new(QueryService::new(
        components.catalog.clone(),
        retriever,
        generator.clone(),
        settings.retrieval.top_k,
    ));

    let state = Arc::new(AppState {
        store: components.store.clone(),
        catalog: components.catalog.clone(),
        jobs,
        query,
        generator,
        backends: components.backends.clone(),
        keep_alive: Duration::from_secs(settings.server.keep_alive_secs),
        max_upload_bytes: settings.server.max_upload_bytes,
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind_addr))?;
    tracing::info!("Backend server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
