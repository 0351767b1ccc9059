//! Wiring shared by the server and the CLI indexer.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::catalog::{Catalog, MemoryCatalog, PgCatalog};
use crate::indexer::extractor::PlainTextExtractor;
use crate::rag::embeddings::{create_embedder, Embedder};
use crate::rag::memory_index::InMemoryIndex;
use crate::rag::pipeline::{IngestPipeline, PipelineSettings};
use crate::rag::vector_store::{IndexSetup, QdrantIndex, VectorIndex};
use crate::server::Backends;
use crate::settings::{IndexBackend, Settings};
use crate::storage::{LocalObjectStore, ObjectStore};

/// `RUST_LOG` wins; `info` otherwise.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

pub struct Components {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn Catalog>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub backends: Backends,
}

impl Components {
    pub async fn build(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(settings.storage.root_dir.clone()));

        let (catalog, catalog_name): (Arc<dyn Catalog>, &str) = match &settings.database.url {
            Some(url) => {
                let catalog = PgCatalog::new(url, settings.database.max_connections)
                    .await
                    .context("failed to connect to database")?;
                catalog.init_schema().await.context("failed to initialize schema")?;
                (Arc::new(catalog) as Arc<dyn Catalog>, "postgres")
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory catalog");
                (Arc::new(MemoryCatalog::new()) as Arc<dyn Catalog>, "memory")
            }
        };

        let embedder = create_embedder(&settings.embedding).context("failed to create embedder")?;

        let index_settings = &settings.vector_index;
        let (index, index_name): (Arc<dyn VectorIndex>, &str) = match index_settings.backend {
            IndexBackend::Qdrant => {
                let qdrant =
                    QdrantIndex::new(index_settings).context("failed to create Qdrant client")?;
                (Arc::new(qdrant) as Arc<dyn VectorIndex>, "qdrant")
            }
            IndexBackend::Memory => {
                let memory = InMemoryIndex::new(index_settings.dimension, index_settings.metric);
                (Arc::new(memory) as Arc<dyn VectorIndex>, "memory")
            }
        };

        match index
            .ensure_namespace_space(index_settings.dimension, index_settings.metric)
            .await
            .context("failed to prepare vector index")?
        {
            IndexSetup::Created => tracing::info!(
                collection = %index_settings.collection,
                dimension = index_settings.dimension,
                "vector index created"
            ),
            IndexSetup::Existing => tracing::info!(
                collection = %index_settings.collection,
                "vector index ready"
            ),
            IndexSetup::Recreated { previous_dimension } => tracing::warn!(
                collection = %index_settings.collection,
                previous_dimension,
                dimension = index_settings.dimension,
                "vector index recreated with new dimension; documents must be re-ingested"
            ),
        }

        Ok(Self {
            store,
            catalog,
            embedder,
            index,
            backends: Backends {
                vector_index: index_name.to_string(),
                catalog: catalog_name.to_string(),
                object_store: "local".to_string(),
            },
        })
    }

    pub fn pipeline(&self, settings: &Settings) -> IngestPipeline {
        IngestPipeline::new(
            self.store.clone(),
            Arc::new(PlainTextExtractor),
            self.embedder.clone(),
            self.index.clone(),
            self.catalog.clone(),
            PipelineSettings {
                chunking: settings.chunking,
                batch_size: settings.embedding.batch_size,
                temp_dir: settings.storage.temp_dir.clone(),
            },
        )
    }
}
