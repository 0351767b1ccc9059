use async_trait::async_trait;
use qdrant_client::qdrant::{
    vectors_config, Condition, CountPointsBuilder, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    PointId, PointStruct, PointsIdsList, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::models::{Metric, Namespace, RetrievedChunk, VectorRecord};
use crate::settings::VectorIndexSettings;

/// Outcome of preparing the index for a given dimension and metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSetup {
    Created,
    Existing,
    Recreated { previous_dimension: usize },
}

/// Namespaced similarity index.
///
/// Every data operation is scoped to exactly one namespace. Calls either
/// succeed as a whole or fail with `IndexUnavailable`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Vector length the index currently accepts.
    fn dimension(&self) -> usize;

    /// Create the backing space if missing, recreating it when its dimension
    /// differs from `dimension`. Idempotent.
    async fn ensure_namespace_space(&self, dimension: usize, metric: Metric)
        -> RagResult<IndexSetup>;

    /// Insert or overwrite records by id.
    async fn upsert(&self, namespace: &Namespace, records: Vec<VectorRecord>) -> RagResult<()>;

    /// Up to `top_k` records ordered by descending similarity.
    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> RagResult<Vec<RetrievedChunk>>;

    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> RagResult<()>;

    async fn count(&self, namespace: &Namespace) -> RagResult<u64>;
}

const NAMESPACE_FIELD: &str = "namespace";

/// Qdrant adapter. All workspaces share one collection; the namespace is a
/// keyword-indexed payload field applied as a filter on every call.
pub struct QdrantIndex {
    client: Qdrant,
    collection_name: String,
    dimension: AtomicUsize,
    metric: RwLock<Metric>,
}

impl QdrantIndex {
    pub fn new(settings: &VectorIndexSettings) -> RagResult<Self> {
        tracing::info!("Building Qdrant client for URL: {}", settings.url);
        let client = Qdrant::from_url(&settings.url)
            .api_key(settings.api_key.clone())
            .build()
            .map_err(|e| {
                tracing::error!("Qdrant client build failed: {:?}", e);
                RagError::Configuration(format!("Qdrant client build failed: {}", e))
            })?;

        Ok(Self {
            client,
            collection_name: settings.collection.clone(),
            dimension: AtomicUsize::new(settings.dimension),
            metric: RwLock::new(settings.metric),
        })
    }

    fn metric(&self) -> Metric {
        match self.metric.read() {
            Ok(metric) => *metric,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn existing_dimension(&self) -> RagResult<Option<usize>> {
        let info = self.client.collection_info(&self.collection_name).await?;
        let size = info
            .result
            .and_then(|i| i.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size as usize),
                vectors_config::Config::ParamsMap(_) => None,
            });
        Ok(size)
    }

    async fn create_collection(&self, dimension: usize, metric: Metric) -> RagResult<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, distance(metric))),
            )
            .await?;
        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                &self.collection_name,
                NAMESPACE_FIELD,
                FieldType::Keyword,
            ))
            .await?;
        Ok(())
    }
}

fn distance(metric: Metric) -> Distance {
    match metric {
        Metric::Cosine => Distance::Cosine,
        Metric::Dot => Distance::Dot,
        Metric::Euclid => Distance::Euclid,
    }
}

/// Euclidean distance mapped into "higher is closer", in `(0, 1]`.
pub(crate) fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Qdrant reports euclid scores as raw distances; every other metric is
/// already a similarity.
fn similarity(metric: Metric, score: f32) -> f32 {
    match metric {
        Metric::Euclid => distance_to_similarity(score),
        Metric::Cosine | Metric::Dot => score,
    }
}

fn namespace_filter(namespace: &Namespace) -> Filter {
    Filter::must([Condition::matches(NAMESPACE_FIELD, namespace.as_str().to_string())])
}

/// Qdrant only accepts UUIDs or integers as point ids.
fn point_uuid(namespace: &Namespace, record_id: &str) -> String {
    let digest = Sha256::digest(format!("{}\u{0}{}", namespace, record_id).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn to_payload(namespace: &Namespace, record: &VectorRecord) -> JsonMap<String, JsonValue> {
    let meta = &record.metadata;
    let mut payload = JsonMap::new();
    payload.insert(NAMESPACE_FIELD.to_string(), JsonValue::from(namespace.as_str()));
    payload.insert("record_id".to_string(), JsonValue::from(record.id.as_str()));
    payload.insert("text".to_string(), JsonValue::from(meta.text.as_str()));
    payload.insert("source".to_string(), JsonValue::from(meta.source.as_str()));
    payload.insert("workspace".to_string(), JsonValue::from(meta.workspace.as_str()));
    payload.insert("chunk_index".to_string(), JsonValue::from(meta.chunk_index as u64));
    payload.insert("content_hash".to_string(), JsonValue::from(meta.content_hash.as_str()));
    payload
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::SeqCst)
    }

    async fn ensure_namespace_space(
        &self,
        dimension: usize,
        metric: Metric,
    ) -> RagResult<IndexSetup> {
        let setup = if !self.client.collection_exists(&self.collection_name).await? {
            self.create_collection(dimension, metric).await?;
            IndexSetup::Created
        } else {
            match self.existing_dimension().await? {
                Some(existing) if existing != dimension => {
                    tracing::warn!(
                        collection = %self.collection_name,
                        previous = existing,
                        dimension,
                        "collection dimension mismatch, recreating (existing vectors are lost)"
                    );
                    self.client.delete_collection(&self.collection_name).await?;
                    self.create_collection(dimension, metric).await?;
                    IndexSetup::Recreated {
                        previous_dimension: existing,
                    }
                }
                _ => IndexSetup::Existing,
            }
        };
        self.dimension.store(dimension, Ordering::SeqCst);
        match self.metric.write() {
            Ok(mut current) => *current = metric,
            Err(poisoned) => *poisoned.into_inner() = metric,
        }
        Ok(setup)
    }

    async fn upsert(&self, namespace: &Namespace, records: Vec<VectorRecord>) -> RagResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                let payload = to_payload(namespace, &record);
                PointStruct::new(point_uuid(namespace, &record.id), record.values, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> RagResult<Vec<RetrievedChunk>> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), top_k as u64)
                    .filter(namespace_filter(namespace))
                    .with_payload(true),
            )
            .await?;

        let field = |point: &qdrant_client::qdrant::ScoredPoint, key: &str| {
            point
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default()
        };

        let metric = self.metric();
        let mut results: Vec<RetrievedChunk> = search_result
            .result
            .iter()
            .map(|point| RetrievedChunk {
                id: field(point, "record_id"),
                text: field(point, "text"),
                score: similarity(metric, point.score),
                source: field(point, "source"),
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }

    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> RagResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<PointId> = ids
            .iter()
            .map(|id| PointId::from(point_uuid(namespace, id)))
            .collect();

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn count(&self, namespace: &Namespace) -> RagResult<u64> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(namespace_filter(namespace))
                    .exact(true),
            )
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}
