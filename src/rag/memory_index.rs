//! In-memory [`VectorIndex`] used in tests and when no Qdrant is configured.
//!
//! Records live in `namespace -> (id -> record)` maps behind a
//! `std::sync::RwLock`. Search is brute force over one namespace.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{RagError, RagResult};
use crate::models::{Metric, Namespace, RetrievedChunk, VectorRecord};
use crate::rag::vector_store::{distance_to_similarity, IndexSetup, VectorIndex};

type Namespaces = HashMap<String, HashMap<String, VectorRecord>>;

struct Space {
    dimension: usize,
    metric: Metric,
    created: bool,
}

pub struct InMemoryIndex {
    space: RwLock<Space>,
    namespaces: RwLock<Namespaces>,
}

impl InMemoryIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            space: RwLock::new(Space {
                dimension,
                metric,
                created: false,
            }),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RagResult<RwLockReadGuard<'_, Namespaces>> {
        self.namespaces
            .read()
            .map_err(|_| RagError::IndexUnavailable("in-memory index lock poisoned".into()))
    }

    fn write(&self) -> RagResult<RwLockWriteGuard<'_, Namespaces>> {
        self.namespaces
            .write()
            .map_err(|_| RagError::IndexUnavailable("in-memory index lock poisoned".into()))
    }

    fn metric(&self) -> RagResult<Metric> {
        self.space
            .read()
            .map(|s| s.metric)
            .map_err(|_| RagError::IndexUnavailable("in-memory index lock poisoned".into()))
    }
}

pub(crate) fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

fn score(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => cosine_sim(a, b),
        Metric::Dot => a.iter().zip(b.iter()).map(|(x, y)| x * y).sum(),
        Metric::Euclid => {
            let dist: f32 = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            distance_to_similarity(dist)
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn dimension(&self) -> usize {
        self.space.read().map(|s| s.dimension).unwrap_or(0)
    }

    async fn ensure_namespace_space(
        &self,
        dimension: usize,
        metric: Metric,
    ) -> RagResult<IndexSetup> {
        let mut space = self
            .space
            .write()
            .map_err(|_| RagError::IndexUnavailable("in-memory index lock poisoned".into()))?;

        let setup = if !space.created {
            IndexSetup::Created
        } else if space.dimension != dimension {
            tracing::warn!(
                previous = space.dimension,
                dimension,
                "in-memory index dimension mismatch, recreating"
            );
            self.write()?.clear();
            IndexSetup::Recreated {
                previous_dimension: space.dimension,
            }
        } else {
            IndexSetup::Existing
        };

        space.dimension = dimension;
        space.metric = metric;
        space.created = true;
        Ok(setup)
    }

    async fn upsert(&self, namespace: &Namespace, records: Vec<VectorRecord>) -> RagResult<()> {
        let dimension = self.dimension();
        if let Some(bad) = records.iter().find(|r| r.values.len() != dimension) {
            return Err(RagError::Configuration(format!(
                "record {} has {} values, index expects {}",
                bad.id,
                bad.values.len(),
                dimension
            )));
        }

        let mut namespaces = self.write()?;
        let entries = namespaces.entry(namespace.as_str().to_string()).or_default();
        for record in records {
            entries.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> RagResult<Vec<RetrievedChunk>> {
        let metric = self.metric()?;
        let namespaces = self.read()?;
        let Some(entries) = namespaces.get(namespace.as_str()) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<RetrievedChunk> = entries
            .values()
            .map(|record| RetrievedChunk {
                id: record.id.clone(),
                text: record.metadata.text.clone(),
                score: score(metric, vector, &record.values),
                source: record.metadata.source.clone(),
            })
            .collect();

        // ties broken by id so results are stable
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> RagResult<()> {
        let mut namespaces = self.write()?;
        if let Some(entries) = namespaces.get_mut(namespace.as_str()) {
            for id in ids {
                entries.remove(id);
            }
        }
        Ok(())
    }

    async fn count(&self, namespace: &Namespace) -> RagResult<u64> {
        let namespaces = self.read()?;
        Ok(namespaces
            .get(namespace.as_str())
            .map(|entries| entries.len() as u64)
            .unwrap_or(0))
    }
}
