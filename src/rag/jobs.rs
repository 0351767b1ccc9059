use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::rag::pipeline::IngestPipeline;
use crate::settings::IngestSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: Uuid,
    pub workspace_id: String,
    pub document_key: String,
    pub status: JobStatus,
    pub chunks_indexed: Option<usize>,
    pub error: Option<String>,
    /// [`RagError::kind`] of the last failure, or `"panic"`.
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Whether the last failure may succeed on another attempt.
    #[serde(default)]
    pub retryable: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type JobMap = Arc<RwLock<HashMap<Uuid, IngestJob>>>;

/// Background ingestion. Jobs are queued on a bounded channel and processed
/// one at a time by a single worker task. Status stays readable until the job
/// is among the oldest finished ones beyond `retained_jobs`.
pub struct IngestQueue {
    jobs: JobMap,
    sender: mpsc::Sender<Uuid>,
}

impl IngestQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(pipeline: Arc<IngestPipeline>, settings: IngestSettings) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let jobs: JobMap = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(run_worker(
            pipeline,
            jobs.clone(),
            receiver,
            settings.retained_jobs.max(1),
        ));

        Arc::new(Self { jobs, sender })
    }

    pub async fn submit(&self, workspace_id: &str, document_key: &str) -> RagResult<IngestJob> {
        let now = Utc::now();
        let job = IngestJob {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            document_key: document_key.to_string(),
            status: JobStatus::Pending,
            chunks_indexed: None,
            error: None,
            error_kind: None,
            retryable: false,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.jobs.write().await.insert(job.id, job.clone());
        self.enqueue(job.id).await?;

        tracing::info!(job = %job.id, workspace = %workspace_id, key = %document_key, "ingest job queued");
        Ok(job)
    }

    pub async fn status(&self, id: Uuid) -> RagResult<IngestJob> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("job {}", id)))
    }

    /// Re-queue a failed job whose failure is transient. Jobs in any other
    /// state, or that failed permanently, are left alone.
    pub async fn retry(&self, id: Uuid) -> RagResult<IngestJob> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| RagError::NotFound(format!("job {}", id)))?;
            if job.status != JobStatus::Failed {
                return Err(RagError::InvalidInput(format!(
                    "job {} is {:?}, only failed jobs can be retried",
                    id, job.status
                )));
            }
            if !job.retryable {
                return Err(RagError::InvalidInput(format!(
                    "job {} failed permanently ({}), retrying would not help",
                    id,
                    job.error_kind.as_deref().unwrap_or("unknown")
                )));
            }
            job.status = JobStatus::Pending;
            job.error = None;
            job.error_kind = None;
            job.retryable = false;
            job.updated_at = Utc::now();
            job.clone()
        };
        self.enqueue(id).await?;

        tracing::info!(job = %id, attempts = job.attempts, "ingest job re-queued");
        Ok(job)
    }

    async fn enqueue(&self, id: Uuid) -> RagResult<()> {
        self.sender
            .send(id)
            .await
            .map_err(|_| RagError::Storage("ingest worker is not running".to_string()))
    }
}

struct Failure {
    message: String,
    kind: &'static str,
    retryable: bool,
}

async fn run_worker(
    pipeline: Arc<IngestPipeline>,
    jobs: JobMap,
    mut receiver: mpsc::Receiver<Uuid>,
    retained_jobs: usize,
) {
    while let Some(id) = receiver.recv().await {
        let target = {
            let mut jobs = jobs.write().await;
            match jobs.get_mut(&id) {
                Some(job) => {
                    job.status = JobStatus::Running;
                    job.attempts += 1;
                    job.updated_at = Utc::now();
                    Some((job.workspace_id.clone(), job.document_key.clone()))
                }
                None => None,
            }
        };
        let Some((workspace_id, key)) = target else {
            continue;
        };

        // panics inside the pipeline must not take the worker down
        let result = std::panic::AssertUnwindSafe(pipeline.ingest(&workspace_id, &key))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(Failure {
                message: e.to_string(),
                kind: e.kind(),
                retryable: e.is_retryable(),
            }),
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    format!("ingestion panicked: {}", s)
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    format!("ingestion panicked: {}", s)
                } else {
                    "ingestion panicked with unknown error".to_string()
                };
                tracing::error!(job = %id, "{}", panic_msg);
                Err(Failure {
                    message: panic_msg,
                    kind: "panic",
                    retryable: false,
                })
            }
        };

        let mut jobs = jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.updated_at = Utc::now();
            match outcome {
                Ok(count) => {
                    job.status = JobStatus::Done;
                    job.chunks_indexed = Some(count);
                    job.error = None;
                }
                Err(failure) => {
                    tracing::warn!(
                        job = %id,
                        workspace = %workspace_id,
                        key = %key,
                        kind = failure.kind,
                        retryable = failure.retryable,
                        "ingest job failed: {}",
                        failure.message
                    );
                    job.status = JobStatus::Failed;
                    job.error = Some(failure.message);
                    job.error_kind = Some(failure.kind.to_string());
                    job.retryable = failure.retryable;
                }
            }
        }
        prune_finished(&mut jobs, retained_jobs);
    }
    tracing::debug!("ingest worker stopped");
}

/// Drop the oldest finished jobs until at most `retained` remain. Pending and
/// running jobs are never dropped.
fn prune_finished(jobs: &mut HashMap<Uuid, IngestJob>, retained: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|job| matches!(job.status, JobStatus::Done | JobStatus::Failed))
        .map(|job| (job.updated_at, job.id))
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort();
    let excess = finished.len() - retained;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    tracing::debug!(dropped = excess, "pruned finished ingest jobs");
}
