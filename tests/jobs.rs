mod common;

use std::sync::Arc;

use tokio_test::assert_err;
use uuid::Uuid;

use common::{harness, harness_with, ingest_settings, long_text, wait_for_job, HashEmbedder, DIMS};
use workspace_rag::error::RagError;
use workspace_rag::rag::jobs::{IngestQueue, JobStatus};

#[tokio::test]
async fn submitted_job_runs_to_completion() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));
    let key = h.put("ws1", "guide.txt", &long_text(40)).await;

    let job = queue.submit("ws1", &key).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    let job = wait_for_job(&queue, job.id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 1);
    assert!(job.chunks_indexed.unwrap_or(0) >= 1);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn transient_failure_can_be_retried() {
    let h = harness_with(Arc::new(HashEmbedder::failing(DIMS, 1)), DIMS, 1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));
    let key = h.put("ws1", "late.txt", "embedded on the second try").await;

    let job = queue.submit("ws1", &key).await.unwrap();
    let job = wait_for_job(&queue, job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind.as_deref(), Some("provider"));
    assert!(job.retryable);
    assert!(job.error.is_some());

    let retried = queue.retry(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert!(retried.error_kind.is_none());

    let job = wait_for_job(&queue, job.id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.chunks_indexed, Some(1));
    assert!(job.error.is_none());
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));

    let key = h.put_bytes("ws1", "binary.txt", vec![0xff, 0xfe, 0x00, 0x80]).await;
    let bad_text = queue.submit("ws1", &key).await.unwrap();
    let missing = queue.submit("ws1", "ws1/never-uploaded.txt").await.unwrap();

    let job = wait_for_job(&queue, bad_text.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind.as_deref(), Some("invalid_input"));
    assert!(!job.retryable);
    let err = assert_err!(queue.retry(job.id).await);
    assert!(matches!(err, RagError::InvalidInput(_)));

    let job = wait_for_job(&queue, missing.id).await;
    assert_eq!(job.error_kind.as_deref(), Some("not_found"));
    assert!(!job.retryable);
    let err = assert_err!(queue.retry(job.id).await);
    assert!(matches!(err, RagError::InvalidInput(_)));

    // a rejected retry leaves the job untouched
    let job = queue.status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn only_failed_jobs_are_retried() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));
    let key = h.put("ws1", "fine.txt", "nothing wrong here").await;

    let job = queue.submit("ws1", &key).await.unwrap();
    let job = wait_for_job(&queue, job.id).await;
    assert_eq!(job.status, JobStatus::Done);

    let err = assert_err!(queue.retry(job.id).await);
    assert!(matches!(err, RagError::InvalidInput(_)));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));

    let err = assert_err!(queue.status(Uuid::new_v4()).await);
    assert!(matches!(err, RagError::NotFound(_)));
    let err = assert_err!(queue.retry(Uuid::new_v4()).await);
    assert!(matches!(err, RagError::NotFound(_)));
}

#[tokio::test]
async fn jobs_run_in_submission_order() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(100));

    let mut ids = Vec::new();
    for i in 0..3 {
        let key = h.put("ws1", &format!("doc{}.txt", i), &format!("document {}", i)).await;
        ids.push(queue.submit("ws1", &key).await.unwrap().id);
    }

    let mut finished = Vec::new();
    for id in &ids {
        finished.push(wait_for_job(&queue, *id).await);
    }
    assert!(finished.iter().all(|job| job.status == JobStatus::Done));
    assert!(finished.windows(2).all(|w| w[0].updated_at <= w[1].updated_at));
}

#[tokio::test]
async fn oldest_finished_jobs_are_evicted() {
    let h = harness(1000, 200);
    let queue = IngestQueue::start(h.pipeline.clone(), ingest_settings(2));

    let mut ids = Vec::new();
    for i in 0..3 {
        let key = h.put("ws1", &format!("doc{}.txt", i), &format!("document {}", i)).await;
        let id = queue.submit("ws1", &key).await.unwrap().id;
        wait_for_job(&queue, id).await;
        ids.push(id);
    }

    let err = assert_err!(queue.status(ids[0]).await);
    assert!(matches!(err, RagError::NotFound(_)));
    for id in &ids[1..] {
        assert_eq!(queue.status(*id).await.unwrap().status, JobStatus::Done);
    }
}
