//! Export worker
//!
//! Each queued message runs to a terminal state on its own:
//!
//! ```text
//! received -> connected -> streaming -> uploading(part N) -> finalizing -> complete
//!                                                                       \-> failed
//! ```
//!
//! Rows are pulled in bounded batches, each batch becomes one CSV part of a
//! multipart upload, and `rows_processed` is raised after every part. A
//! fault at any stage aborts the upload and marks the job failed; the next
//! message is unaffected.
//!
//! A message is acknowledged once it reaches a terminal state. One that keeps
//! coming back (its worker died before acknowledging) is marked failed after
//! `max_attempts` deliveries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::format::CsvChunkEncoder;
use crate::jobs::JobStatusStore;
use crate::query::AssembledQuery;
use crate::queue::{Delivery, JobConsumer, JobMessage};
use crate::reader::RowSource;
use crate::storage::{CompletedPart, ExportStore};

#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Objects are written to `<key_prefix>/<job_id>.csv`
    pub key_prefix: String,
    pub chunk_rows: usize,
    pub url_ttl: Duration,
    /// How long terminal records are kept
    pub record_ttl: Duration,
    /// Deliveries of one message before it is given up on
    pub max_attempts: u32,
}

/// Pause after the queue itself fails before asking again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            key_prefix: "exports".to_string(),
            chunk_rows: 30_000,
            url_ttl: Duration::from_secs(6 * 60 * 60),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            max_attempts: 3,
        }
    }
}

impl ExportSettings {
    /// Deterministic per job, so a redelivered job overwrites its own artifact
    pub fn object_key(&self, job_id: &str) -> String {
        let prefix = self.key_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{job_id}.csv")
        } else {
            format!("{prefix}/{job_id}.csv")
        }
    }

    fn expire_at(&self) -> i64 {
        let ttl = i64::try_from(self.record_ttl.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_add(ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Received,
    Connected,
    Streaming,
    Uploading(u32),
    Finalizing,
    Complete,
    Failed,
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportState::Received => write!(f, "received"),
            ExportState::Connected => write!(f, "connected"),
            ExportState::Streaming => write!(f, "streaming"),
            ExportState::Uploading(part) => write!(f, "uploading(part {part})"),
            ExportState::Finalizing => write!(f, "finalizing"),
            ExportState::Complete => write!(f, "complete"),
            ExportState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one successful export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub job_id: String,
    pub rows: u64,
    pub parts: u32,
    pub presigned_url: String,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<ExportSummary>,
    pub failed: usize,
}

/// Tracks one job through its states
struct Progress<'a> {
    job_id: &'a str,
    state: ExportState,
    trail: Vec<ExportState>,
}

impl<'a> Progress<'a> {
    fn new(job_id: &'a str) -> Self {
        Self {
            job_id,
            state: ExportState::Received,
            trail: vec![ExportState::Received],
        }
    }

    fn advance(&mut self, next: ExportState) {
        debug!(job_id = self.job_id, from = %self.state, to = %next, "export state");
        self.state = next;
        self.trail.push(next);
    }
}

fn job_id_of(raw: &Value) -> Option<String> {
    raw.get("job_id").and_then(Value::as_str).map(str::to_string)
}

pub struct ExportWorker {
    source: Arc<dyn RowSource>,
    store: Arc<dyn ExportStore>,
    jobs: Arc<dyn JobStatusStore>,
    settings: ExportSettings,
}

impl ExportWorker {
    pub fn new(
        source: Arc<dyn RowSource>,
        store: Arc<dyn ExportStore>,
        jobs: Arc<dyn JobStatusStore>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            source,
            store,
            jobs,
            settings,
        }
    }

    /// Run one raw queue message to a terminal state
    pub async fn process_message(&self, body: &str) -> Result<ExportSummary> {
        self.run_message(body).await.0
    }

    /// Like `process_message`, also returning every state the job passed through
    ///
    /// The trail is empty when the payload carries no job id.
    pub(crate) async fn run_message(&self, body: &str) -> (Result<ExportSummary>, Vec<ExportState>) {
        let raw: Value = match serde_json::from_str(body) {
            Ok(raw) => raw,
            Err(e) => {
                let err = Error::WorkerFailure(format!("malformed payload: {e}"));
                error!(error = %err, "dropping message");
                return (Err(err), Vec::new());
            }
        };
        let Some(job_id) = job_id_of(&raw) else {
            let err = Error::WorkerFailure("payload has no job_id".into());
            error!(error = %err, "dropping message");
            return (Err(err), Vec::new());
        };

        let mut progress = Progress::new(&job_id);
        let result = match serde_json::from_value::<JobMessage>(raw) {
            Ok(message) => self.export(&message, &mut progress).await,
            Err(e) => Err(Error::WorkerFailure(format!("malformed payload: {e}"))),
        };
        if let Err(err) = &result {
            progress.advance(ExportState::Failed);
            self.record_failure(&job_id, err).await;
        }
        (result, progress.trail)
    }

    /// Process one delivery, giving up on messages redelivered too often
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<ExportSummary> {
        if delivery.attempts <= self.settings.max_attempts {
            return self.process_message(&delivery.body).await;
        }
        let err = Error::WorkerFailure(format!(
            "gave up after {} deliveries",
            delivery.attempts.saturating_sub(1)
        ));
        let job_id = serde_json::from_str::<Value>(&delivery.body)
            .ok()
            .and_then(|raw| job_id_of(&raw));
        match job_id {
            Some(job_id) => self.record_failure(&job_id, &err).await,
            None => error!(receipt = %delivery.receipt, error = %err, "dropping message"),
        }
        Err(err)
    }

    async fn export(&self, message: &JobMessage, progress: &mut Progress<'_>) -> Result<ExportSummary> {
        let job_id = message.job_id.as_str();
        let key = self.settings.object_key(job_id);

        if message.debug {
            info!(job_id, sql = %message.sql, params = ?message.params, "export query");
        } else {
            debug!(job_id, sql = %message.sql, "export query");
        }

        self.jobs.mark_running(job_id).await?;
        let query = AssembledQuery {
            sql: message.sql.clone(),
            params: message.params.clone(),
        };
        progress.advance(ExportState::Connected);
        let upload_id = self.store.create_multipart(&key).await?;

        let uploaded = self.upload(&query, &key, &upload_id, progress).await;
        let (rows, parts) = match uploaded {
            Ok(done) => done,
            Err(err) => {
                if let Err(abort_err) = self.store.abort(&key, &upload_id).await {
                    warn!(job_id, error = %abort_err, "failed to abort multipart upload");
                }
                return Err(err);
            }
        };

        let presigned_url = self.store.presign(&key, self.settings.url_ttl).await?;
        self.jobs
            .mark_complete(job_id, rows, &presigned_url, self.settings.expire_at())
            .await?;
        progress.advance(ExportState::Complete);
        info!(job_id, rows, parts, key = %key, "export complete");

        Ok(ExportSummary {
            job_id: job_id.to_string(),
            rows,
            parts,
            presigned_url,
        })
    }

    /// Stream, upload and commit; returns (rows, parts)
    async fn upload(
        &self,
        query: &AssembledQuery,
        key: &str,
        upload_id: &str,
        progress: &mut Progress<'_>,
    ) -> Result<(u64, u32)> {
        let job_id = progress.job_id;
        let mut batches = self.source.stream_batches(query, self.settings.chunk_rows);
        let mut encoder = CsvChunkEncoder::new();
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut rows = 0u64;

        progress.advance(ExportState::Streaming);
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            let part_number = parts.len() as u32 + 1;
            progress.advance(ExportState::Uploading(part_number));

            let body = encoder.encode(&batch)?;
            let part = self
                .store
                .upload_part(key, upload_id, part_number, Bytes::from(body))
                .await?;
            parts.push(part);

            rows += batch.len() as u64;
            self.jobs.record_progress(job_id, rows).await?;
            debug!(job_id, part_number, rows, "part uploaded");
        }

        // an empty result still yields an (empty) artifact
        if parts.is_empty() {
            progress.advance(ExportState::Uploading(1));
            parts.push(self.store.upload_part(key, upload_id, 1, Bytes::new()).await?);
        }

        progress.advance(ExportState::Finalizing);
        let count = parts.len() as u32;
        self.store.complete(key, upload_id, parts).await?;
        Ok((rows, count))
    }

    /// Best effort: if this write fails too the job is left to redelivery
    async fn record_failure(&self, job_id: &str, err: &Error) {
        error!(job_id, error = %err, "export failed");
        if let Err(e) = self.jobs.mark_failed(job_id, self.settings.expire_at()).await {
            warn!(job_id, error = %e, "could not record job failure");
        }
    }

    /// Process messages one after another; a failed job never stops the batch
    pub async fn process_batch<I, S>(&self, bodies: I) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BatchReport::default();
        for body in bodies {
            match self.process_message(body.as_ref()).await {
                Ok(summary) => report.completed.push(summary),
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Consume the queue until it closes or `shutdown` turns true
    ///
    /// A job already in progress runs to its terminal state first.
    pub async fn run(
        self: Arc<Self>,
        consumer: Arc<dyn JobConsumer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped sender can never signal again
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = consumer.receive() => received,
            };
            match received {
                Ok(Some(delivery)) => {
                    // failures are already logged and recorded
                    let _ = self.handle_delivery(&delivery).await;
                    if let Err(e) = consumer.ack(&delivery).await {
                        warn!(receipt = %delivery.receipt, error = %e, "failed to acknowledge message");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "queue receive failed");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            }
        }
        debug!("export worker stopped");
    }
}

/// Start `workers` tasks sharing one queue consumer
pub fn spawn_pool(
    worker: Arc<ExportWorker>,
    consumer: Arc<dyn JobConsumer>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut pool = JoinSet::new();
    for _ in 0..workers.max(1) {
        pool.spawn(worker.clone().run(consumer.clone(), shutdown.clone()));
    }
    info!(workers = workers.max(1), "export workers started");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, MemoryJobStore};
    use crate::queue::{ChannelQueue, JobProducer};
    use crate::reader::JsonRow;
    use crate::storage::MemoryExportStore;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use serde_json::json;

    /// Serves a fixed row set, optionally failing after some batches
    struct FixedRows {
        rows: Vec<JsonRow>,
        fail_after: Option<usize>,
    }

    impl FixedRows {
        fn numbered(n: usize) -> Self {
            let rows = (0..n)
                .map(|i| json!({"pixel_id": i, "granule_id": "G"}).as_object().unwrap().clone())
                .collect();
            Self {
                rows,
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl RowSource for FixedRows {
        async fn fetch_all(&self, _query: &AssembledQuery) -> Result<Vec<JsonRow>> {
            Ok(self.rows.clone())
        }

        fn stream_batches(
            &self,
            _query: &AssembledQuery,
            batch_rows: usize,
        ) -> BoxStream<'static, Result<Vec<JsonRow>>> {
            let mut batches: Vec<Result<Vec<JsonRow>>> =
                self.rows.chunks(batch_rows).map(|c| Ok(c.to_vec())).collect();
            if let Some(n) = self.fail_after {
                batches.truncate(n);
                batches.push(Err(Error::WorkerFailure("connection reset".into())));
            }
            stream::iter(batches).boxed()
        }
    }

    struct Harness {
        worker: ExportWorker,
        store: MemoryExportStore,
        jobs: MemoryJobStore,
    }

    fn harness(source: FixedRows, store: MemoryExportStore) -> Harness {
        let jobs = MemoryJobStore::new();
        let worker = ExportWorker::new(
            Arc::new(source),
            Arc::new(store.clone()),
            Arc::new(jobs.clone()),
            ExportSettings::default(),
        );
        Harness { worker, store, jobs }
    }

    fn message(job_id: &str) -> String {
        json!({"job_id": job_id, "sql_query": "SELECT * FROM \"pixel_spectra_mv\"", "params": []})
            .to_string()
    }

    #[tokio::test]
    async fn test_chunked_export_completes() {
        let h = harness(FixedRows::numbered(95_000), MemoryExportStore::new());
        let summary = h.worker.process_message(&message("job-1")).await.unwrap();

        assert_eq!(summary.rows, 95_000);
        assert_eq!(summary.parts, 4);
        assert_eq!(
            h.jobs.progress_history("job-1").await,
            vec![30_000, 60_000, 90_000, 95_000]
        );
        assert_eq!(h.store.parts_uploaded(), 4);

        let record = h.jobs.get("job-1").await.unwrap();
        assert_eq!(record.status, JobStatus::Complete);
        assert_eq!(record.rows_processed, 95_000);
        assert!(!record.presigned_url.unwrap_or_default().is_empty());
        assert!(record.expire_at.is_some());

        let object = h.store.object("exports/job-1.csv").await.unwrap();
        let text = String::from_utf8(object.to_vec()).unwrap();
        assert!(text.starts_with("pixel_id,granule_id\n0,G\n"));
        assert_eq!(text.lines().count(), 95_001);
        assert_eq!(text.matches("pixel_id").count(), 1);
    }

    #[tokio::test]
    async fn test_part_failure_marks_failed() {
        let h = harness(
            FixedRows::numbered(95_000),
            MemoryExportStore::failing_on_part(3),
        );
        assert!(h.worker.process_message(&message("job-2")).await.is_err());

        let record = h.jobs.get("job-2").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.rows_processed, 60_000);
        assert!(record.presigned_url.is_none());
        assert!(record.expire_at.is_some());
        assert_eq!(h.store.aborted().await.len(), 1);
        assert!(h.store.object("exports/job-2.csv").await.is_none());
    }

    #[tokio::test]
    async fn test_states_in_order() {
        let h = harness(FixedRows::numbered(95_000), MemoryExportStore::new());
        let (result, trail) = h.worker.run_message(&message("job-s")).await;
        assert!(result.is_ok());
        assert_eq!(
            trail,
            vec![
                ExportState::Received,
                ExportState::Connected,
                ExportState::Streaming,
                ExportState::Uploading(1),
                ExportState::Uploading(2),
                ExportState::Uploading(3),
                ExportState::Uploading(4),
                ExportState::Finalizing,
                ExportState::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_ends_in_failed_state() {
        let h = harness(
            FixedRows::numbered(95_000),
            MemoryExportStore::failing_on_part(3),
        );
        let (result, trail) = h.worker.run_message(&message("job-f")).await;
        assert!(result.is_err());
        assert_eq!(
            &trail[trail.len() - 2..],
            &[ExportState::Uploading(3), ExportState::Failed]
        );
        assert!(!trail.contains(&ExportState::Complete));

        let (_, trail) = h.worker.run_message(r#"{"job_id": "job-g"}"#).await;
        assert_eq!(trail, vec![ExportState::Received, ExportState::Failed]);

        let (_, trail) = h.worker.run_message("not json").await;
        assert!(trail.is_empty());
    }

    #[tokio::test]
    async fn test_database_fault_mid_stream() {
        let mut source = FixedRows::numbered(95_000);
        source.fail_after = Some(1);
        let h = harness(source, MemoryExportStore::new());
        let err = h.worker.process_message(&message("job-3")).await.unwrap_err();
        assert!(matches!(err, Error::WorkerFailure(_)));

        let record = h.jobs.get("job-3").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.rows_processed, 30_000);
    }

    #[tokio::test]
    async fn test_malformed_payload_writes_nothing() {
        let h = harness(FixedRows::numbered(1), MemoryExportStore::new());
        assert!(h.worker.process_message("not json").await.is_err());
        assert!(h.worker.process_message(r#"{"sql_query": "SELECT 1"}"#).await.is_err());
        assert_eq!(h.jobs.len().await, 0);
        assert_eq!(h.store.parts_uploaded(), 0);
    }

    #[tokio::test]
    async fn test_missing_sql_with_job_id_is_failed() {
        let h = harness(FixedRows::numbered(1), MemoryExportStore::new());
        assert!(h.worker.process_message(r#"{"job_id": "job-4"}"#).await.is_err());
        assert_eq!(h.jobs.get("job-4").await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_result_still_completes() {
        let h = harness(FixedRows::numbered(0), MemoryExportStore::new());
        let summary = h.worker.process_message(&message("job-5")).await.unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.parts, 1);
        assert_eq!(h.jobs.get("job-5").await.unwrap().status, JobStatus::Complete);
        assert!(h.store.object("exports/job-5.csv").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let h = harness(FixedRows::numbered(10), MemoryExportStore::new());
        let report = h
            .worker
            .process_batch(vec![message("a"), "{".to_string(), message("b")])
            .await;
        assert_eq!(report.failed, 1);
        let done: Vec<_> = report.completed.iter().map(|s| s.job_id.as_str()).collect();
        assert_eq!(done, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let store = MemoryExportStore::new();
        let jobs = MemoryJobStore::new();
        let worker = Arc::new(ExportWorker::new(
            Arc::new(FixedRows::numbered(5)),
            Arc::new(store.clone()),
            Arc::new(jobs.clone()),
            ExportSettings::default(),
        ));
        let (queue, receiver) = ChannelQueue::bounded(8);
        let producer = JobProducer::new(Arc::new(queue));
        let first = producer.enqueue("SELECT 1", &[], false).await.unwrap();
        let second = producer.enqueue("SELECT 1", &[], false).await.unwrap();
        drop(producer);

        let (_stop, stop_rx) = watch::channel(false);
        let mut pool = spawn_pool(worker, Arc::new(receiver), 2, stop_rx);
        while pool.join_next().await.is_some() {}

        assert_eq!(jobs.get(&first).await.unwrap().status, JobStatus::Complete);
        assert_eq!(jobs.get(&second).await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let h = harness(FixedRows::numbered(1), MemoryExportStore::new());
        let (queue, receiver) = ChannelQueue::bounded(1);
        let (stop, stop_rx) = watch::channel(false);
        let mut pool = spawn_pool(Arc::new(h.worker), Arc::new(receiver), 2, stop_rx);

        stop.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            while pool.join_next().await.is_some() {}
        })
        .await;
        assert!(stopped.is_ok());
        // the queue is still open
        drop(queue);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_processed() {
        let h = harness(FixedRows::numbered(3), MemoryExportStore::new());
        let delivery = Delivery {
            receipt: "7".into(),
            body: message("job-r"),
            attempts: 3,
        };
        let summary = h.worker.handle_delivery(&delivery).await.unwrap();
        assert_eq!(summary.rows, 3);
    }

    #[tokio::test]
    async fn test_too_many_deliveries_marks_failed() {
        let h = harness(FixedRows::numbered(3), MemoryExportStore::new());
        let delivery = Delivery {
            receipt: "8".into(),
            body: message("job-x"),
            attempts: 4,
        };
        let err = h.worker.handle_delivery(&delivery).await.unwrap_err();
        assert!(err.to_string().contains("gave up after 3 deliveries"));
        assert_eq!(h.jobs.get("job-x").await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.store.parts_uploaded(), 0);
    }

    #[test]
    fn test_object_key() {
        let settings = ExportSettings {
            key_prefix: "exports/".into(),
            ..Default::default()
        };
        assert_eq!(settings.object_key("j"), "exports/j.csv");
        let settings = ExportSettings {
            key_prefix: String::new(),
            ..Default::default()
        };
        assert_eq!(settings.object_key("j"), "j.csv");
    }
}
