//! Object storage for export artifacts
//!
//! Exports go up as multipart uploads: parts are numbered from 1 and are
//! committed in part-number order when the upload completes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use bytes::{Bytes, BytesMut};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::PutPayload;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Receipt for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ExportStore: Send + Sync {
    /// Start a multipart upload to `key`, returning its upload id
    async fn create_multipart(&self, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    async fn complete(&self, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()>;

    async fn abort(&self, key: &str, upload_id: &str) -> Result<()>;

    /// A time-limited GET URL for `key`
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// [`ExportStore`] over an `object_store` backend such as S3
pub struct ObjectStoreExport<S> {
    store: Arc<S>,
}

impl<S> ObjectStoreExport<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn part_index(part_number: u32) -> Result<usize> {
    part_number
        .checked_sub(1)
        .map(|i| i as usize)
        .ok_or_else(|| Error::WorkerFailure("part numbers start at 1".into()))
}

#[async_trait]
impl<S> ExportStore for ObjectStoreExport<S>
where
    S: MultipartStore + Signer + Send + Sync + 'static,
{
    async fn create_multipart(&self, key: &str) -> Result<String> {
        let upload_id = self.store.create_multipart(&Path::from(key)).await?;
        debug!(key, upload_id = %upload_id, "multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let upload_id = upload_id.to_string();
        let part = self
            .store
            .put_part(
                &Path::from(key),
                &upload_id,
                part_index(part_number)?,
                PutPayload::from(data),
            )
            .await?;
        Ok(CompletedPart {
            part_number,
            etag: part.content_id,
        })
    }

    async fn complete(&self, key: &str, upload_id: &str, mut parts: Vec<CompletedPart>) -> Result<()> {
        parts.sort_by_key(|p| p.part_number);
        let parts = parts
            .into_iter()
            .map(|p| PartId { content_id: p.etag })
            .collect();
        self.store
            .complete_multipart(&Path::from(key), &upload_id.to_string(), parts)
            .await?;
        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<()> {
        self.store
            .abort_multipart(&Path::from(key), &upload_id.to_string())
            .await?;
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        let url = self
            .store
            .signed_url(Method::GET, &Path::from(key), ttl)
            .await?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct MemoryState {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, Bytes>,
    aborted: Vec<String>,
}

/// In-memory store for local runs and tests
///
/// Can be told to fail a given part number to exercise the failure path.
#[derive(Debug, Default, Clone)]
pub struct MemoryExportStore {
    state: Arc<Mutex<MemoryState>>,
    next_upload: Arc<AtomicU32>,
    parts_uploaded: Arc<AtomicU32>,
    fail_on_part: Option<u32>,
}

impl MemoryExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on_part(part_number: u32) -> Self {
        Self {
            fail_on_part: Some(part_number),
            ..Self::default()
        }
    }

    /// A completed object, if any
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub fn parts_uploaded(&self) -> u32 {
        self.parts_uploaded.load(Ordering::SeqCst)
    }

    /// Upload ids that were aborted
    pub async fn aborted(&self) -> Vec<String> {
        self.state.lock().await.aborted.clone()
    }
}

#[async_trait]
impl ExportStore for MemoryExportStore {
    async fn create_multipart(&self, key: &str) -> Result<String> {
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.state.lock().await.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                ..Default::default()
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        part_index(part_number)?;
        if self.fail_on_part == Some(part_number) {
            return Err(Error::Storage(object_store::Error::Generic {
                store: "memory",
                source: format!("injected failure on part {part_number}").into(),
            }));
        }
        let mut state = self.state.lock().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::WorkerFailure(format!("unknown upload {upload_id}")))?;
        upload.parts.insert(part_number, data);
        self.parts_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(CompletedPart {
            part_number,
            etag: format!("{upload_id}-{part_number}"),
        })
    }

    async fn complete(&self, _key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()> {
        let mut state = self.state.lock().await;
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::WorkerFailure(format!("unknown upload {upload_id}")))?;

        let mut numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        numbers.sort_unstable();
        let mut body = BytesMut::new();
        for number in numbers {
            let part = upload
                .parts
                .get(&number)
                .ok_or_else(|| Error::WorkerFailure(format!("part {number} was never uploaded")))?;
            body.extend_from_slice(part);
        }
        state.objects.insert(upload.key, body.freeze());
        Ok(())
    }

    async fn abort(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{key}?expires_in={}", ttl.as_secs()))
    }
}
