pub mod controller;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};

use crate::config::ConflictAction;
use crate::errors::Result;

/// Lifecycle stage carried by every job status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Start,
    Progress,
    Cancelling,
    Done,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub stage: JobStage,
    pub total: usize,
    pub completed: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Cancelling,
    Cancelled,
}

/// One request handed to the browser download manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub filename: String,
    pub conflict_action: ConflictAction,
}

/// Terminal-state report from the download manager's change stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChange {
    pub id: i64,
    pub state: DownloadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Complete,
    Interrupted,
    #[serde(other)]
    Other,
}

/// Browser download manager collaborator.
#[async_trait::async_trait]
pub trait DownloadShelf: Send + Sync {
    async fn enqueue(&self, request: &DownloadRequest) -> Result<i64>;
    async fn cancel(&self, download_id: i64) -> Result<()>;
}

/// Object-URL collaborator wrapping tagged audio buffers for the download
/// manager.
pub trait ObjectUrlStore: Send + Sync {
    fn create(&self, bytes: Vec<u8>, mime: &str) -> String;
    fn revoke(&self, url: &str);
}

/// Fan-out for job status events (popup, badge).
pub trait StatusSink: Send + Sync {
    fn job_status(&self, update: &JobStatusUpdate);
}

/// Object-URL store backed by process memory, for hosts that marshal the
/// tagged bytes themselves.
#[derive(Default)]
pub struct InMemoryObjectUrls {
    entries: StdMutex<HashMap<String, Vec<u8>>>,
    counter: AtomicU64,
}

impl InMemoryObjectUrls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_for(&self, url: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(url).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl ObjectUrlStore for InMemoryObjectUrls {
    fn create(&self, bytes: Vec<u8>, mime: &str) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let url = format!("blob:plaud-recording-downloader/{}?type={}", id, mime);
        self.entries.lock().unwrap().insert(url.clone(), bytes);
        url
    }

    fn revoke(&self, url: &str) {
        self.entries.lock().unwrap().remove(url);
    }
}
