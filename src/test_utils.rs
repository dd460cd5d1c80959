//! Shared hand-written fakes for component tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};

use crate::api::{ApiRequest, ApiResponse, ApiTransport};
use crate::auth::{AuthBridge, TokenProbe};
use crate::downloader::{
    DownloadRequest, DownloadShelf, JobStage, JobStatusUpdate, ObjectUrlStore, StatusSink,
};
use crate::errors::{AppError, Result};

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub(crate) fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scripted transport: responses are served in order; running out of
/// script surfaces as a network error so tests fail loudly.
pub(crate) struct FakeTransport {
    responses: StdMutex<VecDeque<ApiResponse>>,
    calls: StdMutex<Vec<ApiRequest>>,
    fetched: StdMutex<Vec<String>>,
    audio: StdMutex<Vec<u8>>,
    fail_bytes: StdMutex<bool>,
}

impl FakeTransport {
    pub fn new(responses: Vec<ApiResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            calls: StdMutex::new(Vec::new()),
            fetched: StdMutex::new(Vec::new()),
            audio: StdMutex::new(Vec::new()),
            fail_bytes: StdMutex::new(false),
        })
    }

    pub fn json(status: u16, payload: Value) -> ApiResponse {
        ApiResponse {
            status,
            body: payload.to_string(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.url.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn set_audio(&self, bytes: Vec<u8>) {
        *self.audio.lock().unwrap() = bytes;
    }

    pub fn fail_audio_fetches(&self) {
        *self.fail_bytes.lock().unwrap() = true;
    }
}

#[async_trait::async_trait]
impl ApiTransport for FakeTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AppError::Network("No scripted response left.".to_string()))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(url.to_string());
        if *self.fail_bytes.lock().unwrap() {
            return Err(AppError::Network("Audio fetch failed (503).".to_string()));
        }
        Ok(self.audio.lock().unwrap().clone())
    }
}

/// Probe fake that, once bound to a bridge, answers every injection by
/// delivering its configured token on a separate task.
#[derive(Default)]
pub(crate) struct FakeProbe {
    bridge: StdMutex<Option<Arc<AuthBridge>>>,
    token: Option<String>,
    injections: AtomicUsize,
    fail: bool,
}

impl FakeProbe {
    pub fn with_token(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Some(token.to_string()),
            ..Self::default()
        })
    }

    /// Never answers; requests run into the probe timeout.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn bind(self: &Arc<Self>, bridge: &Arc<AuthBridge>) {
        *self.bridge.lock().unwrap() = Some(Arc::clone(bridge));
    }

    pub fn injections(&self) -> usize {
        self.injections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProbe for FakeProbe {
    async fn inject(&self) -> Result<()> {
        self.injections.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::Auth("probe failed".to_string()));
        }

        if let Some(token) = self.token.clone() {
            if let Some(bridge) = self.bridge.lock().unwrap().clone() {
                tokio::spawn(async move {
                    bridge.deliver_token(Some(token)).await;
                });
            }
        }
        Ok(())
    }
}

/// Download-manager fake. An optional gate semaphore lets a test hold the
/// job mid-item while it issues a stop request.
pub(crate) struct FakeShelf {
    enqueued: StdMutex<Vec<DownloadRequest>>,
    cancelled: StdMutex<Vec<i64>>,
    next_id: AtomicI64,
    gate: Option<Arc<Semaphore>>,
    fail: StdMutex<bool>,
}

impl FakeShelf {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enqueued: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            gate: None,
            fail: StdMutex::new(false),
        })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            enqueued: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            gate: Some(gate),
            fail: StdMutex::new(false),
        })
    }

    pub fn set_failing(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn enqueued(&self) -> Vec<DownloadRequest> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<i64> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DownloadShelf for FakeShelf {
    async fn enqueue(&self, request: &DownloadRequest) -> Result<i64> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if *self.fail.lock().unwrap() {
            return Err(AppError::Download(
                "Download manager refused the request.".to_string(),
            ));
        }
        self.enqueued.lock().unwrap().push(request.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn cancel(&self, download_id: i64) -> Result<()> {
        self.cancelled.lock().unwrap().push(download_id);
        Ok(())
    }
}

/// Status sink that records every update and wakes waiting tests.
pub(crate) struct RecordingSink {
    updates: StdMutex<Vec<JobStatusUpdate>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: StdMutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn updates(&self) -> Vec<JobStatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<JobStage> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|update| update.stage)
            .collect()
    }

    pub async fn wait_for_stage(&self, stage: JobStage) {
        loop {
            let notified = self.notify.notified();
            if self.stages().contains(&stage) {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_terminal(&self) {
        loop {
            let notified = self.notify.notified();
            let terminal = self.stages().iter().any(|stage| {
                matches!(stage, JobStage::Done | JobStage::Error | JobStage::Cancelled)
            });
            if terminal {
                return;
            }
            notified.await;
        }
    }
}

impl StatusSink for RecordingSink {
    fn job_status(&self, update: &JobStatusUpdate) {
        self.updates.lock().unwrap().push(update.clone());
        self.notify.notify_waiters();
    }
}

/// Object-URL fake that records creations and revocations.
#[derive(Default)]
pub(crate) struct FakeObjectUrls {
    created: StdMutex<Vec<(String, Vec<u8>)>>,
    revoked: StdMutex<Vec<String>>,
    counter: AtomicUsize,
}

impl FakeObjectUrls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<(String, Vec<u8>)> {
        self.created.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

impl ObjectUrlStore for FakeObjectUrls {
    fn create(&self, bytes: Vec<u8>, _mime: &str) -> String {
        let url = format!(
            "blob:test/{}",
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        self.created.lock().unwrap().push((url.clone(), bytes));
        url
    }

    fn revoke(&self, url: &str) {
        self.revoked.lock().unwrap().push(url.to_string());
    }
}
