use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{JobSettings, PostDownloadAction};
use crate::downloader::controller::{DirectDownloadItem, DownloadJobController};
use crate::downloader::JobStatusUpdate;
use crate::errors::{AppError, Result};
use crate::scanner::{ListScanner, RecordingDescriptor};

/// Message-type tags shared with the popup and background contexts.
pub mod message_types {
    pub const REQUEST_AUDIO_SCAN: &str = "plaud-recording-downloader.audio.scan";
    pub const RESOLVE_AUDIO_URL: &str = "plaud-recording-downloader.audio.resolve-url";
    pub const DOWNLOAD_AUDIO_BATCH: &str = "plaud-recording-downloader.audio.download-batch";
    pub const DOWNLOAD_SINGLE: &str = "plaud-recording-downloader.audio.download-single";
    pub const POST_DOWNLOAD_ACTION: &str = "plaud-recording-downloader.audio.post-download-action";
    pub const START_DOWNLOAD_JOB: &str = "plaud-recording-downloader.audio.start-background-job";
    pub const STOP_DOWNLOAD_JOB: &str = "plaud-recording-downloader.audio.stop-background-job";
    pub const CANCEL_DOWNLOADS: &str = "plaud-recording-downloader.audio.cancel-downloads";
    pub const JOB_STATUS_UPDATE: &str = "plaud-recording-downloader.audio.job-status-update";
    pub const HEARTBEAT: &str = "plaud-recording-downloader.extension.heartbeat";
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub exhaustive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub items: Vec<RecordingDescriptor>,
    #[serde(default)]
    pub settings: JobSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveUrlRequest {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostActionRequest {
    pub file_id: String,
    pub action: String,
    #[serde(default)]
    pub move_target_tag: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelDownloadsRequest {
    #[serde(default)]
    pub download_ids: Vec<i64>,
}

/// Typed request union for the `{type, payload}` message envelope.
#[derive(Debug)]
pub enum Request {
    RequestAudioScan(ScanRequest),
    ResolveAudioUrl(ResolveUrlRequest),
    StartDownloadJob(StartJobRequest),
    StopDownloadJob,
    PostDownloadAction(PostActionRequest),
    DownloadAudioBatch(Vec<DirectDownloadItem>),
    DownloadSingle(Option<DirectDownloadItem>),
    CancelDownloads(CancelDownloadsRequest),
    Heartbeat,
}

impl Request {
    pub fn parse(message: &Value) -> Result<Self> {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::InvalidInput("Unsupported message.".to_string()))?;
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);

        match kind {
            message_types::REQUEST_AUDIO_SCAN => {
                Ok(Self::RequestAudioScan(optional_payload(payload)?))
            }
            message_types::RESOLVE_AUDIO_URL => {
                Ok(Self::ResolveAudioUrl(required_payload(payload)?))
            }
            message_types::START_DOWNLOAD_JOB => {
                Ok(Self::StartDownloadJob(required_payload(payload)?))
            }
            message_types::STOP_DOWNLOAD_JOB => Ok(Self::StopDownloadJob),
            message_types::POST_DOWNLOAD_ACTION => {
                Ok(Self::PostDownloadAction(required_payload(payload)?))
            }
            message_types::DOWNLOAD_AUDIO_BATCH => {
                Ok(Self::DownloadAudioBatch(optional_payload(payload)?))
            }
            message_types::DOWNLOAD_SINGLE => {
                Ok(Self::DownloadSingle(optional_payload(payload)?))
            }
            message_types::CANCEL_DOWNLOADS => {
                Ok(Self::CancelDownloads(optional_payload(payload)?))
            }
            message_types::HEARTBEAT => Ok(Self::Heartbeat),
            other => Err(AppError::InvalidInput(format!(
                "Unsupported message type: {}",
                other
            ))),
        }
    }
}

fn required_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|err| AppError::InvalidInput(format!("Malformed message payload: {}", err)))
}

fn optional_payload<T: DeserializeOwned + Default>(payload: Value) -> Result<T> {
    if payload.is_null() {
        return Ok(T::default());
    }
    required_payload(payload)
}

/// Dispatches parsed requests into the scanner and job controller and
/// shapes every reply as `{ok: true, ...}` or `{ok: false, message}`.
pub struct MessageRouter {
    scanner: Arc<ListScanner>,
    controller: Arc<DownloadJobController>,
}

impl MessageRouter {
    pub fn new(scanner: Arc<ListScanner>, controller: Arc<DownloadJobController>) -> Self {
        Self {
            scanner,
            controller,
        }
    }

    pub async fn handle(&self, message: &Value) -> Value {
        let request = match Request::parse(message) {
            Ok(request) => request,
            Err(err) => return error_envelope(&err),
        };

        match self.dispatch(request).await {
            Ok(body) => body,
            Err(err) => error_envelope(&err),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request {
            Request::RequestAudioScan(request) => {
                let outcome = self.scanner.scan(request.exhaustive).await;
                Ok(json!({
                    "ok": true,
                    "items": outcome.items,
                    "lastScanAt": outcome.last_scan_at,
                }))
            }
            Request::ResolveAudioUrl(request) => {
                let url = self.controller.resolve_temp_url(&request.file_id).await?;
                self.scanner
                    .note_resolved_url(&request.file_id, &url)
                    .await;
                Ok(json!({ "ok": true, "url": url }))
            }
            Request::StartDownloadJob(request) => {
                self.controller
                    .start_job(request.items, request.settings, self.scanner.page_params())
                    .await?;
                Ok(json!({ "ok": true }))
            }
            Request::StopDownloadJob => {
                self.controller.stop_job().await?;
                Ok(json!({ "ok": true }))
            }
            Request::PostDownloadAction(request) => {
                let action = PostDownloadAction::parse(&request.action)?;
                self.controller
                    .perform_post_download_action(
                        &request.file_id,
                        action,
                        &request.move_target_tag,
                    )
                    .await?;
                Ok(json!({ "ok": true }))
            }
            Request::DownloadAudioBatch(items) => {
                let ids = self.controller.queue_downloads(&items).await?;
                Ok(json!({ "ok": true, "downloadIds": ids }))
            }
            Request::DownloadSingle(item) => {
                let items: Vec<DirectDownloadItem> = item.into_iter().collect();
                let ids = self.controller.queue_downloads(&items).await?;
                Ok(json!({ "ok": true, "downloadIds": ids }))
            }
            Request::CancelDownloads(request) => {
                self.controller
                    .cancel_downloads(&request.download_ids)
                    .await?;
                Ok(json!({ "ok": true }))
            }
            Request::Heartbeat => Ok(json!({ "ok": true })),
        }
    }
}

fn error_envelope(err: &AppError) -> Value {
    json!({ "ok": false, "message": err.to_string() })
}

/// Builds the outbound runtime message carrying a job status update.
pub fn job_status_message(update: &JobStatusUpdate) -> Value {
    json!({
        "type": message_types::JOB_STATUS_UPDATE,
        "payload": update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PlaudApiClient, DEFAULT_API_BASE};
    use crate::auth::AuthBridge;
    use crate::downloader::JobStage;
    use crate::metadata::MetadataAttacher;
    use crate::scanner::{DashboardPage, RecordingRow, ScrollRegion};
    use crate::test_utils::{FakeObjectUrls, FakeProbe, FakeShelf, FakeTransport, RecordingSink};

    struct EmptyPage;

    impl DashboardPage for EmptyPage {
        fn rows(&self) -> Vec<Box<dyn RecordingRow>> {
            Vec::new()
        }

        fn list_component(&self) -> Option<Value> {
            None
        }

        fn scroller(&self) -> Option<Arc<dyn ScrollRegion>> {
            None
        }

        fn query_params(&self) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    fn router_with(transport: Arc<FakeTransport>, shelf: Arc<FakeShelf>) -> MessageRouter {
        let api = Arc::new(PlaudApiClient::new(transport, DEFAULT_API_BASE));
        let probe = FakeProbe::with_token("token");
        let auth = AuthBridge::new(probe.clone());
        probe.bind(&auth);
        let attacher = Arc::new(MetadataAttacher::new(api.clone(), auth.clone()));
        let controller = DownloadJobController::new(
            api,
            auth,
            attacher,
            shelf,
            FakeObjectUrls::new(),
            RecordingSink::new(),
        );
        MessageRouter::new(Arc::new(ListScanner::new(Arc::new(EmptyPage))), controller)
    }

    #[tokio::test]
    async fn scan_replies_with_items_and_timestamp() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());

        let reply = router
            .handle(&json!({ "type": message_types::REQUEST_AUDIO_SCAN }))
            .await;

        assert_eq!(reply["ok"], true);
        assert!(reply["items"].as_array().unwrap().is_empty());
        assert!(reply["lastScanAt"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn unknown_message_types_produce_error_envelopes() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());

        let reply = router.handle(&json!({ "type": "mystery" })).await;

        assert_eq!(reply["ok"], false);
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .contains("Unsupported message type"));
    }

    #[tokio::test]
    async fn heartbeat_acknowledges() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());
        let reply = router
            .handle(&json!({ "type": message_types::HEARTBEAT }))
            .await;
        assert_eq!(reply, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn resolve_url_replies_with_the_temp_url() {
        let transport = FakeTransport::new(vec![FakeTransport::json(
            200,
            json!({ "temp_url": "https://cdn.example/a.mp3" }),
        )]);
        let router = router_with(transport, FakeShelf::new());

        let reply = router
            .handle(&json!({
                "type": message_types::RESOLVE_AUDIO_URL,
                "payload": { "fileId": "rec-1" },
            }))
            .await;

        assert_eq!(reply["ok"], true);
        assert_eq!(reply["url"], "https://cdn.example/a.mp3");
    }

    #[tokio::test]
    async fn direct_batch_download_returns_ids() {
        let shelf = FakeShelf::new();
        let router = router_with(FakeTransport::new(Vec::new()), shelf.clone());

        let reply = router
            .handle(&json!({
                "type": message_types::DOWNLOAD_AUDIO_BATCH,
                "payload": [
                    { "url": "https://cdn.example/one.mp3", "filename": "One" },
                    { "url": "https://cdn.example/two.wav", "filename": "Two" },
                ],
            }))
            .await;

        assert_eq!(reply["ok"], true);
        assert_eq!(reply["downloadIds"].as_array().unwrap().len(), 2);
        let enqueued = shelf.enqueued();
        assert_eq!(enqueued[0].filename, "One.mp3");
        assert_eq!(enqueued[1].filename, "Two.wav");
    }

    #[tokio::test]
    async fn single_download_without_payload_is_rejected() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());

        let reply = router
            .handle(&json!({ "type": message_types::DOWNLOAD_SINGLE }))
            .await;

        assert_eq!(reply["ok"], false);
        assert_eq!(reply["message"], "Invalid input: Nothing to download.");
    }

    #[tokio::test]
    async fn unsupported_post_action_is_rejected() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());

        let reply = router
            .handle(&json!({
                "type": message_types::POST_DOWNLOAD_ACTION,
                "payload": { "fileId": "rec-1", "action": "archive" },
            }))
            .await;

        assert_eq!(reply["ok"], false);
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .contains("Unsupported post-download action"));
    }

    #[tokio::test]
    async fn stop_without_a_job_reports_the_reason() {
        let router = router_with(FakeTransport::new(Vec::new()), FakeShelf::new());

        let reply = router
            .handle(&json!({ "type": message_types::STOP_DOWNLOAD_JOB }))
            .await;

        assert_eq!(reply["ok"], false);
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .contains("No download job is running"));
    }

    #[test]
    fn job_status_messages_carry_the_update_payload() {
        let message = job_status_message(&JobStatusUpdate {
            stage: JobStage::Progress,
            total: 4,
            completed: 1,
            message: "Downloaded 1/4 recording(s)…".to_string(),
        });

        assert_eq!(message["type"], message_types::JOB_STATUS_UPDATE);
        assert_eq!(message["payload"]["stage"], "progress");
        assert_eq!(message["payload"]["total"], 4);
    }
}
