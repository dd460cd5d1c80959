use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::api::{
    build_api_headers, extract_download_url, FetchOptions, PlaudApiClient, RequestInit,
};
use crate::auth::AuthBridge;
use crate::config::{ConflictAction, JobSettings, PostDownloadAction, DEFAULT_EXTENSION};
use crate::errors::{AppError, Result};
use crate::id3::{write_id3_tag, FrameSpec};
use crate::metadata::{MetadataAttacher, RecordingMetadata};
use crate::scanner::RecordingDescriptor;
use crate::utils::{infer_extension, normalize_extension, to_safe_filename, to_safe_path};

use super::{
    DownloadChange, DownloadRequest, DownloadShelf, DownloadState, JobStage, JobStatus,
    JobStatusUpdate, ObjectUrlStore, StatusSink,
};

/// The single process-wide active-job record.
struct ActiveJob {
    status: JobStatus,
    total: usize,
    completed: usize,
    download_ids: Vec<i64>,
    cancel_requested: bool,
    cancellation_notified: bool,
}

/// A job item after validation: safe filename, resolved extension,
/// conflict policy applied.
struct PreparedItem {
    file_id: Option<String>,
    url: Option<String>,
    title: String,
    filename: String,
    extension: String,
    conflict_action: ConflictAction,
    metadata: Option<RecordingMetadata>,
}

enum JobOutcome {
    Completed,
    Cancelled,
}

/// Item for the direct (non-job) download path: the URL must already be
/// resolved.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectDownloadItem {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub conflict_action: Option<ConflictAction>,
    #[serde(default)]
    pub subdirectory: Option<String>,
}

/// Orchestrates one background download job at a time: URL resolution,
/// optional tag embedding, hand-off to the download manager, post-download
/// housekeeping, progress events and cooperative cancellation. Items run
/// strictly sequentially so every download and its post-action stay
/// attributable to one recording.
pub struct DownloadJobController {
    api: Arc<PlaudApiClient>,
    auth: Arc<AuthBridge>,
    attacher: Arc<MetadataAttacher>,
    shelf: Arc<dyn DownloadShelf>,
    object_urls: Arc<dyn ObjectUrlStore>,
    sink: Arc<dyn StatusSink>,
    active: Mutex<Option<ActiveJob>>,
    pending_object_urls: Mutex<HashMap<i64, String>>,
}

impl DownloadJobController {
    pub fn new(
        api: Arc<PlaudApiClient>,
        auth: Arc<AuthBridge>,
        attacher: Arc<MetadataAttacher>,
        shelf: Arc<dyn DownloadShelf>,
        object_urls: Arc<dyn ObjectUrlStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            auth,
            attacher,
            shelf,
            object_urls,
            sink,
            active: Mutex::new(None),
            pending_object_urls: Mutex::new(HashMap::new()),
        })
    }

    /// Validates the batch, claims the single job slot and spawns the job
    /// task. Rejected without touching the active job when one is already
    /// running or cancelling.
    pub async fn start_job(
        self: &Arc<Self>,
        items: Vec<RecordingDescriptor>,
        settings: JobSettings,
        page_params: Vec<(String, String)>,
    ) -> Result<()> {
        if items.is_empty() {
            return Err(AppError::InvalidInput("Nothing to download.".to_string()));
        }
        settings.validate()?;

        {
            let mut active = self.active.lock().await;
            if active.is_some() {
                return Err(AppError::InvalidInput(
                    "A download job is already running.".to_string(),
                ));
            }
            *active = Some(ActiveJob {
                status: JobStatus::Running,
                total: items.len(),
                completed: 0,
                download_ids: Vec::new(),
                cancel_requested: false,
                cancellation_notified: false,
            });
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = controller.run_job(items, settings, page_params).await {
                error!("Plaud download job failed: {}", err);
            }
        });

        Ok(())
    }

    /// Requests cooperative cancellation of the running job: flags it,
    /// reports `cancelling` once and asks the download manager to cancel
    /// every download recorded so far. The job task notices the flag at
    /// its next checkpoint.
    pub async fn stop_job(&self) -> Result<()> {
        let (ids, total, completed) = {
            let mut active = self.active.lock().await;
            let job = active.as_mut().ok_or_else(|| {
                AppError::InvalidInput("No download job is running.".to_string())
            })?;

            if job.status == JobStatus::Cancelling {
                return Ok(());
            }

            job.cancel_requested = true;
            job.status = JobStatus::Cancelling;
            (job.download_ids.clone(), job.total, job.completed)
        };

        self.sink.job_status(&status_update(
            JobStage::Cancelling,
            total,
            completed,
            "Stopping Plaud downloads…".to_string(),
        ));

        for id in ids {
            if let Err(err) = self.shelf.cancel(id).await {
                warn!("Failed to cancel download {}: {}", id, err);
            }
        }

        Ok(())
    }

    /// Releases the object URL belonging to a download once the manager
    /// reports it terminal.
    pub async fn note_download_change(&self, change: &DownloadChange) {
        if matches!(
            change.state,
            DownloadState::Complete | DownloadState::Interrupted
        ) {
            if let Some(url) = self.pending_object_urls.lock().await.remove(&change.id) {
                self.object_urls.revoke(&url);
            }
        }
    }

    /// Resolves a temporary download URL for one recording, retrying
    /// exactly once with a forced token refresh when the vendor answers
    /// 401.
    pub async fn resolve_temp_url(&self, file_id: &str) -> Result<String> {
        if file_id.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "Missing recording identifier on this item.".to_string(),
            ));
        }

        for attempt in 0..2 {
            let token = self.auth.request_token(attempt > 0).await.ok_or_else(|| {
                AppError::Auth(
                    "Sign in to Plaud before requesting downloads. Token not found.".to_string(),
                )
            })?;

            let path = format!("/file/temp-url/{}", urlencoding::encode(file_id));
            let exchange = self
                .api
                .fetch_api(
                    &path,
                    RequestInit::get(build_api_headers(&token)),
                    FetchOptions::default(),
                )
                .await
                .map_err(|_| {
                    AppError::Network(
                        "Network error while requesting download link from Plaud.".to_string(),
                    )
                })?;

            if exchange.response.status == 401 && attempt == 0 {
                debug!("Plaud temp-url request returned 401; refreshing token");
                self.auth.clear_cached_token().await;
                continue;
            }

            if !exchange.response.is_success() {
                return Err(AppError::Api(rejection_message(
                    exchange.payload.as_ref(),
                    exchange.response.status,
                    "Plaud API rejected the download request",
                )));
            }

            return exchange
                .payload
                .as_ref()
                .and_then(extract_download_url)
                .ok_or_else(|| {
                    AppError::Api("Plaud API did not return a usable download URL.".to_string())
                });
        }

        unreachable!("temp-url resolution returns within two attempts")
    }

    /// Applies a post-download action to the source recording on the
    /// vendor service.
    pub async fn perform_post_download_action(
        &self,
        file_id: &str,
        action: PostDownloadAction,
        move_target_tag: &str,
    ) -> Result<()> {
        match action {
            PostDownloadAction::None => Ok(()),
            PostDownloadAction::Move => {
                let tag = move_target_tag.trim();
                if tag.is_empty() {
                    return Err(AppError::InvalidInput(
                        "Set a destination folder ID before moving recordings.".to_string(),
                    ));
                }
                self.authorized_post(
                    "/file/update-tags",
                    json!({ "file_id_list": [file_id], "filetag_id": tag }),
                    "Network error while moving the recording on Plaud.",
                )
                .await
            }
            PostDownloadAction::Trash => {
                self.authorized_post(
                    "/file/trash/",
                    json!([file_id]),
                    "Network error while trashing the recording on Plaud.",
                )
                .await
            }
        }
    }

    /// Direct enqueue path for items whose URL is already resolved.
    pub async fn queue_downloads(&self, items: &[DirectDownloadItem]) -> Result<Vec<i64>> {
        if items.is_empty() {
            return Err(AppError::InvalidInput("Nothing to download.".to_string()));
        }

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let url = item
                .url
                .as_deref()
                .filter(|url| is_absolute_http(url))
                .ok_or_else(|| AppError::InvalidInput("Invalid download URL.".to_string()))?;

            let filename = to_safe_filename(item.filename.as_deref().unwrap_or(""), "audio");
            let extension = item
                .extension
                .as_deref()
                .and_then(normalize_extension)
                .or_else(|| infer_extension(url))
                .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
            let subdir = to_safe_path(item.subdirectory.as_deref().unwrap_or(""));

            let request = DownloadRequest {
                url: url.to_string(),
                filename: join_download_path(&subdir, &filename, &extension),
                conflict_action: item.conflict_action.unwrap_or_default(),
            };
            ids.push(self.shelf.enqueue(&request).await?);
        }

        Ok(ids)
    }

    /// Cancels a caller-supplied set of download ids.
    pub async fn cancel_downloads(&self, download_ids: &[i64]) -> Result<()> {
        for id in download_ids {
            if let Err(err) = self.shelf.cancel(*id).await {
                warn!("Failed to cancel download {}: {}", id, err);
            }
        }
        Ok(())
    }

    async fn run_job(
        self: Arc<Self>,
        mut items: Vec<RecordingDescriptor>,
        settings: JobSettings,
        page_params: Vec<(String, String)>,
    ) -> Result<()> {
        if settings.include_metadata {
            self.attacher
                .attach_metadata(&mut items, &page_params)
                .await;
        }

        let prepared: Vec<PreparedItem> = items
            .iter()
            .enumerate()
            .map(|(index, item)| prepare_item(item, index))
            .collect();

        let total = prepared.len();
        self.sink.job_status(&status_update(
            JobStage::Start,
            total,
            0,
            format!("Preparing {} Plaud recording(s)…", total),
        ));

        match self.process_items(&prepared, &settings).await {
            Ok(JobOutcome::Completed) => {
                let (total, completed) = self.clear_active().await;
                self.sink.job_status(&status_update(
                    JobStage::Done,
                    total,
                    completed,
                    "All Plaud recordings downloaded.".to_string(),
                ));
                Ok(())
            }
            Ok(JobOutcome::Cancelled) => Ok(()),
            Err(err) => {
                if self.cancel_requested().await {
                    self.finish_cancelled().await;
                } else {
                    let (total, completed) = self.clear_active().await;
                    self.sink.job_status(&status_update(
                        JobStage::Error,
                        total,
                        completed,
                        err.to_string(),
                    ));
                }
                Err(err)
            }
        }
    }

    async fn process_items(
        &self,
        items: &[PreparedItem],
        settings: &JobSettings,
    ) -> Result<JobOutcome> {
        let subdir = settings.sanitized_subdir();

        for item in items {
            if self.cancel_requested().await {
                self.finish_cancelled().await;
                return Ok(JobOutcome::Cancelled);
            }

            let resolved_url = self.resolve_item_url(item).await?;

            if self.cancel_requested().await {
                self.finish_cancelled().await;
                return Ok(JobOutcome::Cancelled);
            }

            let mut object_url = None;
            let embed = settings.include_metadata
                && item.extension == DEFAULT_EXTENSION
                && item.metadata.map(|m| !m.is_empty()).unwrap_or(false);

            let download_url = if embed {
                match self.tag_audio(&resolved_url, item).await {
                    Ok(url) => {
                        object_url = Some(url.clone());
                        url
                    }
                    Err(err) => {
                        warn!(
                            "Falling back to untagged download for {}: {}",
                            item.filename, err
                        );
                        resolved_url.clone()
                    }
                }
            } else {
                resolved_url.clone()
            };

            let request = DownloadRequest {
                url: download_url,
                filename: join_download_path(&subdir, &item.filename, &item.extension),
                conflict_action: item.conflict_action,
            };

            let download_id = match self.shelf.enqueue(&request).await {
                Ok(id) => id,
                Err(err) => {
                    if let Some(url) = object_url.take() {
                        self.object_urls.revoke(&url);
                    }
                    return Err(err);
                }
            };

            if let Some(url) = object_url {
                self.pending_object_urls
                    .lock()
                    .await
                    .insert(download_id, url);
            }
            {
                let mut active = self.active.lock().await;
                if let Some(job) = active.as_mut() {
                    job.download_ids.push(download_id);
                }
            }

            if self.cancel_requested().await {
                self.finish_cancelled().await;
                return Ok(JobOutcome::Cancelled);
            }

            if settings.post_download_action != PostDownloadAction::None {
                if let Some(file_id) = &item.file_id {
                    self.perform_post_download_action(
                        file_id,
                        settings.post_download_action,
                        &settings.move_target_tag,
                    )
                    .await?;
                }
            }

            let (total, completed) = {
                let mut active = self.active.lock().await;
                match active.as_mut() {
                    Some(job) => {
                        job.completed += 1;
                        (job.total, job.completed)
                    }
                    None => (items.len(), 0),
                }
            };
            self.sink.job_status(&status_update(
                JobStage::Progress,
                total,
                completed,
                format!("Downloaded {}/{} recording(s)…", completed, total),
            ));
        }

        Ok(JobOutcome::Completed)
    }

    async fn resolve_item_url(&self, item: &PreparedItem) -> Result<String> {
        if let Some(url) = &item.url {
            return Ok(url.clone());
        }

        let file_id = item.file_id.as_deref().ok_or_else(|| {
            AppError::InvalidInput("Missing recording identifier on this item.".to_string())
        })?;
        self.resolve_temp_url(file_id).await
    }

    async fn tag_audio(&self, url: &str, item: &PreparedItem) -> Result<String> {
        let audio = self.api.transport().fetch_bytes(url).await?;
        let tagged = write_id3_tag(&audio, &metadata_frames(item));
        Ok(self.object_urls.create(tagged, "audio/mpeg"))
    }

    async fn authorized_post(&self, path: &str, body: Value, network_message: &str) -> Result<()> {
        for attempt in 0..2 {
            let token = self.auth.request_token(attempt > 0).await.ok_or_else(|| {
                AppError::Auth(
                    "Sign in to Plaud before managing recordings. Token not found.".to_string(),
                )
            })?;

            let exchange = self
                .api
                .fetch_api(
                    path,
                    RequestInit::post(build_api_headers(&token), body.clone()),
                    FetchOptions::default(),
                )
                .await
                .map_err(|_| AppError::Network(network_message.to_string()))?;

            if exchange.response.status == 401 && attempt == 0 {
                self.auth.clear_cached_token().await;
                continue;
            }

            if !exchange.response.is_success() {
                return Err(AppError::Api(rejection_message(
                    exchange.payload.as_ref(),
                    exchange.response.status,
                    "Plaud API rejected the request",
                )));
            }

            return Ok(());
        }

        unreachable!("post-action requests return within two attempts")
    }

    async fn cancel_requested(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|job| job.cancel_requested)
            .unwrap_or(false)
    }

    /// Emits the single `cancelled` terminal event and clears the job
    /// slot. Safe to call more than once; only the first call reports.
    async fn finish_cancelled(&self) {
        let snapshot = {
            let mut active = self.active.lock().await;
            match active.take() {
                Some(mut job) if !job.cancellation_notified => {
                    job.cancellation_notified = true;
                    job.status = JobStatus::Cancelled;
                    Some((job.total, job.completed))
                }
                _ => None,
            }
        };

        if let Some((total, completed)) = snapshot {
            self.sink.job_status(&status_update(
                JobStage::Cancelled,
                total,
                completed,
                format!("Cancelled after {}/{} recording(s).", completed, total),
            ));
        }
    }

    async fn clear_active(&self) -> (usize, usize) {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(job) => (job.total, job.completed),
            None => (0, 0),
        }
    }
}

fn status_update(stage: JobStage, total: usize, completed: usize, message: String) -> JobStatusUpdate {
    JobStatusUpdate {
        stage,
        total,
        completed,
        message,
    }
}

fn rejection_message(payload: Option<&Value>, status: u16, context: &str) -> String {
    payload
        .and_then(|p| p.get("message").or_else(|| p.get("msg")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} ({}).", context, status))
}

fn prepare_item(item: &RecordingDescriptor, index: usize) -> PreparedItem {
    let fallback = format!("audio_{}", index + 1);
    let title = if item.filename.trim().is_empty() {
        fallback.clone()
    } else {
        item.filename.trim().to_string()
    };

    let url = item
        .url
        .as_deref()
        .filter(|url| is_absolute_http(url))
        .map(str::to_string);

    let extension = normalize_extension(&item.extension)
        .or_else(|| url.as_deref().and_then(infer_extension))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    PreparedItem {
        file_id: item
            .file_id
            .clone()
            .filter(|file_id| !file_id.trim().is_empty()),
        filename: to_safe_filename(&item.filename, &fallback),
        title,
        url,
        extension,
        conflict_action: ConflictAction::Uniquify,
        metadata: item.metadata,
    }
}

fn metadata_frames(item: &PreparedItem) -> Vec<FrameSpec> {
    let mut frames = vec![FrameSpec::Text {
        id: "TIT2".to_string(),
        value: item.title.clone(),
    }];

    if let Some(file_id) = &item.file_id {
        frames.push(FrameSpec::UserText {
            description: "plaud.file_id".to_string(),
            value: file_id.clone(),
        });
    }

    if let Some(metadata) = &item.metadata {
        push_number_frame(&mut frames, "plaud.start_time_ms", metadata.start_time_ms);
        push_number_frame(&mut frames, "plaud.end_time_ms", metadata.end_time_ms);
        push_number_frame(&mut frames, "plaud.duration_ms", metadata.duration_ms);
        if let Some(hours) = metadata.timezone_offset_hours {
            let minutes = metadata.timezone_offset_minutes.unwrap_or(0.0);
            frames.push(FrameSpec::UserText {
                description: "plaud.timezone_offset".to_string(),
                value: format_utc_offset(hours, minutes),
            });
        }
    }

    frames
}

fn push_number_frame(frames: &mut Vec<FrameSpec>, description: &str, value: Option<f64>) {
    if let Some(value) = value {
        frames.push(FrameSpec::UserText {
            description: description.to_string(),
            value: format_number(value),
        });
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn format_utc_offset(hours: f64, minutes: f64) -> String {
    let sign = if hours < 0.0 || (hours == 0.0 && minutes < 0.0) {
        '-'
    } else {
        '+'
    };
    format!(
        "{}{:02}:{:02}",
        sign,
        hours.abs() as i64,
        minutes.abs() as i64
    )
}

fn is_absolute_http(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

fn join_download_path(subdir: &str, filename: &str, extension: &str) -> String {
    if subdir.is_empty() {
        format!("{}.{}", filename, extension)
    } else {
        format!("{}/{}.{}", subdir, filename, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_API_BASE;
    use crate::test_utils::{FakeObjectUrls, FakeProbe, FakeShelf, FakeTransport, RecordingSink};
    use tokio::sync::Semaphore;

    struct Harness {
        controller: Arc<DownloadJobController>,
        transport: Arc<FakeTransport>,
        shelf: Arc<FakeShelf>,
        sink: Arc<RecordingSink>,
        object_urls: Arc<FakeObjectUrls>,
        probe: Arc<FakeProbe>,
    }

    fn harness_with_probe(
        transport: Arc<FakeTransport>,
        shelf: Arc<FakeShelf>,
        probe: Arc<FakeProbe>,
    ) -> Harness {
        crate::test_utils::init_logs();
        let api = Arc::new(PlaudApiClient::new(transport.clone(), DEFAULT_API_BASE));
        let auth = AuthBridge::new(probe.clone());
        probe.bind(&auth);
        let attacher = Arc::new(MetadataAttacher::new(api.clone(), auth.clone()));
        let sink = RecordingSink::new();
        let object_urls = FakeObjectUrls::new();
        let controller = DownloadJobController::new(
            api,
            auth,
            attacher,
            shelf.clone(),
            object_urls.clone(),
            sink.clone(),
        );

        Harness {
            controller,
            transport,
            shelf,
            sink,
            object_urls,
            probe,
        }
    }

    fn harness(transport: Arc<FakeTransport>, shelf: Arc<FakeShelf>) -> Harness {
        harness_with_probe(transport, shelf, FakeProbe::with_token("token"))
    }

    fn item_with_url(filename: &str, url: &str) -> RecordingDescriptor {
        RecordingDescriptor {
            file_id: None,
            filename: filename.to_string(),
            url: Some(url.to_string()),
            extension: "mp3".to_string(),
            context: None,
            metadata: None,
        }
    }

    fn item_with_id(filename: &str, file_id: &str) -> RecordingDescriptor {
        RecordingDescriptor {
            file_id: Some(file_id.to_string()),
            filename: filename.to_string(),
            url: None,
            extension: "mp3".to_string(),
            context: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn completes_a_job_and_reports_each_item() {
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::new());
        let settings = JobSettings {
            download_subdir: "plaud recordings".to_string(),
            ..JobSettings::default()
        };

        h.controller
            .start_job(
                vec![
                    item_with_url("Meeting one", "https://cdn.example/one.mp3"),
                    item_with_url("Meeting: two", "https://cdn.example/two.mp3"),
                ],
                settings,
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(
            h.sink.stages(),
            vec![
                JobStage::Start,
                JobStage::Progress,
                JobStage::Progress,
                JobStage::Done,
            ]
        );

        let enqueued = h.shelf.enqueued();
        assert_eq!(enqueued[0].filename, "plaud-recordings/Meeting_one.mp3");
        assert_eq!(enqueued[1].filename, "plaud-recordings/Meeting_two.mp3");
        assert_eq!(enqueued[0].conflict_action, ConflictAction::Uniquify);

        let last = h.sink.updates().last().cloned().unwrap();
        assert_eq!((last.total, last.completed), (2, 2));
        assert_eq!(last.message, "All Plaud recordings downloaded.");
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn rejects_empty_batches_and_invalid_settings() {
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::new());

        let err = h
            .controller
            .start_job(Vec::new(), JobSettings::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Nothing to download"));

        let err = h
            .controller
            .start_job(
                vec![item_with_url("a", "https://cdn.example/a.mp3")],
                JobSettings {
                    post_download_action: PostDownloadAction::Move,
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("destination folder"));
    }

    #[tokio::test]
    async fn second_job_is_rejected_while_one_is_active() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::gated(gate.clone()));

        h.controller
            .start_job(
                vec![item_with_url("First", "https://cdn.example/one.mp3")],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();

        let err = h
            .controller
            .start_job(
                vec![item_with_url("Second", "https://cdn.example/two.mp3")],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        gate.add_permits(1);
        h.sink.wait_terminal().await;

        // The active job ran to completion untouched by the rejected call.
        let last = h.sink.updates().last().cloned().unwrap();
        assert_eq!((last.stage, last.total, last.completed), (JobStage::Done, 1, 1));
    }

    #[tokio::test]
    async fn stop_reports_cancelling_then_exactly_one_cancelled() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::gated(gate.clone()));

        h.controller
            .start_job(
                vec![
                    item_with_url("First", "https://cdn.example/one.mp3"),
                    item_with_url("Second", "https://cdn.example/two.mp3"),
                ],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_for_stage(JobStage::Start).await;

        h.controller.stop_job().await.unwrap();
        // A second stop while cancelling neither fails nor re-reports.
        h.controller.stop_job().await.unwrap();

        gate.add_permits(2);
        h.sink.wait_terminal().await;

        let stages = h.sink.stages();
        assert_eq!(
            stages,
            vec![JobStage::Start, JobStage::Cancelling, JobStage::Cancelled]
        );

        let last = h.sink.updates().last().cloned().unwrap();
        assert_eq!(last.total, 2);
        assert!(last.completed <= last.total);
        // Only the first item was ever handed to the download manager, and
        // no download id existed yet when the stop request went out.
        assert_eq!(h.shelf.enqueued().len(), 1);
        assert!(h.shelf.cancelled().is_empty());
    }

    #[tokio::test]
    async fn url_resolution_retries_once_after_401() {
        let transport = FakeTransport::new(vec![
            FakeTransport::json(401, serde_json::json!({})),
            FakeTransport::json(
                200,
                serde_json::json!({ "temp_url": "https://cdn.example/audio.mp3" }),
            ),
        ]);
        let h = harness(transport, FakeShelf::new());

        h.controller
            .start_job(
                vec![item_with_id("Standup", "rec-1")],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(h.sink.stages().last(), Some(&JobStage::Done));
        assert_eq!(h.transport.call_count(), 2);
        // One probe for the initial token, one forced refresh after 401.
        assert_eq!(h.probe.injections(), 2);
        assert_eq!(h.shelf.enqueued()[0].url, "https://cdn.example/audio.mp3");
        assert!(h.transport.urls()[0].contains("/file/temp-url/rec-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_surfaces_a_sign_in_error() {
        let h = harness_with_probe(
            FakeTransport::new(Vec::new()),
            FakeShelf::new(),
            FakeProbe::silent(),
        );

        h.controller
            .start_job(
                vec![item_with_id("Standup", "rec-1")],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        let last = h.sink.updates().last().cloned().unwrap();
        assert_eq!(last.stage, JobStage::Error);
        assert!(last.message.contains("Sign in to Plaud"));
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn move_action_posts_the_tag_update() {
        let transport = FakeTransport::new(vec![FakeTransport::json(200, serde_json::json!({}))]);
        let h = harness(transport, FakeShelf::new());

        let mut item = item_with_url("Standup", "https://cdn.example/one.mp3");
        item.file_id = Some("rec-1".to_string());

        h.controller
            .start_job(
                vec![item],
                JobSettings {
                    post_download_action: PostDownloadAction::Move,
                    move_target_tag: "tag-9".to_string(),
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(h.sink.stages().last(), Some(&JobStage::Done));
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.ends_with("/file/update-tags"));
        assert_eq!(
            requests[0].body,
            Some(serde_json::json!({ "file_id_list": ["rec-1"], "filetag_id": "tag-9" }))
        );
    }

    #[tokio::test]
    async fn trash_action_posts_the_file_id() {
        let transport = FakeTransport::new(vec![FakeTransport::json(200, serde_json::json!({}))]);
        let h = harness(transport, FakeShelf::new());

        let mut item = item_with_url("Standup", "https://cdn.example/one.mp3");
        item.file_id = Some("rec-1".to_string());

        h.controller
            .start_job(
                vec![item],
                JobSettings {
                    post_download_action: PostDownloadAction::Trash,
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        let requests = h.transport.requests();
        assert!(requests[0].url.ends_with("/file/trash/"));
        assert_eq!(requests[0].body, Some(serde_json::json!(["rec-1"])));
    }

    #[tokio::test]
    async fn metadata_embedding_wraps_tagged_audio_in_an_object_url() {
        let transport = FakeTransport::new(vec![FakeTransport::json(
            200,
            serde_json::json!({
                "data_file_list": [
                    { "file_id": "rec-1", "start_time": 1700000000000i64, "duration": 60000 }
                ]
            }),
        )]);
        transport.set_audio(vec![0x11, 0x22, 0x33]);
        let h = harness(transport, FakeShelf::new());

        let mut item = item_with_url("Standup", "https://cdn.example/one.mp3");
        item.file_id = Some("rec-1".to_string());

        h.controller
            .start_job(
                vec![item],
                JobSettings {
                    include_metadata: true,
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(h.sink.stages().last(), Some(&JobStage::Done));
        assert_eq!(
            h.transport.fetched_urls(),
            vec!["https://cdn.example/one.mp3"]
        );

        let created = h.object_urls.created();
        assert_eq!(created.len(), 1);
        assert_eq!(&created[0].1[0..3], b"ID3");
        assert_eq!(h.shelf.enqueued()[0].url, created[0].0);

        // The object URL is released once the download manager reports the
        // download terminal.
        h.controller
            .note_download_change(&DownloadChange {
                id: 100,
                state: DownloadState::Complete,
            })
            .await;
        assert_eq!(h.object_urls.revoked(), vec![created[0].0.clone()]);
    }

    #[tokio::test]
    async fn failed_audio_fetch_degrades_to_an_untagged_download() {
        let transport = FakeTransport::new(vec![FakeTransport::json(
            200,
            serde_json::json!({
                "data_file_list": [
                    { "file_id": "rec-1", "start_time": 1700000000000i64 }
                ]
            }),
        )]);
        transport.fail_audio_fetches();
        let h = harness(transport, FakeShelf::new());

        let mut item = item_with_url("Standup", "https://cdn.example/one.mp3");
        item.file_id = Some("rec-1".to_string());

        h.controller
            .start_job(
                vec![item],
                JobSettings {
                    include_metadata: true,
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(h.sink.stages().last(), Some(&JobStage::Done));
        assert!(h.object_urls.created().is_empty());
        assert_eq!(h.shelf.enqueued()[0].url, "https://cdn.example/one.mp3");
    }

    #[tokio::test]
    async fn failures_abort_the_job_but_keep_the_completed_count() {
        // First item needs no network; the second one's resolution hits a
        // transport failure.
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::new());

        h.controller
            .start_job(
                vec![
                    item_with_url("First", "https://cdn.example/one.mp3"),
                    item_with_id("Second", "rec-2"),
                ],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        let stages = h.sink.stages();
        assert_eq!(
            stages,
            vec![JobStage::Start, JobStage::Progress, JobStage::Error]
        );
        let last = h.sink.updates().last().cloned().unwrap();
        assert_eq!((last.total, last.completed), (2, 1));
        assert!(last.message.contains("Network error"));

        // The slot is free again after the error.
        h.controller
            .start_job(
                vec![item_with_url("Third", "https://cdn.example/three.mp3")],
                JobSettings::default(),
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_for_stage(JobStage::Done).await;
    }

    #[tokio::test]
    async fn enqueue_failure_revokes_the_fresh_object_url() {
        let transport = FakeTransport::new(vec![FakeTransport::json(
            200,
            serde_json::json!({
                "data_file_list": [
                    { "file_id": "rec-1", "start_time": 1700000000000i64 }
                ]
            }),
        )]);
        transport.set_audio(vec![0x01]);
        let shelf = FakeShelf::new();
        shelf.set_failing();
        let h = harness(transport, shelf);

        let mut item = item_with_url("Standup", "https://cdn.example/one.mp3");
        item.file_id = Some("rec-1".to_string());

        h.controller
            .start_job(
                vec![item],
                JobSettings {
                    include_metadata: true,
                    ..JobSettings::default()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        h.sink.wait_terminal().await;

        assert_eq!(h.sink.stages().last(), Some(&JobStage::Error));
        let created = h.object_urls.created();
        assert_eq!(created.len(), 1);
        assert_eq!(h.object_urls.revoked(), vec![created[0].0.clone()]);
    }

    #[tokio::test]
    async fn direct_queue_validates_urls_and_infers_extensions() {
        let h = harness(FakeTransport::new(Vec::new()), FakeShelf::new());

        let ids = h
            .controller
            .queue_downloads(&[DirectDownloadItem {
                url: Some("https://cdn.example/clip.WAV?sig=1".to_string()),
                filename: Some("My clip".to_string()),
                extension: None,
                conflict_action: None,
                subdirectory: Some("voice notes".to_string()),
            }])
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(h.shelf.enqueued()[0].filename, "voice-notes/My_clip.wav");

        let err = h
            .controller
            .queue_downloads(&[DirectDownloadItem {
                url: Some("ftp://cdn.example/clip.mp3".to_string()),
                filename: None,
                extension: None,
                conflict_action: None,
                subdirectory: None,
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid download URL"));
    }
}
