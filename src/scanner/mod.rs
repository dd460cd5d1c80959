use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::DEFAULT_EXTENSION;
use crate::metadata::RecordingMetadata;

/// Selector candidates per row field, in priority order. The vendor has
/// renamed these classes across dashboard releases; the first non-empty
/// match wins.
const TITLE_SELECTORS: &[&str] = &[".title", ".file-name", ".record-title"];
const DATE_SELECTORS: &[&str] = &[".time_date", ".record-time", ".date"];
const DURATION_SELECTORS: &[&str] = &[".duration", ".record-duration", ".time-length"];
const TAG_SELECTORS: &[&str] = &[".comesTag", ".file-tag", ".tag-name"];

/// Property paths under which the virtualization component keeps its
/// backing item array. None of these is a committed vendor contract; a
/// miss is a normal empty result.
const ITEM_ARRAY_PATHS: &[&str] = &[
    "/props/items",
    "/props/data",
    "/ctx/items",
    "/ctx/list",
    "/setupState/items",
];

const ID_FIELDS: &[&str] = &["fileId", "file_id", "id", "fileid"];
const ITEM_TITLE_FIELDS: &[&str] = &["filename", "file_name", "title", "name"];
const ITEM_DATE_FIELDS: &[&str] = &["start_time_format", "time_date", "created_at", "date"];
const ITEM_DURATION_FIELDS: &[&str] = &["duration_format", "duration", "time_length"];
const ITEM_TAG_FIELDS: &[&str] = &["filetag_name", "tag_name", "tag", "category"];
const ITEM_URL_FIELDS: &[&str] = &["temp_url", "url", "downloadUrl"];

const SCROLL_SETTLE: Duration = Duration::from_millis(250);
const SCROLL_MIN_STEP_PX: f64 = 200.0;
const SCROLL_STEP_VIEWPORT_SHARE: f64 = 0.9;
const MAX_SCROLL_PASSES: usize = 120;
const MAX_IDLE_PASSES: usize = 6;
const FINAL_SETTLE_ROUNDS: usize = 6;
const FINAL_SETTLE_IDLE_LIMIT: usize = 4;

/// One discovered audio item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDescriptor {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub metadata: Option<RecordingMetadata>,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

/// A rendered list row. `text` resolves the first matching element for the
/// given selector and returns its text content.
pub trait RecordingRow: Send {
    fn file_id(&self) -> Option<String>;
    fn text(&self, selector: &str) -> Option<String>;
}

/// The virtualized scroller element.
#[async_trait::async_trait]
pub trait ScrollRegion: Send + Sync {
    fn scroll_top(&self) -> f64;
    fn set_scroll_top(&self, offset: f64);
    fn viewport_height(&self) -> f64;
    fn content_height(&self) -> f64;
    async fn dispatch_scroll(&self);
}

/// Read-only view of the live dashboard: currently-rendered rows, the
/// virtualization component's internal instance handle when reachable,
/// the scroller, and the page's query parameters.
pub trait DashboardPage: Send + Sync {
    fn rows(&self) -> Vec<Box<dyn RecordingRow>>;
    fn list_component(&self) -> Option<Value>;
    fn scroller(&self) -> Option<Arc<dyn ScrollRegion>>;
    fn query_params(&self) -> Vec<(String, String)>;
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub items: Vec<RecordingDescriptor>,
    pub last_scan_at: i64,
}

#[derive(Default)]
struct Inventory {
    order: Vec<String>,
    entries: HashMap<String, RecordingDescriptor>,
}

impl Inventory {
    /// Returns true when the identifier is new to the accumulator.
    fn upsert(&mut self, incoming: RecordingDescriptor) -> bool {
        let key = match &incoming.file_id {
            Some(id) => id.clone(),
            None => return false,
        };

        match self.entries.get_mut(&key) {
            Some(existing) => {
                merge_descriptor(existing, incoming);
                false
            }
            None => {
                self.order.push(key.clone());
                self.entries.insert(key, incoming);
                true
            }
        }
    }

    fn items(&self) -> Vec<RecordingDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

/// Incrementally discovers recording descriptors from the live DOM; in
/// exhaustive mode additionally reads the virtualization component's
/// backing array and drives a programmatic scroll sweep so every lazily
/// rendered row passes through the viewport at least once.
pub struct ListScanner {
    page: Arc<dyn DashboardPage>,
    inventory: Mutex<Inventory>,
}

impl ListScanner {
    pub fn new(page: Arc<dyn DashboardPage>) -> Self {
        Self {
            page,
            inventory: Mutex::new(Inventory::default()),
        }
    }

    pub fn page_params(&self) -> Vec<(String, String)> {
        self.page.query_params()
    }

    pub async fn scan(&self, exhaustive: bool) -> ScanOutcome {
        {
            let mut inventory = self.inventory.lock().await;
            if exhaustive {
                self.seed_from_component(&mut inventory);
            }
            self.ingest_rows(&mut inventory);
        }

        if exhaustive {
            self.scroll_sweep().await;
        }

        let inventory = self.inventory.lock().await;
        ScanOutcome {
            items: inventory.items(),
            last_scan_at: Utc::now().timestamp_millis(),
        }
    }

    /// Records a resolved download URL back onto the accumulated
    /// descriptor so later scans and jobs reuse it.
    pub async fn note_resolved_url(&self, file_id: &str, url: &str) {
        let mut inventory = self.inventory.lock().await;
        if let Some(descriptor) = inventory.entries.get_mut(file_id) {
            descriptor.url = Some(url.to_string());
        }
    }

    fn ingest_rows(&self, inventory: &mut Inventory) -> usize {
        let mut discovered = 0;
        for (position, row) in self.page.rows().into_iter().enumerate() {
            if let Some(descriptor) = describe_row(row.as_ref(), position) {
                if inventory.upsert(descriptor) {
                    discovered += 1;
                }
            }
        }
        discovered
    }

    fn seed_from_component(&self, inventory: &mut Inventory) {
        let instance = match self.page.list_component() {
            Some(instance) => instance,
            None => return,
        };

        let items = match extract_item_array(&instance) {
            Some(items) => items,
            None => {
                debug!("Virtualized list component exposed no item array");
                return;
            }
        };

        let mut seeded = 0;
        for (position, item) in items.iter().enumerate() {
            if let Some(descriptor) = describe_component_item(item, position) {
                if inventory.upsert(descriptor) {
                    seeded += 1;
                }
            }
        }
        debug!("Seeded {} recording(s) from the list component", seeded);
    }

    async fn scroll_sweep(&self) {
        let scroller = match self.page.scroller() {
            Some(scroller) => scroller,
            None => return,
        };

        let original_offset = scroller.scroll_top();

        scroller.set_scroll_top(0.0);
        scroller.dispatch_scroll().await;
        tokio::time::sleep(SCROLL_SETTLE).await;
        self.ingest_snapshot().await;

        let mut idle_passes = 0;
        for _ in 0..MAX_SCROLL_PASSES {
            let step =
                (scroller.viewport_height() * SCROLL_STEP_VIEWPORT_SHARE).max(SCROLL_MIN_STEP_PX);
            scroller.set_scroll_top(scroller.scroll_top() + step);
            scroller.dispatch_scroll().await;
            tokio::time::sleep(SCROLL_SETTLE).await;

            let discovered = self.ingest_snapshot().await;
            let at_bottom = scroller.scroll_top() + scroller.viewport_height() + 1.0
                >= scroller.content_height();

            if discovered > 0 {
                idle_passes = 0;
            } else if at_bottom {
                idle_passes += 1;
                if idle_passes >= MAX_IDLE_PASSES {
                    break;
                }
            }
        }

        // Late asynchronous loads can still grow the list after the sweep
        // reaches the bottom.
        let mut stale_rounds = 0;
        for _ in 0..FINAL_SETTLE_ROUNDS {
            scroller.set_scroll_top(scroller.content_height());
            scroller.dispatch_scroll().await;
            tokio::time::sleep(SCROLL_SETTLE).await;

            if self.ingest_snapshot().await == 0 {
                stale_rounds += 1;
                if stale_rounds >= FINAL_SETTLE_IDLE_LIMIT {
                    break;
                }
            } else {
                stale_rounds = 0;
            }
        }

        scroller.set_scroll_top(original_offset);
    }

    async fn ingest_snapshot(&self) -> usize {
        let mut inventory = self.inventory.lock().await;
        self.ingest_rows(&mut inventory)
    }
}

fn merge_descriptor(existing: &mut RecordingDescriptor, incoming: RecordingDescriptor) {
    if existing.filename.trim().is_empty() && !incoming.filename.trim().is_empty() {
        existing.filename = incoming.filename;
    }
    if existing.url.is_none() {
        existing.url = incoming.url;
    }
    if existing.extension.trim().is_empty() {
        existing.extension = incoming.extension;
    }
    if existing.context.is_none() {
        existing.context = incoming.context;
    }
    if existing.metadata.is_none() {
        existing.metadata = incoming.metadata;
    }
}

fn describe_row(row: &dyn RecordingRow, position: usize) -> Option<RecordingDescriptor> {
    let file_id = row
        .file_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())?;

    let title = first_row_text(row, TITLE_SELECTORS);
    let time_info = first_row_text(row, DATE_SELECTORS);
    let duration = first_row_text(row, DURATION_SELECTORS);
    let tag = first_row_text(row, TAG_SELECTORS);

    Some(RecordingDescriptor {
        file_id: Some(file_id),
        filename: title.unwrap_or_else(|| format!("Recording {}", position + 1)),
        url: None,
        extension: DEFAULT_EXTENSION.to_string(),
        context: join_context(&[time_info, duration, tag]),
        metadata: None,
    })
}

fn first_row_text(row: &dyn RecordingRow, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        row.text(selector)
            .map(|text| collapse_whitespace(&text))
            .filter(|text| !text.is_empty())
    })
}

/// Joins context pieces with `" | "`, dropping blanks and duplicates.
fn join_context(pieces: &[Option<String>]) -> Option<String> {
    let mut seen: Vec<String> = Vec::new();
    for piece in pieces.iter().flatten() {
        if !piece.is_empty() && !seen.contains(piece) {
            seen.push(piece.clone());
        }
    }

    if seen.is_empty() {
        None
    } else {
        Some(seen.join(" | "))
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_item_array(instance: &Value) -> Option<&Vec<Value>> {
    ITEM_ARRAY_PATHS
        .iter()
        .find_map(|path| instance.pointer(path).and_then(Value::as_array))
}

fn describe_component_item(item: &Value, position: usize) -> Option<RecordingDescriptor> {
    if !item.is_object() {
        return None;
    }

    let file_id = resolve_item_id(item)?;
    let title = string_field(item, ITEM_TITLE_FIELDS);
    let date = string_field(item, ITEM_DATE_FIELDS);
    let duration = string_field(item, ITEM_DURATION_FIELDS);
    let tag = string_field(item, ITEM_TAG_FIELDS);
    let url = string_field(item, ITEM_URL_FIELDS).filter(|value| value.starts_with("http"));

    Some(RecordingDescriptor {
        file_id: Some(file_id),
        filename: title.unwrap_or_else(|| format!("Recording {}", position + 1)),
        url,
        extension: DEFAULT_EXTENSION.to_string(),
        context: join_context(&[date, duration, tag]),
        metadata: None,
    })
}

/// Resolves a per-item identifier, trying the known field spellings.
pub(crate) fn resolve_item_id(item: &Value) -> Option<String> {
    string_field(item, ID_FIELDS)
}

pub(crate) fn string_field(item: &Value, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|field| match item.get(field) {
        Some(Value::String(text)) => {
            let collapsed = collapse_whitespace(text);
            if collapsed.is_empty() {
                None
            } else {
                Some(collapsed)
            }
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}
