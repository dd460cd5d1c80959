use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::api::{build_api_headers, FetchOptions, PlaudApiClient, RequestInit};
use crate::auth::AuthBridge;
use crate::scanner::{resolve_item_id, RecordingDescriptor};

/// Approximates "all recordings" in one page; the vendor API has no
/// documented upper bound.
const LISTING_PAGE_SIZE: u32 = 99_999;

/// Page query parameters that change which recordings the dashboard view
/// shows, and therefore which bulk listing applies.
const LISTING_QUERY_ALLOW_LIST: &[&str] = &["category", "tag", "filetag_id", "folder", "view"];

const LISTING_ARRAY_FIELDS: &[&str] = &["data_file_list", "data"];

const START_TIME_FIELDS: &[&str] = &["start_time", "startTime", "start_at"];
const END_TIME_FIELDS: &[&str] = &["end_time", "endTime", "end_at"];
const DURATION_FIELDS: &[&str] = &["duration", "duration_ms", "durationMs", "time_length"];
const TZ_HOURS_FIELDS: &[&str] = &["timezone_offset_hours", "tz_offset_hours", "utc_offset_hours"];
const TZ_MINUTES_FIELDS: &[&str] = &[
    "timezone_offset_minutes",
    "tz_offset_minutes",
    "utc_offset_minutes",
];

/// Timing metadata for one recording. Every field is a finite number or
/// None; nothing here is ever NaN.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub start_time_ms: Option<f64>,
    pub end_time_ms: Option<f64>,
    pub duration_ms: Option<f64>,
    pub timezone_offset_hours: Option<f64>,
    pub timezone_offset_minutes: Option<f64>,
}

impl RecordingMetadata {
    pub fn is_empty(&self) -> bool {
        self.start_time_ms.is_none()
            && self.end_time_ms.is_none()
            && self.duration_ms.is_none()
            && self.timezone_offset_hours.is_none()
            && self.timezone_offset_minutes.is_none()
    }
}

struct ListingCache {
    key: String,
    by_file_id: HashMap<String, RecordingMetadata>,
}

/// Fetches the bulk recording listing for the current dashboard view and
/// maps its timing metadata onto job items. Best effort throughout: no
/// token, a failed fetch or an unrecognized payload all leave the items
/// without metadata rather than failing the caller.
pub struct MetadataAttacher {
    api: Arc<PlaudApiClient>,
    auth: Arc<AuthBridge>,
    cache: Mutex<Option<ListingCache>>,
}

impl MetadataAttacher {
    pub fn new(api: Arc<PlaudApiClient>, auth: Arc<AuthBridge>) -> Self {
        Self {
            api,
            auth,
            cache: Mutex::new(None),
        }
    }

    pub async fn attach_metadata(
        &self,
        items: &mut [RecordingDescriptor],
        page_params: &[(String, String)],
    ) {
        let listing = match self.listing_for(page_params).await {
            Some(listing) => listing,
            None => return,
        };

        for item in items.iter_mut() {
            if let Some(file_id) = &item.file_id {
                if let Some(found) = listing.get(file_id) {
                    item.metadata = Some(*found);
                }
            }
        }
    }

    async fn listing_for(
        &self,
        page_params: &[(String, String)],
    ) -> Option<HashMap<String, RecordingMetadata>> {
        let key = cache_key(page_params);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.as_ref() {
                if entry.key == key {
                    return Some(entry.by_file_id.clone());
                }
            }
        }

        let token = match self.auth.request_token(false).await {
            Some(token) => token,
            None => {
                debug!("Skipping metadata fetch; no Plaud token available");
                return None;
            }
        };

        let path = format!("/file/simple/web?{}", build_listing_query(page_params));
        let exchange = match self
            .api
            .fetch_api(
                &path,
                RequestInit::get(build_api_headers(&token)),
                FetchOptions::default(),
            )
            .await
        {
            Ok(exchange) => exchange,
            Err(error) => {
                warn!("Failed to fetch the Plaud recording listing: {}", error);
                return None;
            }
        };

        if !exchange.response.is_success() {
            warn!(
                "Plaud recording listing request was rejected ({})",
                exchange.response.status
            );
            return None;
        }

        let by_file_id = exchange
            .payload
            .as_ref()
            .map(parse_listing)
            .unwrap_or_default();

        let mut cache = self.cache.lock().await;
        *cache = Some(ListingCache {
            key,
            by_file_id: by_file_id.clone(),
        });

        Some(by_file_id)
    }
}

fn filtered_params(page_params: &[(String, String)]) -> Vec<(String, String)> {
    page_params
        .iter()
        .filter(|(key, _)| LISTING_QUERY_ALLOW_LIST.contains(&key.as_str()))
        .cloned()
        .collect()
}

fn cache_key(page_params: &[(String, String)]) -> String {
    let mut pairs = filtered_params(page_params);
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn build_listing_query(page_params: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = vec![
        ("skip".to_string(), "0".to_string()),
        ("limit".to_string(), LISTING_PAGE_SIZE.to_string()),
        ("is_trash".to_string(), "0".to_string()),
        ("sort_field".to_string(), "start_time".to_string()),
        ("sort_type".to_string(), "desc".to_string()),
    ];
    pairs.extend(filtered_params(page_params));

    pairs
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_listing(payload: &Value) -> HashMap<String, RecordingMetadata> {
    let entries = LISTING_ARRAY_FIELDS
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_array));

    let entries = match entries {
        Some(entries) => entries,
        None => {
            debug!("Recording listing payload held no item array");
            return HashMap::new();
        }
    };

    let mut by_file_id = HashMap::new();
    for entry in entries {
        if let Some(file_id) = resolve_item_id(entry) {
            by_file_id.insert(file_id, extract_timing(entry));
        }
    }
    by_file_id
}

fn extract_timing(entry: &Value) -> RecordingMetadata {
    RecordingMetadata {
        start_time_ms: finite_number_field(entry, START_TIME_FIELDS),
        end_time_ms: finite_number_field(entry, END_TIME_FIELDS),
        duration_ms: finite_number_field(entry, DURATION_FIELDS),
        timezone_offset_hours: finite_number_field(entry, TZ_HOURS_FIELDS),
        timezone_offset_minutes: finite_number_field(entry, TZ_MINUTES_FIELDS),
    }
}

fn finite_number_field(entry: &Value, candidates: &[&str]) -> Option<f64> {
    candidates
        .iter()
        .find_map(|field| entry.get(field).and_then(coerce_finite))
}

/// Coerces a JSON value to a finite number; anything else becomes None,
/// never NaN.
fn coerce_finite(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}
