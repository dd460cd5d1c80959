use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::sync::Mutex;
use url::Url;

use crate::errors::{AppError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.plaud.ai";
const PLAUD_ROOT_DOMAIN: &str = ".plaud.ai";
const REGION_MISMATCH_STATUS: i64 = -302;

/// A fully-addressed request handed to the transport layer.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Method/headers/body for a call whose URL the client builds itself.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestInit {
    pub fn get(headers: Vec<(String, String)>) -> Self {
        Self {
            method: Method::GET,
            headers,
            body: None,
        }
    }

    pub fn post(headers: Vec<(String, String)>, body: Value) -> Self {
        Self {
            method: Method::POST,
            headers,
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response plus its defensively-parsed JSON payload. A body that is not
/// valid JSON yields `payload: None`, never an error.
#[derive(Debug, Clone)]
pub struct ApiExchange {
    pub response: ApiResponse,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub allow_regional_retry: bool,
    pub api_base: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_regional_retry: true,
            api_base: None,
        }
    }
}

/// Transport seam between the client and the network. Production uses
/// [`ReqwestTransport`]; tests substitute scripted fakes.
#[async_trait::async_trait]
pub trait ApiTransport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ApiTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(ApiResponse { status, body })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Network(format!(
                "Audio fetch failed ({}).",
                response.status().as_u16()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Client for the Plaud API. Remembers the origin the account's data
/// actually lives behind: a request answered with a region mismatch is
/// retried once against the origin the vendor names, and that origin
/// becomes the preferred base for subsequent calls.
pub struct PlaudApiClient {
    transport: Arc<dyn ApiTransport>,
    default_base: String,
    preferred_base: Mutex<Option<String>>,
}

impl PlaudApiClient {
    pub fn new(transport: Arc<dyn ApiTransport>, default_base: &str) -> Self {
        Self {
            transport,
            preferred_base: Mutex::new(normalize_api_base(default_base)),
            default_base: default_base.to_string(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ApiTransport> {
        &self.transport
    }

    pub async fn fetch_api(
        &self,
        path: &str,
        init: RequestInit,
        options: FetchOptions,
    ) -> Result<ApiExchange> {
        let initial_base = match &options.api_base {
            Some(base) => normalize_api_base(base),
            None => self.preferred_base.lock().await.clone(),
        }
        .or_else(|| normalize_api_base(&self.default_base));

        let request = ApiRequest {
            method: init.method.clone(),
            url: build_api_url(path, initial_base.as_deref(), &self.default_base),
            headers: init.headers.clone(),
            body: init.body.clone(),
        };

        let response = self.transport.execute(&request).await?;
        let payload = parse_payload(&response);

        if !options.allow_regional_retry {
            return Ok(ApiExchange { response, payload });
        }

        let regional_base = payload
            .as_ref()
            .and_then(|payload| regional_retry_base(payload, initial_base.as_deref()));
        if let Some(regional_base) = regional_base {
            info!(
                "Retrying Plaud API request against regional origin {} for {}",
                regional_base, path
            );
            *self.preferred_base.lock().await = Some(regional_base.clone());

            let retry = ApiRequest {
                url: build_api_url(path, Some(&regional_base), &self.default_base),
                ..request
            };
            let response = self.transport.execute(&retry).await?;
            let payload = parse_payload(&response);
            return Ok(ApiExchange { response, payload });
        }

        if let Some(base) = initial_base {
            *self.preferred_base.lock().await = Some(base);
        }

        Ok(ApiExchange { response, payload })
    }
}

fn parse_payload(response: &ApiResponse) -> Option<Value> {
    match serde_json::from_str(&response.body) {
        Ok(value) => Some(value),
        Err(_) => {
            debug!("Plaud API response body was not JSON");
            None
        }
    }
}

/// Normalizes a base-origin candidate: bare hostnames gain `https://`,
/// anything whose host is not a `.plaud.ai` subdomain is rejected.
pub fn normalize_api_base(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lowered = trimmed.to_ascii_lowercase();
    let with_protocol = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&with_protocol).ok()?;
    let host = url.host_str()?;
    if !host.ends_with(PLAUD_ROOT_DOMAIN) {
        return None;
    }

    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Joins base and path with exactly one slash between them.
pub fn build_api_url(path: &str, base: Option<&str>, fallback_base: &str) -> String {
    let normalized = base
        .and_then(normalize_api_base)
        .or_else(|| normalize_api_base(fallback_base))
        .unwrap_or_else(|| fallback_base.to_string());

    if path.is_empty() {
        return normalized;
    }

    if path.starts_with('/') {
        format!("{}{}", normalized, path)
    } else {
        format!("{}/{}", normalized, path)
    }
}

pub fn is_region_mismatch_payload(payload: &Value) -> bool {
    if !payload.is_object() {
        return false;
    }

    let status = match payload.get("status") {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    if status == Some(REGION_MISMATCH_STATUS as f64) {
        return true;
    }

    ["msg", "message"].iter().any(|field| {
        payload
            .get(field)
            .and_then(Value::as_str)
            .map(|text| text.to_ascii_lowercase().contains("region mismatch"))
            .unwrap_or(false)
    })
}

pub fn extract_regional_api_base(payload: &Value) -> Option<String> {
    let candidate = payload
        .pointer("/data/domains/api")
        .or_else(|| payload.pointer("/domains/api"))?
        .as_str()?;
    normalize_api_base(candidate)
}

/// The origin to retry against: present only when the payload signals a
/// region mismatch naming a valid origin different from the one just used.
fn regional_retry_base(payload: &Value, current_base: Option<&str>) -> Option<String> {
    if !is_region_mismatch_payload(payload) {
        return None;
    }

    let regional_base = extract_regional_api_base(payload)?;
    if current_base.and_then(normalize_api_base).as_deref() == Some(regional_base.as_str()) {
        return None;
    }

    Some(regional_base)
}

/// Picks a usable download link out of a temp-url response, trying the
/// direct field spellings first and then descending into `data`.
pub fn extract_download_url(payload: &Value) -> Option<String> {
    const DIRECT_FIELDS: &[&str] = &["temp_url", "tempUrl", "temp_url_opus", "url", "downloadUrl"];

    for field in DIRECT_FIELDS {
        if let Some(candidate) = payload.get(field).and_then(Value::as_str) {
            if candidate.starts_with("http") {
                return Some(candidate.to_string());
            }
        }
    }

    match payload.get("data") {
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(candidate) = entry.as_str() {
                    if candidate.starts_with("http") {
                        return Some(candidate.to_string());
                    }
                } else if entry.is_object() {
                    if let Some(nested) = extract_download_url(entry) {
                        return Some(nested);
                    }
                }
            }
            None
        }
        Some(data @ Value::Object(_)) => extract_download_url(data),
        _ => None,
    }
}

/// Fixed platform-identification headers plus the bearer token, with any
/// leading `Bearer ` prefix stripped from the raw token first.
pub fn build_api_headers(token: &str) -> Vec<(String, String)> {
    let trimmed = token.trim();
    let bare = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();

    vec![
        (
            "accept".to_string(),
            "application/json, text/plain, */*".to_string(),
        ),
        ("app-platform".to_string(), "web".to_string()),
        ("edit-from".to_string(), "web".to_string()),
        ("authorization".to_string(), format!("Bearer {}", bare)),
    ]
}
