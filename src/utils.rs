use url::Url;

const PRIMARY_DASHBOARD_HOST: &str = "app.plaud.ai";
const SECONDARY_DASHBOARD_HOST: &str = "web.plaud.ai";
const DASHBOARD_HOST_PREFIX: &str = "app";

pub const DASHBOARD_URL: &str = "https://app.plaud.ai/";

fn is_safe_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Normalizes a filename for download usage by replacing restricted
/// characters and collapsing the gaps with underscores.
pub fn to_safe_filename(candidate: &str, fallback: &str) -> String {
    let source = if candidate.trim().is_empty() {
        fallback
    } else {
        candidate
    };

    let replaced: String = source
        .chars()
        .map(|c| if is_safe_name_char(c) { c } else { ' ' })
        .collect();
    let sanitized = replaced.split_whitespace().collect::<Vec<_>>().join("_");

    if sanitized.is_empty() {
        fallback.to_string()
    } else {
        sanitized
    }
}

pub fn to_safe_path_segment(segment: &str) -> String {
    let replaced: String = segment
        .chars()
        .map(|c| if is_safe_name_char(c) { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Sanitizes a relative download path: splits on either slash style,
/// sanitizes each segment and drops the empty ones.
pub fn to_safe_path(path: &str) -> String {
    path.split(['/', '\\'])
        .map(to_safe_path_segment)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lower-cases an extension candidate and strips a leading dot.
/// Empty input yields None so callers can fall through to inference.
pub fn normalize_extension(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.trim_start_matches('.').to_ascii_lowercase())
}

/// Sniffs a file extension out of a URL path: the last dot-suffix of the
/// final segment, 2-5 alphanumerics.
pub fn infer_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path().rsplit('/').next().unwrap_or("");
    let (_, extension) = last_segment.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();

    if (2..=5).contains(&extension.len())
        && extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Some(extension)
    } else {
        None
    }
}

/// True for the Plaud dashboard hosts the content side attaches to:
/// the two stable hosts plus regional `app-*` variants, https only.
pub fn is_supported_dashboard_url(candidate: &str) -> bool {
    let parsed = match Url::parse(candidate) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };

    if parsed.scheme() != "https" {
        return false;
    }

    let hostname = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    if hostname == PRIMARY_DASHBOARD_HOST || hostname == SECONDARY_DASHBOARD_HOST {
        return true;
    }

    hostname.ends_with(".plaud.ai")
        && hostname.starts_with(&format!("{}-", DASHBOARD_HOST_PREFIX))
}
