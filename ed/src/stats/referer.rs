//! Referer normalization

use url::Url;

/// Referer with its query string and fragment removed
///
/// This is the key all statistics are aggregated and looked up under.
/// Returns `None` for an empty or unparseable referer.
pub fn normalize_referer(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = Url::parse(raw).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}
