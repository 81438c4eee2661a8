use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NON_ALNUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap());

/// Identifier-safe form of the non-empty parts: lowercase, every run of
/// non-alphanumerics collapsed to one `-`, no leading or trailing `-`.
pub fn slugify(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    NON_ALNUM_RE
        .replace_all(&joined, "-")
        .trim_matches('-')
        .to_string()
}

/// Decode the handful of entities scraped markup usually carries.
fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Strip markup and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let stripped = TAG_RE.replace_all(s, " ");
    let decoded = decode_entities(&stripped);
    WS_RE.replace_all(&decoded, " ").trim().to_string()
}

/// Cleaned text, or `None` when nothing is left.
pub fn clean_opt(s: Option<&str>) -> Option<String> {
    s.map(clean_text).filter(|t| !t.is_empty())
}

/// First number in a price string: "$1,234.50" → 1234.5.
pub fn extract_price(text: &str) -> Option<f64> {
    PRICE_RE
        .find(text)
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
}

/// Syntactic check only: an absolute http(s) URL with a host.
pub fn is_valid_url(s: &str) -> bool {
    match Url::parse(s.trim()) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

/// Resolve `href` against `base`; already-absolute hrefs are returned as-is.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Ok(abs) = Url::parse(href) {
        return Some(abs.to_string());
    }
    Url::parse(base).ok()?.join(href).ok().map(|u| u.to_string())
}

/// Host of a URL without a leading `www.`.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.trim_start_matches("www.").to_lowercase())
}
