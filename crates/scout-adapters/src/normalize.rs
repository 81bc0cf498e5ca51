//! Maps one raw provider item onto the canonical [`Finding`]. Never fails:
//! every field has a fallback.

use chrono::{DateTime, Utc};
use scout_core::{Finding, RawItem, FALLBACK_PRICE, FALLBACK_TITLE, FALLBACK_URL};
use serde_json::Value as JsonValue;
use url::Url;

/// Ordered candidate keys for each canonical field; first non-empty wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap {
    pub title: &'static [&'static str],
    pub price: &'static [&'static str],
    pub url: &'static [&'static str],
}

pub const DEFAULT_FIELDS: FieldMap = FieldMap {
    title: &["title", "name", "product_title", "heading"],
    price: &["price", "extracted_price", "prices", "primary_offer", "offers"],
    url: &["link", "product_link", "url", "href", "redirect_link"],
};

const PRICE_KEYS: &[&str] = &["raw", "formatted", "display", "value", "extracted", "amount", "text"];
const PRICE_MAX_DEPTH: usize = 4;

const REDIRECT_PARAMS: &[&str] = &[
    "url",
    "q",
    "u",
    "dest",
    "destination",
    "redirect",
    "redirect_url",
    "target",
    "mpre",
    "adurl",
];
const REDIRECT_MAX_DEPTH: usize = 3;

pub fn normalize(raw: &RawItem, target: &str, source_label: &str) -> Finding {
    normalize_with(raw, &DEFAULT_FIELDS, target, source_label, Utc::now())
}

pub fn normalize_with(
    raw: &RawItem,
    fields: &FieldMap,
    target: &str,
    source_label: &str,
    discovered_at: DateTime<Utc>,
) -> Finding {
    let title = first_text(raw, fields.title).unwrap_or_else(|| FALLBACK_TITLE.to_string());
    let price = fields
        .price
        .iter()
        .find_map(|key| raw.get(*key).and_then(price_text))
        .unwrap_or_else(|| FALLBACK_PRICE.to_string());
    let url = first_text(raw, fields.url)
        .map(|link| unwrap_redirect(&link))
        .unwrap_or_else(|| FALLBACK_URL.to_string());

    Finding {
        target: target.to_string(),
        source_label: source_label.to_string(),
        title,
        price,
        url,
        discovered_at,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_text(raw: &RawItem, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| raw.get(*key).and_then(|v| v.as_str()).and_then(text_or_none))
}

/// Render a price that may be a bare scalar, a `{raw: ..}`-style object, a
/// `{from, to}` range, or a list of offers.
pub fn price_text(value: &JsonValue) -> Option<String> {
    price_text_at(value, 0)
}

fn price_text_at(value: &JsonValue, depth: usize) -> Option<String> {
    if depth > PRICE_MAX_DEPTH {
        return None;
    }
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => {
            if let Some(found) = PRICE_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| price_text_at(v, depth + 1)))
            {
                return Some(found);
            }
            let from = map.get("from").and_then(|v| price_text_at(v, depth + 1));
            let to = map.get("to").and_then(|v| price_text_at(v, depth + 1));
            match (from, to) {
                (Some(low), Some(high)) => Some(format!("{low} - {high}")),
                (Some(one), None) | (None, Some(one)) => Some(one),
                (None, None) => None,
            }
        }
        JsonValue::Array(items) => items.iter().find_map(|v| price_text_at(v, depth + 1)),
        JsonValue::Bool(_) | JsonValue::Null => None,
    }
}

/// Resolve tracking/redirect links to the listing they point at, then
/// canonicalize the result.
///
/// A link counts as a redirect wrapper when one of its query parameters holds
/// an absolute http(s) URL on a different host.
pub fn unwrap_redirect(url: &str) -> String {
    let mut current = url.trim().to_string();
    for _ in 0..REDIRECT_MAX_DEPTH {
        match embedded_destination(&current) {
            Some(next) => current = next,
            None => break,
        }
    }
    canonical_url(&current)
}

/// The archive's dedup key form of a link: parsed and re-serialized, so the
/// host is lower-cased and an empty path becomes `/`. Unparseable links are
/// kept as trimmed text.
pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

fn embedded_destination(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    parsed.query_pairs().find_map(|(key, value)| {
        if !REDIRECT_PARAMS.contains(&key.as_ref()) {
            return None;
        }
        let inner = Url::parse(value.trim()).ok()?;
        let inner_host = inner.host_str()?.to_ascii_lowercase();
        let is_web = matches!(inner.scheme(), "http" | "https");
        (is_web && inner_host != host).then(|| inner.to_string())
    })
}
