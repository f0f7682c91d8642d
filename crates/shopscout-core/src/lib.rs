use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    // Display must render as "HTTP <status>" so provider rate-limit
    // classification can match on the message.
    #[error("HTTP {0}")]
    Http(u16),
    #[error("blocked by anti-bot challenge")]
    BlockedByChallenge,
    #[error("no active session")]
    NoActiveSession,
    #[error("no browser session; call browser_start first")]
    NoSession,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("provider failed: {0}")]
    Provider(String),
    #[error("{0}")]
    Generic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for transient transport-ish failures that a caller may retry
    /// (or, mid-run, stop early on and keep partial results).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::NoActiveSession => true,
            Error::Http(status) => *status == 429 || *status >= 500,
            other => {
                let m = other.to_string().to_ascii_lowercase();
                m.contains("session not found")
                    || (m.contains("sse") && m.contains("not established"))
                    || m.contains("failed to fetch")
                    || m.contains("econnreset")
                    || m.contains("disconnected")
                    || m.contains("timed out")
                    || m.contains("mcp request timed")
            }
        }
    }
}

/// One normalized search hit. `url` is always absolute http/https.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Host of `url`, kept for display and blocklist checks.
    pub source: String,
}

/// Observability record: one entry per provider tried, in order,
/// including providers skipped because of an active cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAttempt {
    pub provider: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Name of the provider that actually produced `results`.
    pub provider: String,
    pub attempts: Vec<SearchAttempt>,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        region: Option<&str>,
    ) -> Result<Vec<SearchResult>>;
}

pub const AVAILABILITY_IN_STOCK: &str = "in_stock";
pub const AVAILABILITY_OUT_OF_STOCK: &str = "out_of_stock";
pub const AVAILABILITY_PREORDER: &str = "preorder";
pub const AVAILABILITY_LIMITED: &str = "limited";
pub const AVAILABILITY_UNAVAILABLE: &str = "unavailable";

/// Normalize an availability signal (schema.org URL, itemprop value, or
/// free text) into the small closed vocabulary, falling back to a
/// lowercased snake_case rendition of the input.
pub fn normalize_availability(raw: &str) -> String {
    let squashed: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if squashed.contains("instock") {
        return AVAILABILITY_IN_STOCK.to_string();
    }
    if squashed.contains("outofstock") || squashed.contains("soldout") {
        return AVAILABILITY_OUT_OF_STOCK.to_string();
    }
    if squashed.contains("preorder") || squashed.contains("presale") || squashed.contains("backorder") {
        return AVAILABILITY_PREORDER.to_string();
    }
    if squashed.contains("limited") {
        return AVAILABILITY_LIMITED.to_string();
    }
    if squashed.contains("unavailable") || squashed.contains("discontinued") {
        return AVAILABILITY_UNAVAILABLE.to_string();
    }
    let mut out = String::new();
    let mut last_us = true;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_us = false;
        } else if !last_us {
            out.push('_');
            last_us = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Normalized product record produced by the extractor. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCandidate {
    pub url: String,
    pub source: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub key_features: Vec<String>,
    pub images: Vec<String>,
    pub specs: BTreeMap<String, String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub availability: Option<String>,
    /// In [0, 1], two decimal places.
    pub confidence: f64,
}

impl ProductCandidate {
    pub fn empty(url: impl Into<String>) -> Self {
        let url = url.into();
        let source = host_of(&url).unwrap_or_else(|| url.clone());
        Self {
            url,
            source,
            name: None,
            brand: None,
            category: None,
            key_features: Vec::new(),
            images: Vec::new(),
            specs: BTreeMap::new(),
            price: None,
            currency: None,
            availability: None,
            confidence: 0.0,
        }
    }
}

/// Host portion of an absolute URL, without a leading `www.`.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?.trim();
    if host.is_empty() {
        return None;
    }
    let host = host.strip_prefix("www.").unwrap_or(host);
    Some(host.to_ascii_lowercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub name: String,
    pub url: String,
    pub price: f64,
    pub currency: String,
    pub source: String,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Product shape accepted by the comparison engine. Looser than
/// `ProductCandidate`: only a name is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareProduct {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub key_features: Vec<String>,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
    #[serde(default)]
    pub availability: Option<String>,
}

impl From<&ProductCandidate> for CompareProduct {
    fn from(p: &ProductCandidate) -> Self {
        Self {
            name: p.name.clone().unwrap_or_else(|| p.source.clone()),
            price: p.price,
            currency: p.currency.clone(),
            brand: p.brand.clone(),
            key_features: p.key_features.clone(),
            specs: p.specs.clone(),
            availability: p.availability.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompareCriteria {
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub use_case: String,
    #[serde(default)]
    pub preferences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntry {
    pub name: String,
    /// Integer in [0, 100].
    pub score: u32,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub reason: String,
}

/// Constraints parsed out of the user's free-form prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub region: String,
}

/// One display-ready research result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductOption {
    pub rank: usize,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub source: String,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub score: u32,
    pub why: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_renders_status_for_rate_limit_matching() {
        assert_eq!(Error::Http(429).to_string(), "HTTP 429");
        assert_eq!(Error::Http(403).to_string(), "HTTP 403");
    }

    #[test]
    fn retryable_covers_transport_failures() {
        assert!(Error::Timeout("fetch".into()).is_retryable());
        assert!(Error::NoActiveSession.is_retryable());
        assert!(Error::Generic("session not found".into()).is_retryable());
        assert!(Error::Generic("MCP request timed out after 60s".into()).is_retryable());
        assert!(Error::Generic("read: ECONNRESET".into()).is_retryable());
        assert!(!Error::BadInput("missing url".into()).is_retryable());
        assert!(!Error::Http(404).is_retryable());
    }

    #[test]
    fn availability_normalizes_schema_org_urls() {
        assert_eq!(
            normalize_availability("https://schema.org/InStock"),
            AVAILABILITY_IN_STOCK
        );
        assert_eq!(
            normalize_availability("http://schema.org/OutOfStock"),
            AVAILABILITY_OUT_OF_STOCK
        );
        assert_eq!(normalize_availability("PreOrder"), AVAILABILITY_PREORDER);
        assert_eq!(
            normalize_availability("Currently Unavailable"),
            AVAILABILITY_UNAVAILABLE
        );
        assert_eq!(normalize_availability("Ships Soon"), "ships_soon");
    }

    #[test]
    fn host_of_strips_www_and_path() {
        assert_eq!(
            host_of("https://www.example.com/p/1?q=2").as_deref(),
            Some("example.com")
        );
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn cart_item_serializes_image_url_in_camel_case() {
        let item = CartItem {
            id: "i1".into(),
            name: "a".into(),
            url: "https://example.com/a".into(),
            price: 1.0,
            currency: "USD".into(),
            source: "example.com".into(),
            image_url: Some("https://example.com/a.jpg".into()),
            category: None,
        };
        let v = serde_json::to_value(&item).unwrap();
        assert!(v.get("imageUrl").is_some());
        assert!(v.get("image_url").is_none());
    }
}
