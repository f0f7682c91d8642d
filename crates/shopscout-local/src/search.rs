//! Web search with provider fallback and rate-limit cooldown.
//!
//! Provider order: DDG HTML → DDG Lite (shared cooldown pool) → Bing HTML
//! (independent pool) → synthetic merchant links (never fails). Every
//! provider tried gets one `SearchAttempt` entry, including providers
//! skipped because their pool is cooling down.

use crate::{DESKTOP_USER_AGENT, SEARCH_TIMEOUT};
use html_scraper::{Html, Selector};
use shopscout_core::{host_of, Error, Result, SearchAttempt, SearchOutcome, SearchResult};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const COOLDOWN: Duration = Duration::from_secs(60);
const SKIPPED_RATE_LIMITED: &str = "skipped (rate-limited)";

/// Hosts never surfaced as search results: the engines themselves,
/// ad/tracking networks, and a small explicit blocklist.
fn blocked_host(host: &str) -> bool {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(
            r"(?i)duckduckgo\.com$|bing\.com$|doubleclick|googleadservices|googleads|taboola|outbrain|coldest\.com",
        )
        .expect("static regex")
    });
    re.is_match(host)
}

/// A 403/429 (or an equivalent message) from a provider triggers a pool
/// cooldown rather than being retried.
pub fn is_rate_limited(err: &Error) -> bool {
    match err {
        Error::Http(status) => *status == 403 || *status == 429,
        other => {
            static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
            let re = PATTERN.get_or_init(|| {
                regex::Regex::new(r"(?i)HTTP 403|HTTP 429|rate.?limit|too many requests")
                    .expect("static regex")
            });
            re.is_match(&other.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPool {
    Ddg,
    Bing,
}

/// Per-pool "blocked until" timestamps. Only ever written forward.
#[derive(Debug, Default)]
struct Cooldowns {
    ddg_until: Option<Instant>,
    bing_until: Option<Instant>,
}

impl Cooldowns {
    fn slot(&mut self, pool: CooldownPool) -> &mut Option<Instant> {
        match pool {
            CooldownPool::Ddg => &mut self.ddg_until,
            CooldownPool::Bing => &mut self.bing_until,
        }
    }

    fn cooling(&self, pool: CooldownPool, now: Instant) -> bool {
        let until = match pool {
            CooldownPool::Ddg => self.ddg_until,
            CooldownPool::Bing => self.bing_until,
        };
        until.is_some_and(|t| now < t)
    }

    fn block(&mut self, pool: CooldownPool, until: Instant) {
        let slot = self.slot(pool);
        // Monotonic: never move a cooldown backwards.
        if slot.is_none_or(|t| t < until) {
            *slot = Some(until);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveProvider {
    DdgHtml,
    DdgLite,
    BingHtml,
}

impl LiveProvider {
    fn name(self) -> &'static str {
        match self {
            Self::DdgHtml => "ddg_html",
            Self::DdgLite => "ddg_lite",
            Self::BingHtml => "bing_html",
        }
    }

    fn pool(self) -> CooldownPool {
        match self {
            Self::DdgHtml | Self::DdgLite => CooldownPool::Ddg,
            Self::BingHtml => CooldownPool::Bing,
        }
    }
}

pub struct SearchEngine {
    client: reqwest::Client,
    cooldowns: Mutex<Cooldowns>,
    ddg_html_endpoint: String,
    ddg_lite_endpoint: String,
    bing_endpoint: String,
}

fn endpoint_from_env(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl SearchEngine {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoints(
            client,
            endpoint_from_env("SHOPSCOUT_DDG_ENDPOINT", "https://html.duckduckgo.com/html/"),
            endpoint_from_env(
                "SHOPSCOUT_DDG_LITE_ENDPOINT",
                "https://lite.duckduckgo.com/lite/",
            ),
            endpoint_from_env("SHOPSCOUT_BING_ENDPOINT", "https://www.bing.com/search"),
        )
    }

    pub fn with_endpoints(
        client: reqwest::Client,
        ddg_html_endpoint: String,
        ddg_lite_endpoint: String,
        bing_endpoint: String,
    ) -> Self {
        Self {
            client,
            cooldowns: Mutex::new(Cooldowns::default()),
            ddg_html_endpoint,
            ddg_lite_endpoint,
            bing_endpoint,
        }
    }

    fn cooldowns_lock(&self) -> std::sync::MutexGuard<'_, Cooldowns> {
        self.cooldowns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a pool on cooldown. Public so callers (and tests) can seed a
    /// known rate-limited state.
    pub fn block_pool_for(&self, pool: CooldownPool, duration: Duration) {
        self.cooldowns_lock().block(pool, Instant::now() + duration);
    }

    pub fn pool_cooling(&self, pool: CooldownPool) -> bool {
        self.cooldowns_lock().cooling(pool, Instant::now())
    }

    /// Run the fallback chain. Never fails overall: the merchant-link
    /// synthesizer always produces results.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        region: Option<&str>,
    ) -> SearchOutcome {
        let max_results = max_results.clamp(1, 20);
        let mut attempts: Vec<SearchAttempt> = Vec::new();

        for provider in [
            LiveProvider::DdgHtml,
            LiveProvider::DdgLite,
            LiveProvider::BingHtml,
        ] {
            if self.pool_cooling(provider.pool()) {
                attempts.push(SearchAttempt {
                    provider: provider.name().to_string(),
                    ok: false,
                    count: None,
                    error: Some(SKIPPED_RATE_LIMITED.to_string()),
                });
                continue;
            }
            match self.run_provider(provider, query, region).await {
                Ok(results) if !results.is_empty() => {
                    let results: Vec<SearchResult> =
                        results.into_iter().take(max_results).collect();
                    attempts.push(SearchAttempt {
                        provider: provider.name().to_string(),
                        ok: true,
                        count: Some(results.len()),
                        error: None,
                    });
                    return SearchOutcome {
                        results,
                        provider: provider.name().to_string(),
                        attempts,
                    };
                }
                Ok(_) => {
                    attempts.push(SearchAttempt {
                        provider: provider.name().to_string(),
                        ok: true,
                        count: Some(0),
                        error: None,
                    });
                }
                Err(e) => {
                    if is_rate_limited(&e) {
                        tracing::warn!(provider = provider.name(), error = %e, "search provider rate-limited; cooling pool");
                        self.block_pool_for(provider.pool(), COOLDOWN);
                    } else {
                        tracing::debug!(provider = provider.name(), error = %e, "search provider failed");
                    }
                    attempts.push(SearchAttempt {
                        provider: provider.name().to_string(),
                        ok: false,
                        count: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let results: Vec<SearchResult> =
            merchant_links(query).into_iter().take(max_results).collect();
        attempts.push(SearchAttempt {
            provider: "merchant_links".to_string(),
            ok: true,
            count: Some(results.len()),
            error: None,
        });
        SearchOutcome {
            results,
            provider: "merchant_links".to_string(),
            attempts,
        }
    }

    async fn run_provider(
        &self,
        provider: LiveProvider,
        query: &str,
        region: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let mut req = match provider {
            LiveProvider::DdgHtml => self
                .client
                .get(&self.ddg_html_endpoint)
                .query(&[("q", query)]),
            LiveProvider::DdgLite => self
                .client
                .get(&self.ddg_lite_endpoint)
                .query(&[("q", query)]),
            LiveProvider::BingHtml => {
                self.client.get(&self.bing_endpoint).query(&[("q", query)])
            }
        };
        match provider {
            LiveProvider::DdgHtml | LiveProvider::DdgLite => {
                if let Some(r) = region {
                    req = req.query(&[("kl", r)]);
                }
            }
            LiveProvider::BingHtml => {
                // Bing takes a bare country code; regions look like "us-en".
                if let Some(cc) = region.and_then(|r| r.split('-').next()) {
                    req = req.query(&[("cc", cc)]);
                }
            }
        }

        let resp = req
            .header(reqwest::header::USER_AGENT, DESKTOP_USER_AGENT)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{} search", provider.name()))
                } else {
                    Error::Provider(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(status.as_u16()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        let parsed = match provider {
            LiveProvider::DdgHtml => parse_ddg_html(&body),
            LiveProvider::DdgLite => parse_ddg_lite(&body),
            LiveProvider::BingHtml => parse_bing_html(&body),
        };
        // Provider markup drifts; a generic anchor scan over the same body
        // recovers results when the dedicated cues stop matching.
        if parsed.is_empty() {
            return Ok(parse_generic_anchors(&body));
        }
        Ok(parsed)
    }
}

/// Collector enforcing the shared result rules: absolute http(s) URLs only,
/// DDG redirect unwrap, host blocklist, first-occurrence dedup.
#[derive(Default)]
struct ResultSink {
    seen: BTreeSet<String>,
    out: Vec<SearchResult>,
}

impl ResultSink {
    fn push(&mut self, title: &str, href: &str, snippet: Option<String>) {
        let title = normalize_ws(title);
        if title.is_empty() {
            return;
        }
        let Some(url) = normalize_result_url(href) else {
            return;
        };
        let Some(host) = host_of(&url) else { return };
        if blocked_host(&host) {
            return;
        }
        if !self.seen.insert(url.clone()) {
            return;
        }
        self.out.push(SearchResult {
            title,
            url,
            snippet: snippet.map(|s| normalize_ws(&s)).filter(|s| !s.is_empty()),
            source: host,
        });
    }
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Make a result href absolute and unwrap DDG's `/l/?uddg=<target>`
/// redirect indirection.
fn normalize_result_url(href: &str) -> Option<String> {
    let href = href.trim();
    // Protocol-relative links show up in DDG markup.
    let absolute = if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        href.to_string()
    };
    if !(absolute.starts_with("http://") || absolute.starts_with("https://")) {
        return None;
    }
    let parsed = url::Url::parse(&absolute).ok()?;
    let host = parsed.host_str().unwrap_or_default();
    if host.ends_with("duckduckgo.com") && parsed.path().starts_with("/l/") {
        if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
            let target = target.into_owned();
            if target.starts_with("http://") || target.starts_with("https://") {
                return Some(target);
            }
        }
        return None;
    }
    Some(parsed.to_string())
}

fn parse_ddg_html(body: &str) -> Vec<SearchResult> {
    let doc = Html::parse_document(body);
    let Ok(sel_result) = Selector::parse("div.result") else {
        return Vec::new();
    };
    let sel_link = Selector::parse("a.result__a").expect("static selector");
    let sel_snippet = Selector::parse("a.result__snippet").expect("static selector");

    let mut sink = ResultSink::default();
    for block in doc.select(&sel_result) {
        let Some(link) = block.select(&sel_link).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let title = link.text().collect::<Vec<_>>().join(" ");
        let snippet = block
            .select(&sel_snippet)
            .next()
            .map(|s| s.text().collect::<Vec<_>>().join(" "));
        sink.push(&title, href, snippet);
    }
    sink.out
}

fn parse_ddg_lite(body: &str) -> Vec<SearchResult> {
    let doc = Html::parse_document(body);
    let Ok(sel_link) = Selector::parse("a.result-link") else {
        return Vec::new();
    };
    let sel_snippet = Selector::parse("td.result-snippet").expect("static selector");

    // Lite markup is a bare table: anchors and snippet cells alternate, so
    // pair them by position.
    let snippets: Vec<String> = doc
        .select(&sel_snippet)
        .map(|s| s.text().collect::<Vec<_>>().join(" "))
        .collect();

    let mut sink = ResultSink::default();
    for (i, link) in doc.select(&sel_link).enumerate() {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let title = link.text().collect::<Vec<_>>().join(" ");
        sink.push(&title, href, snippets.get(i).cloned());
    }
    sink.out
}

fn parse_bing_html(body: &str) -> Vec<SearchResult> {
    let doc = Html::parse_document(body);
    let Ok(sel_block) = Selector::parse("li.b_algo") else {
        return Vec::new();
    };
    let sel_link = Selector::parse("h2 a").expect("static selector");
    let sel_caption = Selector::parse("div.b_caption p").expect("static selector");
    let sel_p = Selector::parse("p").expect("static selector");

    let mut sink = ResultSink::default();
    for block in doc.select(&sel_block) {
        let Some(link) = block.select(&sel_link).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let title = link.text().collect::<Vec<_>>().join(" ");
        let snippet = block
            .select(&sel_caption)
            .next()
            .or_else(|| block.select(&sel_p).next())
            .map(|s| s.text().collect::<Vec<_>>().join(" "));
        sink.push(&title, href, snippet);
    }
    sink.out
}

/// Last-chance parse: any absolute-ish anchor with enough visible text.
fn parse_generic_anchors(body: &str) -> Vec<SearchResult> {
    let doc = Html::parse_document(body);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut sink = ResultSink::default();
    for link in doc.select(&sel) {
        if sink.out.len() >= 20 {
            break;
        }
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let title = link.text().collect::<Vec<_>>().join(" ");
        if normalize_ws(&title).len() < 8 {
            continue;
        }
        sink.push(&title, href, None);
    }
    sink.out
}

#[async_trait::async_trait]
impl shopscout_core::SearchProvider for SearchEngine {
    fn name(&self) -> &'static str {
        "fallback_chain"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        region: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        // The chain never fails; the trait's error channel stays unused.
        Ok(SearchEngine::search(self, query, max_results, region)
            .await
            .results)
    }
}

const MERCHANT_SEEDS: &[(&str, &str)] = &[
    ("Amazon", "www.amazon.com"),
    ("Best Buy", "www.bestbuy.com"),
    ("Walmart", "www.walmart.com"),
    ("Target", "www.target.com"),
    ("Newegg", "www.newegg.com"),
    ("eBay", "www.ebay.com"),
];

/// Synthetic fallback: on-site search links for the big merchants. Always
/// succeeds, so the engine as a whole cannot fail.
pub fn merchant_links(query: &str) -> Vec<SearchResult> {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    MERCHANT_SEEDS
        .iter()
        .map(|(label, host)| {
            let url = format!("https://{host}/search?q={encoded}");
            SearchResult {
                title: format!("{label} search results for \"{query}\""),
                snippet: Some(format!("Browse {label} listings matching your query.")),
                source: host.trim_start_matches("www.").to_string(),
                url,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DDG_HTML_FIXTURE: &str = r#"
    <html><body>
      <div class="result">
        <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fkb75&amp;rut=abc">Keychron K8 Pro</a>
        <a class="result__snippet">A wireless mechanical keyboard.</a>
      </div>
      <div class="result">
        <a class="result__a" href="https://shop.example.org/item/2">Another Board</a>
        <a class="result__snippet">Second result.</a>
      </div>
      <div class="result">
        <a class="result__a" href="https://duckduckgo.com/settings">Settings</a>
      </div>
      <div class="result">
        <a class="result__a" href="https://shop.example.org/item/2">Duplicate</a>
      </div>
    </body></html>
    "#;

    #[test]
    fn ddg_html_parse_unwraps_redirects_and_filters() {
        let results = parse_ddg_html(DDG_HTML_FIXTURE);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://example.com/kb75");
        assert_eq!(results[0].title, "Keychron K8 Pro");
        assert_eq!(
            results[0].snippet.as_deref(),
            Some("A wireless mechanical keyboard.")
        );
        assert_eq!(results[0].source, "example.com");
        // duckduckgo.com host dropped, duplicate URL dropped.
        assert_eq!(results[1].url, "https://shop.example.org/item/2");
    }

    #[test]
    fn bing_parse_reads_algo_blocks() {
        let body = r#"
        <ol id="b_results">
          <li class="b_algo">
            <h2><a href="https://example.com/a">Result A</a></h2>
            <div class="b_caption"><p>Snippet A</p></div>
          </li>
          <li class="b_algo">
            <h2><a href="https://www.bing.com/images">Bing Images</a></h2>
          </li>
        </ol>
        "#;
        let results = parse_bing_html(body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://example.com/a");
        assert_eq!(results[0].snippet.as_deref(), Some("Snippet A"));
    }

    #[test]
    fn ddg_lite_pairs_snippets_by_position() {
        let body = r#"
        <table>
          <tr><td><a class="result-link" href="https://example.com/x">X item</a></td></tr>
          <tr><td class="result-snippet">About X.</td></tr>
          <tr><td><a class="result-link" href="https://example.com/y">Y item</a></td></tr>
          <tr><td class="result-snippet">About Y.</td></tr>
        </table>
        "#;
        let results = parse_ddg_lite(body);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snippet.as_deref(), Some("About X."));
        assert_eq!(results[1].snippet.as_deref(), Some("About Y."));
    }

    #[test]
    fn generic_anchor_scan_skips_short_labels() {
        let body = r#"
        <html><body>
          <a href="https://example.com/long">A product with a descriptive label</a>
          <a href="https://example.com/nav">Nav</a>
        </body></html>
        "#;
        let results = parse_generic_anchors(body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://example.com/long");
    }

    #[test]
    fn ad_hosts_are_blocked() {
        assert!(blocked_host("ad.doubleclick.net"));
        assert!(blocked_host("duckduckgo.com"));
        assert!(blocked_host("sub.bing.com"));
        assert!(!blocked_host("example.com"));
        // Blocklist anchors on host end: a merchant containing "bing" inside
        // the name is fine.
        assert!(!blocked_host("bingo-store.com"));
    }

    #[test]
    fn rate_limit_detection_matches_status_and_message() {
        assert!(is_rate_limited(&Error::Http(403)));
        assert!(is_rate_limited(&Error::Http(429)));
        assert!(is_rate_limited(&Error::Provider(
            "upstream said: too many requests".into()
        )));
        assert!(is_rate_limited(&Error::Provider("Rate limit hit".into())));
        assert!(!is_rate_limited(&Error::Http(500)));
    }

    #[test]
    fn merchant_links_encode_the_query() {
        let links = merchant_links("mechanical keyboard");
        assert_eq!(links.len(), 6);
        assert!(links[0].url.contains("q=mechanical+keyboard"));
        assert_eq!(links[0].source, "amazon.com");
    }

    #[tokio::test]
    async fn search_with_all_pools_cooling_uses_merchant_fallback() {
        let engine = SearchEngine::with_endpoints(
            reqwest::Client::new(),
            "http://127.0.0.1:9/ddg".into(),
            "http://127.0.0.1:9/lite".into(),
            "http://127.0.0.1:9/bing".into(),
        );
        engine.block_pool_for(CooldownPool::Ddg, Duration::from_secs(30));
        engine.block_pool_for(CooldownPool::Bing, Duration::from_secs(30));

        let out = engine.search("mechanical keyboard", 3, Some("us-en")).await;
        assert_eq!(out.provider, "merchant_links");
        assert_eq!(out.results.len(), 3);
        assert_eq!(out.attempts.len(), 4);
        for skipped in &out.attempts[0..3] {
            assert!(!skipped.ok);
            assert_eq!(skipped.error.as_deref(), Some("skipped (rate-limited)"));
        }
        assert!(out.attempts[3].ok);
    }

    #[test]
    fn cooldowns_only_move_forward() {
        let mut c = Cooldowns::default();
        let now = Instant::now();
        c.block(CooldownPool::Ddg, now + Duration::from_secs(60));
        c.block(CooldownPool::Ddg, now + Duration::from_secs(10));
        assert!(c.cooling(CooldownPool::Ddg, now + Duration::from_secs(30)));
        assert!(!c.cooling(CooldownPool::Bing, now));
    }
}
