//! Research orchestrator: turn a free-form shopping prompt into a ranked
//! shortlist of product options.
//!
//! Pipeline: parse constraints → clean query → search (with one follow-up
//! when thin) → diversify hosts → visit candidates sequentially (HTTP
//! first, driven browser as fallback) → extract → gate → filter → rank.
//! Progress is published as single-line updates into an optional channel.

use crate::browser::DrivenBrowser;
use crate::compare::compare_products;
use crate::extract::extract_product;
use crate::fetch::PageFetcher;
use crate::search::SearchEngine;
use crate::textprep;
use regex::Regex;
use serde::Serialize;
use shopscout_core::{
    host_of, CompareCriteria, CompareProduct, Error, ProductCandidate, ProductOption,
    QueryConstraints, Result, AVAILABILITY_OUT_OF_STOCK,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MAX_OPTIONS: usize = 3;
pub const VISIT_BUDGET: usize = 15;
const SEARCH_RESULTS: usize = 10;
const DIVERSIFY_PASSES: usize = 3;
const DIVERSIFY_PER_HOST: usize = 2;
const CANDIDATE_CAP: usize = 20;
const LISTING_LINKS_MAX: usize = 8;
const LISTING_RECURSE_MAX: usize = 5;

const PREFERRED_RETAILERS: &[&str] = &[
    "amazon.com",
    "bestbuy.com",
    "walmart.com",
    "target.com",
    "newegg.com",
    "ebay.com",
];

const COOKIE_BANNER_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "#sp-cc-accept",
    "button#accept-cookies",
    "button.accept-all",
    "button[aria-label*='accept' i]",
];

const SEARCH_INPUT_SELECTORS: &[&str] = &[
    "input#twotabsearchtextbox",
    "input[type='search']",
    "input[name='q']",
    "input[name='k']",
    "input[name='searchTerm']",
    "input[placeholder*='search' i]",
];

#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub options: Vec<ProductOption>,
    pub constraints: QueryConstraints,
    pub query: String,
    pub updates: Vec<String>,
    pub visited: usize,
    pub pool_size: usize,
}

pub struct Researcher {
    search: Arc<SearchEngine>,
    fetcher: Arc<PageFetcher>,
    browser: Option<Arc<DrivenBrowser>>,
    updates: Option<mpsc::UnboundedSender<String>>,
    visit_budget: usize,
}

impl Researcher {
    pub fn new(search: Arc<SearchEngine>, fetcher: Arc<PageFetcher>) -> Self {
        Self {
            search,
            fetcher,
            browser: None,
            updates: None,
            visit_budget: VISIT_BUDGET,
        }
    }

    /// Attach a driven browser used as fallback when plain fetches fail.
    pub fn with_browser(mut self, browser: Arc<DrivenBrowser>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Stream single-line progress updates into `tx` as they happen.
    pub fn with_updates(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.updates = Some(tx);
        self
    }

    /// Override the per-request page-visit budget (mainly for tests).
    pub fn with_visit_budget(mut self, budget: usize) -> Self {
        self.visit_budget = budget.max(1);
        self
    }

    /// Run research with the transient-failure policy: an empty-handed
    /// retryable failure is retried twice (2 s then 3 s backoff).
    pub async fn research(&self, prompt: &str) -> Result<ResearchReport> {
        let backoffs = [Duration::from_secs(2), Duration::from_secs(3)];
        let mut attempt = 0usize;
        loop {
            match self.research_once(prompt).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() && attempt < backoffs.len() => {
                    tracing::warn!(error = %e, attempt, "research attempt failed; retrying");
                    tokio::time::sleep(backoffs[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn research_once(&self, prompt: &str) -> Result<ResearchReport> {
        let mut updates: Vec<String> = Vec::new();
        let constraints = parse_constraints(prompt);
        // Literal URLs become candidates, not query tokens.
        let prose = prompt_without_urls(prompt);
        let query = textprep::clean_query(&prose);
        let terms = textprep::query_terms(&prose);
        self.update(
            &mut updates,
            format!(
                "Parsed request: query \"{query}\", budget {:?} {:?}, region {}",
                constraints.max_budget, constraints.currency, constraints.region
            ),
        );

        // Explicit URLs in the prompt jump the queue.
        let explicit = extract_explicit_urls(prompt);
        let mut candidates: Vec<String> = explicit.clone();

        let outcome = self
            .search
            .search(&query, SEARCH_RESULTS, Some(&constraints.region))
            .await;
        self.update(
            &mut updates,
            format!(
                "Search via {} returned {} results",
                outcome.provider,
                outcome.results.len()
            ),
        );
        let mut found: Vec<String> = outcome.results.iter().map(|r| r.url.clone()).collect();

        // Thin result sets get one merchant-biased follow-up. Never an OR
        // query: those drift off topic.
        if found.len() < 5 {
            let follow_up = format!("{query} site:amazon.com");
            let extra = self
                .search
                .search(&follow_up, SEARCH_RESULTS, Some(&constraints.region))
                .await;
            self.update(
                &mut updates,
                format!(
                    "Follow-up search via {} added {} results",
                    extra.provider,
                    extra.results.len()
                ),
            );
            found.extend(extra.results.iter().map(|r| r.url.clone()));
        }

        candidates.extend(diversify_hosts(&found, &explicit));
        self.update(
            &mut updates,
            format!("Visiting up to {} candidate pages", candidates.len()),
        );

        let (pool, visited) = self
            .visit_candidates(&candidates, &terms, &query, &mut updates)
            .await?;
        self.update(
            &mut updates,
            format!("Extracted {} usable products from {visited} visits", pool.len()),
        );

        let filtered = final_filter(&pool, &constraints);
        let options = self.rank(&filtered, &constraints, &query, &terms);
        self.update(
            &mut updates,
            format!("Returning {} ranked options", options.len()),
        );

        Ok(ResearchReport {
            options,
            constraints,
            query,
            updates,
            visited,
            pool_size: pool.len(),
        })
    }

    async fn visit_candidates(
        &self,
        candidates: &[String],
        terms: &[String],
        query: &str,
        updates: &mut Vec<String>,
    ) -> Result<(Vec<ProductCandidate>, usize)> {
        let mut queue: VecDeque<(String, usize)> =
            candidates.iter().map(|u| (u.clone(), 0usize)).collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut pool: Vec<ProductCandidate> = Vec::new();
        let mut visits = 0usize;
        let mut browser_started = false;
        let mut last_error: Option<Error> = None;

        while let Some((url, depth)) = queue.pop_front() {
            if visits >= self.visit_budget || pool.len() >= CANDIDATE_CAP {
                break;
            }
            if !seen.insert(url.clone()) {
                continue;
            }
            visits += 1;

            match self.fetcher.fetch(&url).await {
                Ok(page) => {
                    let candidate = extract_product(&page.url, &page.html, &page.text);
                    if !is_weak(&candidate) && passes_relevance_gate(&candidate, terms) {
                        self.update(
                            updates,
                            format!(
                                "Found {} at {}",
                                candidate.name.as_deref().unwrap_or("product"),
                                candidate.source
                            ),
                        );
                        pool.push(candidate);
                        continue;
                    }
                    // Listing/review pages are mined for product links and
                    // recursed into exactly once.
                    if depth == 0 && is_listing_url(&url) {
                        let links = likely_product_links(&page.html, &page.url, terms);
                        let take = links.len().min(LISTING_RECURSE_MAX);
                        if take > 0 {
                            self.update(
                                updates,
                                format!("Scanning listing page, following {take} product links"),
                            );
                        }
                        // push_front in reverse keeps the mined order.
                        for link in links.into_iter().take(LISTING_RECURSE_MAX).rev() {
                            queue.push_front((link, depth + 1));
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "plain fetch failed");
                    if self.browser.is_some() && browser_fallback_worthy(&e) {
                        match self
                            .browser_visit(&url, query, &mut browser_started)
                            .await
                        {
                            Ok(Some(candidate)) => {
                                if !is_weak(&candidate) && passes_relevance_gate(&candidate, terms)
                                {
                                    self.update(
                                        updates,
                                        format!(
                                            "Browser recovered {} at {}",
                                            candidate.name.as_deref().unwrap_or("product"),
                                            candidate.source
                                        ),
                                    );
                                    pool.push(candidate);
                                }
                            }
                            Ok(None) => {}
                            Err(be) => {
                                tracing::debug!(url = %url, error = %be, "browser fallback failed");
                                last_error = Some(be);
                            }
                        }
                        continue;
                    }
                    if e.is_retryable() && !pool.is_empty() {
                        // Keep what we have rather than burning the rest of
                        // the budget on a flaky network.
                        self.update(
                            updates,
                            "Transient failure mid-run; returning partial results".to_string(),
                        );
                        break;
                    }
                    last_error = Some(e);
                }
            }
        }

        if pool.is_empty() {
            if let Some(e) = last_error.filter(|e| e.is_retryable()) {
                return Err(e);
            }
        }
        Ok((pool, visits))
    }

    /// Driven-browser fallback for pages that block or break plain fetch.
    async fn browser_visit(
        &self,
        url: &str,
        query: &str,
        browser_started: &mut bool,
    ) -> Result<Option<ProductCandidate>> {
        let Some(browser) = self.browser.as_ref() else {
            return Ok(None);
        };
        if !*browser_started {
            browser
                .start(None, true, crate::browser::NAV_TIMEOUT)
                .await?;
            *browser_started = true;
        }
        browser.open(url, crate::browser::NAV_TIMEOUT).await?;

        // Cookie banners block the interesting content; dismissal is
        // best-effort and failure is not interesting.
        for selector in COOKIE_BANNER_SELECTORS {
            if browser
                .click(selector, false, Duration::from_secs(3))
                .await
                .is_ok()
            {
                break;
            }
        }

        if is_listing_url(url) {
            for selector in SEARCH_INPUT_SELECTORS {
                if browser
                    .type_text(selector, query, false, true, Duration::from_secs(5))
                    .await
                    .is_ok()
                {
                    let _ = browser.wait_for("body", Duration::from_secs(5)).await;
                    break;
                }
            }
        }

        let _ = browser.scroll("by", 0.0, 900.0).await;
        let snapshot = browser.snapshot(true, 100_000).await?;
        let html = snapshot.html.as_deref().unwrap_or("");
        Ok(Some(extract_product(&snapshot.url, html, &snapshot.text)))
    }

    fn rank(
        &self,
        pool: &[ProductCandidate],
        constraints: &QueryConstraints,
        query: &str,
        terms: &[String],
    ) -> Vec<ProductOption> {
        if pool.is_empty() {
            return Vec::new();
        }
        let inputs: Vec<CompareProduct> = pool.iter().map(CompareProduct::from).collect();
        let criteria = CompareCriteria {
            max_budget: constraints.max_budget,
            currency: constraints.currency.clone(),
            use_case: query.to_string(),
            preferences: terms.to_vec(),
        };
        let ranked = compare_products(&inputs, &criteria);

        let mut by_name: BTreeMap<&str, &ProductCandidate> = BTreeMap::new();
        for p in pool {
            if let Some(name) = p.name.as_deref() {
                by_name.entry(name).or_insert(p);
            }
        }

        ranked
            .iter()
            .take(MAX_OPTIONS)
            .enumerate()
            .filter_map(|(i, entry)| {
                let p = by_name.get(entry.name.as_str())?;
                let why = if entry.pros.is_empty() {
                    entry.reason.clone()
                } else {
                    entry.pros.join("; ")
                };
                Some(ProductOption {
                    rank: i + 1,
                    name: entry.name.clone(),
                    url: p.url.clone(),
                    price: p.price,
                    currency: p.currency.clone(),
                    source: p.source.clone(),
                    image_url: p.images.first().cloned(),
                    category: p.category.clone(),
                    score: entry.score,
                    why,
                    description: sanitize_description(p),
                })
            })
            .collect()
    }

    fn update(&self, log: &mut Vec<String>, message: String) {
        tracing::info!(target: "research", "{message}");
        if let Some(tx) = &self.updates {
            let _ = tx.send(message.clone());
        }
        log.push(message);
    }
}

/// Errors worth escalating from plain fetch to the driven browser.
fn browser_fallback_worthy(e: &Error) -> bool {
    matches!(
        e,
        Error::BlockedByChallenge | Error::Http(_) | Error::Timeout(_)
    )
}

pub fn parse_constraints(prompt: &str) -> QueryConstraints {
    let lower = prompt.to_lowercase();

    // First match wins, in this order. Codes and words match as whole
    // tokens so "neural" never reads as EUR.
    static GBP: OnceLock<Regex> = OnceLock::new();
    static USD: OnceLock<Regex> = OnceLock::new();
    static EUR: OnceLock<Regex> = OnceLock::new();
    let gbp = GBP.get_or_init(|| Regex::new(r"£|\bgbp\b|\bpounds?\b").expect("static regex"));
    let usd = USD.get_or_init(|| Regex::new(r"\$|\busd\b|\bdollars?\b").expect("static regex"));
    let eur = EUR.get_or_init(|| Regex::new(r"€|\beur\b|\beuros?\b").expect("static regex"));
    let currency = if gbp.is_match(&lower) {
        Some("GBP".to_string())
    } else if usd.is_match(&lower) {
        Some("USD".to_string())
    } else if eur.is_match(&lower) {
        Some("EUR".to_string())
    } else {
        None
    };

    static KEYWORD: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();
    let keyword = KEYWORD.get_or_init(|| {
        Regex::new(
            r"\b(?:under|below|less\s+than|max(?:imum)?(?:\s+budget)?)\s*(?:of\s*)?[£$€]?\s*([0-9]+(?:\.[0-9]+)?)",
        )
        .expect("static regex")
    });
    let bare = BARE.get_or_init(|| {
        Regex::new(r"[£$€]\s*([0-9]+(?:\.[0-9]+)?)").expect("static regex")
    });
    let max_budget = keyword
        .captures(&lower)
        .or_else(|| bare.captures(&lower))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let region = match currency.as_deref() {
        Some("GBP") => "uk-en",
        Some("EUR") => "de-de",
        _ => "us-en",
    }
    .to_string();

    QueryConstraints {
        max_budget,
        currency,
        region,
    }
}

fn url_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("static regex"))
}

/// Literal URLs in the prompt, in order of appearance.
pub fn extract_explicit_urls(prompt: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    url_literal_re()
        .find_iter(prompt)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// The prompt with URL literals removed, for query cleaning.
pub fn prompt_without_urls(prompt: &str) -> String {
    url_literal_re().replace_all(prompt, " ").into_owned()
}

/// Search/category/review/guide pages: link containers, not products.
pub fn is_listing_url(url: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)(^|[/\-_.])(best|top|reviews?|guide|comparison|vs|category|blog|list)([/\-_.]|$)|under-|/s\?|searchpage|/sch([/?])|/p/pl|[?&](q|k|query|search|searchterm|keyword)=",
        )
        .expect("static regex")
    });
    re.is_match(url)
}

fn product_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)/dp/|/gp/product/|/product/|/products/|/shop/p/|/p/[a-z0-9][a-z0-9-]*|sku|item=|pid=|asin=|/ip/[0-9]|\.html$",
        )
        .expect("static regex")
    })
}

/// Amazon/Walmart-style ids: so unambiguous that no query-term overlap is
/// required when they sit on a preferred retailer host.
fn strong_product_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/dp/|/gp/product/|/ip/[0-9]|item=|asin=").expect("static regex")
    })
}

fn is_preferred_retailer(host: &str) -> bool {
    PREFERRED_RETAILERS
        .iter()
        .any(|r| host == *r || host.ends_with(&format!(".{r}")))
}

/// Scan a listing page for up to 8 likely product links.
pub fn likely_product_links(html: &str, base_url: &str, terms: &[String]) -> Vec<String> {
    use html_scraper::{Html, Selector};
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = url::Url::parse(base_url).ok();
    let base_host = host_of(base_url);

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        if out.len() >= LISTING_LINKS_MAX {
            break;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let absolute = if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(b) = &base {
            match b.join(href) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        } else {
            continue;
        };
        let Some(host) = host_of(&absolute) else {
            continue;
        };

        if is_listing_url(&absolute) {
            continue;
        }
        let producty = product_link_re().is_match(&absolute)
            || (Some(&host) == base_host.as_ref() && product_link_re().is_match(&absolute));
        if !producty {
            continue;
        }

        // Require query-term overlap in URL or anchor text, unless the link
        // is a strong product id on a preferred retailer.
        let anchor_text = el.text().collect::<Vec<_>>().join(" ").to_lowercase();
        let hay = format!("{} {anchor_text}", absolute.to_lowercase());
        let term_hit = terms.iter().any(|t| hay.contains(t.as_str()));
        let strong = is_preferred_retailer(&host) && strong_product_link_re().is_match(&absolute);
        if !term_hit && !strong {
            continue;
        }

        if seen.insert(absolute.clone()) {
            out.push(absolute);
        }
    }
    out
}

/// Round-robin across hosts (3 passes × 2 per host, cap 20), explicit URLs
/// excluded since they are already queued first.
pub fn diversify_hosts(urls: &[String], already_queued: &[String]) -> Vec<String> {
    let mut by_host: BTreeMap<String, VecDeque<String>> = BTreeMap::new();
    let mut host_order: Vec<String> = Vec::new();
    let queued: BTreeSet<&str> = already_queued.iter().map(String::as_str).collect();
    let mut seen = BTreeSet::new();

    for url in urls {
        if queued.contains(url.as_str()) || !seen.insert(url.clone()) {
            continue;
        }
        let host = host_of(url).unwrap_or_default();
        if !by_host.contains_key(&host) {
            host_order.push(host.clone());
        }
        by_host.entry(host).or_default().push_back(url.clone());
    }

    let mut out = Vec::new();
    for _ in 0..DIVERSIFY_PASSES {
        for host in &host_order {
            let Some(bucket) = by_host.get_mut(host) else {
                continue;
            };
            for _ in 0..DIVERSIFY_PER_HOST {
                if out.len() >= CANDIDATE_CAP {
                    return out;
                }
                match bucket.pop_front() {
                    Some(url) => out.push(url),
                    None => break,
                }
            }
        }
    }
    out
}

fn irrelevant_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)access denied|robot|captcha|404|not found|error|just a moment|page unavailable|are you human",
        )
        .expect("static regex")
    })
}

fn search_ui_boilerplate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)search results|sort by|filter by|refine by|browse all|showing results|items found|no results|did you mean",
        )
        .expect("static regex")
    })
}

/// A candidate too thin to accept from a plain fetch.
pub fn is_weak(p: &ProductCandidate) -> bool {
    let name_bad = match p.name.as_deref() {
        None => true,
        Some(name) => irrelevant_name_re().is_match(name),
    };
    name_bad || p.price.is_none() || p.confidence < 0.2 || is_listing_url(&p.url)
}

/// The relevance gate applied before a candidate joins the pool.
pub fn passes_relevance_gate(p: &ProductCandidate, terms: &[String]) -> bool {
    let Some(name) = p.name.as_deref() else {
        return false;
    };
    if irrelevant_name_re().is_match(name) {
        return false;
    }
    let feature_text = format!(
        "{} {}",
        p.category.as_deref().unwrap_or(""),
        p.key_features.join(" ")
    );
    if search_ui_boilerplate_re().is_match(&feature_text) {
        return false;
    }
    if p.confidence < 0.10 {
        return false;
    }
    if p.availability.as_deref() == Some(AVAILABILITY_OUT_OF_STOCK) {
        return false;
    }
    if terms.is_empty() {
        return true;
    }
    let hay = format!(
        "{} {} {} {}",
        name,
        p.category.as_deref().unwrap_or(""),
        p.key_features.join(" "),
        p.url
    )
    .to_lowercase();
    terms.iter().any(|t| hay.contains(t.as_str()))
}

/// Strict filter, then two fallback relaxations so a non-empty pool never
/// produces an empty answer.
pub fn final_filter(
    pool: &[ProductCandidate],
    constraints: &QueryConstraints,
) -> Vec<ProductCandidate> {
    let strict: Vec<ProductCandidate> = pool
        .iter()
        .filter(|p| {
            if let (Some(want), Some(have)) =
                (constraints.currency.as_deref(), p.currency.as_deref())
            {
                if want != have {
                    return false;
                }
            }
            if let (Some(budget), Some(price)) = (constraints.max_budget, p.price) {
                if price > budget {
                    return false;
                }
            }
            p.availability.as_deref() != Some(AVAILABILITY_OUT_OF_STOCK) && p.confidence >= 0.10
        })
        .cloned()
        .collect();
    if !strict.is_empty() {
        return strict;
    }

    let mut relaxed: Vec<ProductCandidate> = pool
        .iter()
        .filter(|p| p.confidence >= 0.08 && p.name.is_some())
        .cloned()
        .collect();
    if relaxed.is_empty() {
        relaxed = pool.iter().filter(|p| p.name.is_some()).cloned().collect();
    }
    relaxed.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    relaxed.truncate(MAX_OPTIONS);
    relaxed
}

fn sanitize_description(p: &ProductCandidate) -> String {
    let mut description = if p.key_features.is_empty() {
        format!(
            "{} from {}",
            p.name.as_deref().unwrap_or("Product"),
            p.source
        )
    } else {
        p.key_features.join(". ")
    };
    description = description.split_whitespace().collect::<Vec<_>>().join(" ");
    if description.chars().count() > 300 {
        description = description.chars().take(297).collect::<String>() + "...";
    }
    description
}
