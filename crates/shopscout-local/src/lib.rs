//! Concrete pipeline for the shopscout runtime: search with fallback,
//! page fetch, product extraction, comparison, cart, the driven browser
//! and the research orchestrator.

use std::time::Duration;

pub mod browser;
pub mod cart;
pub mod compare;
pub mod extract;
pub mod fetch;
pub mod research;
pub mod search;
pub mod textprep;

/// Fixed desktop UA for search and page fetches. Mobile markup differs
/// enough to break the parsers, so this stays pinned.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(12);

/// Shared HTTP client: redirects followed, cookies off, no global timeout
/// (per-request timeouts are applied at call sites).
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(DESKTOP_USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
