//! Plain HTTP page acquisition: GET with a short timeout, anti-bot
//! challenge detection, and an HTML → readable-text reduction.

use crate::{DESKTOP_USER_AGENT, FETCH_TIMEOUT};
use regex::Regex;
use serde::Serialize;
use shopscout_core::{Error, Result};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub title: Option<String>,
    /// Raw body. Cleaning happens in the text reduction so embedded
    /// structured data (JSON-LD) stays available to the extractor.
    pub html: String,
    /// Block-level text reduction of the cleaned body.
    pub text: String,
}

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)enable javascript and cookies|verify you are human|checking your browser|access denied|request blocked",
        )
        .expect("static regex")
    })
}

/// True when a body looks like an anti-bot interstitial rather than content.
pub fn looks_blocked(body: &str) -> bool {
    challenge_re().is_match(body)
}

pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::BadInput(format!("url must be absolute http(s): {url}")));
        }

        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, DESKTOP_USER_AGENT)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("fetching {url}"))
                } else {
                    Error::Generic(format!("failed to fetch {url}: {e}"))
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(status.as_u16()));
        }
        let final_url = resp.url().to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Generic(format!("failed to read body of {url}: {e}")))?;

        if looks_blocked(&body) {
            return Err(Error::BlockedByChallenge);
        }

        let cleaned = clean_html(&body);
        Ok(FetchedPage {
            url: final_url,
            title: extract_title(&body),
            text: html_to_text(&cleaned),
            html: body,
        })
    }
}

/// Strip `<script>`, `<style>`, `<noscript>` and `<iframe>` blocks with
/// their contents. Unterminated blocks drop the tail, which is the safe
/// direction for text extraction.
pub fn clean_html(html: &str) -> String {
    fn strip_block(html: &str, tag: &str) -> String {
        let lower = html.to_ascii_lowercase();
        let open_pat = format!("<{tag}");
        let close_pat = format!("</{tag}");
        let mut out = String::with_capacity(html.len());
        let mut i = 0usize;
        while i < html.len() {
            let Some(start_rel) = lower[i..].find(&open_pat) else {
                out.push_str(&html[i..]);
                break;
            };
            let start = i + start_rel;
            out.push_str(&html[i..start]);

            let Some(close_rel) = lower[start..].find(&close_pat) else {
                break;
            };
            let close_start = start + close_rel;
            let Some(gt_rel) = lower[close_start..].find('>') else {
                break;
            };
            i = close_start + gt_rel + 1;
        }
        out
    }

    let s = strip_block(html, "script");
    let s = strip_block(&s, "style");
    let s = strip_block(&s, "noscript");
    strip_block(&s, "iframe")
}

/// Reduce cleaned HTML to readable text: newlines at block boundaries and
/// `<br>`, every other tag removed, entities decoded, whitespace collapsed,
/// runs of 3+ newlines squashed to 2.
pub fn html_to_text(html: &str) -> String {
    static BR: OnceLock<Regex> = OnceLock::new();
    static BLOCK_END: OnceLock<Regex> = OnceLock::new();
    static COMMENT: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    let br = BR.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"));
    let block_end = BLOCK_END.get_or_init(|| {
        Regex::new(r"(?i)</(?:p|div|section|article|header|footer|li|ul|ol|h[1-6]|tr|table)>")
            .expect("static regex")
    });
    let comment = COMMENT.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"));

    let s = comment.replace_all(html, " ");
    let s = br.replace_all(&s, "\n");
    let s = block_end.replace_all(&s, "\n");
    let s = tag.replace_all(&s, " ");
    let s = decode_entities(&s);

    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            // Collapse 3+ consecutive newlines down to a single blank line.
            if blank_run >= 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Contents of the first `<title>`, entity-decoded and whitespace-normalized.
pub fn extract_title(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"));
    let caps = re.captures(html)?;
    let raw = decode_entities(caps.get(1)?.as_str());
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// Decode the common named entities plus numeric references. Not a full
/// HTML5 entity table; covers what product pages actually emit.
pub fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        // Bounded, char-safe scan for the terminating semicolon.
        let semi = tail
            .char_indices()
            .take(13)
            .find(|(_, c)| *c == ';')
            .map(|(i, _)| i);
        let Some(semi) = semi else {
            out.push('&');
            rest = &rest[amp + 1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded: Option<String> = match entity {
            "amp" => Some("&".into()),
            "lt" => Some("<".into()),
            "gt" => Some(">".into()),
            "quot" => Some("\"".into()),
            "apos" => Some("'".into()),
            "nbsp" => Some(" ".into()),
            "mdash" => Some("\u{2014}".into()),
            "ndash" => Some("\u{2013}".into()),
            "hellip" => Some("\u{2026}".into()),
            "trade" => Some("\u{2122}".into()),
            "reg" => Some("\u{00AE}".into()),
            "copy" => Some("\u{00A9}".into()),
            "pound" => Some("\u{00A3}".into()),
            "euro" => Some("\u{20AC}".into()),
            "dollar" => Some("$".into()),
            _ => {
                if let Some(num) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(num, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .map(|c| c.to_string())
                } else if let Some(num) = entity.strip_prefix('#') {
                    num.parse::<u32>()
                        .ok()
                        .and_then(char::from_u32)
                        .map(|c| c.to_string())
                } else {
                    None
                }
            }
        };
        match decoded {
            Some(d) => {
                out.push_str(&d);
                rest = &rest[amp + semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[amp + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}
