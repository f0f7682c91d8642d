//! Long-lived driven-browser runtime over the Chrome DevTools protocol.
//!
//! Single-session discipline: at most one browser process, one context and
//! one page. Starting a new session tears the old one down first; `close`
//! is idempotent and tolerates partially-initialized state.

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Serialize;
use shopscout_core::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;

pub const NAV_TIMEOUT: Duration = Duration::from_secs(30);
pub const OP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct NavOutcome {
    pub ok: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrollOutcome {
    pub ok: bool,
    pub url: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub ok: bool,
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Exactly one of `value` / `label` / `index` must be set.
#[derive(Debug, Clone, Default)]
pub struct SelectTarget {
    pub value: Option<String>,
    pub label: Option<String>,
    pub index: Option<u64>,
}

impl SelectTarget {
    pub fn validate(&self) -> Result<()> {
        let given =
            self.value.is_some() as u8 + self.label.is_some() as u8 + self.index.is_some() as u8;
        if given != 1 {
            return Err(Error::BadInput(
                "exactly one of value, label or index must be provided".to_string(),
            ));
        }
        Ok(())
    }
}

struct Session {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct DrivenBrowser {
    session: Mutex<Option<Session>>,
}

/// Embed a Rust string as a JS string literal.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

async fn with_timeout<T, F>(what: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(format!("{what} after {}ms", timeout.as_millis()))),
    }
}

fn cdp_err(e: impl std::fmt::Display) -> Error {
    Error::Generic(format!("browser: {e}"))
}

impl DrivenBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_started(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Launch a fresh browser, replacing any existing session.
    pub async fn start(
        &self,
        start_url: Option<&str>,
        headless: bool,
        timeout: Duration,
    ) -> Result<NavOutcome> {
        self.close().await;

        let session = with_timeout("browser start", timeout, async {
            let mut args = vec!["--disable-dev-shm-usage", "--disable-gpu"];
            if std::env::var("CI").is_ok() || std::env::var("NO_SANDBOX").is_ok() {
                args.push("--no-sandbox");
            }
            let mut builder = BrowserConfig::builder().args(args);
            if !headless {
                builder = builder.with_head();
            }
            let config = builder.build().map_err(cdp_err)?;
            let (browser, mut handler) = Browser::launch(config).await.map_err(cdp_err)?;

            // The CDP websocket handler must be polled for the session to
            // make progress; it ends when the process goes away.
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
                tracing::debug!("browser event loop exited");
            });

            let page = browser
                .new_page(start_url.unwrap_or("about:blank"))
                .await
                .map_err(cdp_err)?;
            if start_url.is_some() {
                let _ = page.wait_for_navigation().await;
            }
            Ok(Session {
                browser,
                page,
                handler_task,
            })
        })
        .await?;

        let url = current_url(&session.page).await;
        *self.session.lock().await = Some(session);
        Ok(NavOutcome { ok: true, url })
    }

    /// Navigate the current page. Fails with `NoSession` before `start`.
    pub async fn open(&self, url: &str, timeout: Duration) -> Result<NavOutcome> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        with_timeout("browser open", timeout, async {
            session.page.goto(url).await.map_err(cdp_err)?;
            let _ = session.page.wait_for_navigation().await;
            Ok(())
        })
        .await?;
        Ok(NavOutcome {
            ok: true,
            url: current_url(&session.page).await,
        })
    }

    pub async fn click(
        &self,
        selector: &str,
        wait_for_navigation: bool,
        timeout: Duration,
    ) -> Result<NavOutcome> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        with_timeout("browser click", timeout, async {
            let element = session
                .page
                .find_element(selector)
                .await
                .map_err(|e| Error::Generic(format!("selector {selector:?} not found: {e}")))?;
            element.click().await.map_err(cdp_err)?;
            if wait_for_navigation {
                let _ = session.page.wait_for_navigation().await;
            }
            Ok(())
        })
        .await?;
        Ok(NavOutcome {
            ok: true,
            url: current_url(&session.page).await,
        })
    }

    pub async fn type_text(
        &self,
        selector: &str,
        text: &str,
        append: bool,
        press_enter: bool,
        timeout: Duration,
    ) -> Result<NavOutcome> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        with_timeout("browser type", timeout, async {
            let element = session
                .page
                .find_element(selector)
                .await
                .map_err(|e| Error::Generic(format!("selector {selector:?} not found: {e}")))?;
            element.click().await.map_err(cdp_err)?;
            if !append {
                // Fill semantics: clear the field before typing.
                let js = format!(
                    "(() => {{ const el = document.querySelector({sel}); if (el) {{ el.value = ''; el.dispatchEvent(new Event('input', {{bubbles: true}})); }} }})()",
                    sel = js_str(selector)
                );
                session.page.evaluate(js).await.map_err(cdp_err)?;
            }
            element.type_str(text).await.map_err(cdp_err)?;
            if press_enter {
                element.press_key("Enter").await.map_err(cdp_err)?;
            }
            Ok(())
        })
        .await?;
        Ok(NavOutcome {
            ok: true,
            url: current_url(&session.page).await,
        })
    }

    pub async fn select_option(
        &self,
        selector: &str,
        target: &SelectTarget,
        timeout: Duration,
    ) -> Result<NavOutcome> {
        target.validate()?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        let picker = if let Some(value) = &target.value {
            format!("o.value === {}", js_str(value))
        } else if let Some(label) = &target.label {
            format!("o.label.trim() === {}", js_str(label))
        } else {
            format!("i === {}", target.index.unwrap_or(0))
        };
        let js = format!(
            "(() => {{
                const el = document.querySelector({sel});
                if (!el) return 'no_element';
                let hit = false;
                Array.from(el.options).forEach((o, i) => {{
                    if (!hit && ({picker})) {{ el.selectedIndex = i; hit = true; }}
                }});
                if (!hit) return 'no_option';
                el.dispatchEvent(new Event('change', {{bubbles: true}}));
                return 'ok';
            }})()",
            sel = js_str(selector)
        );
        let outcome: String = with_timeout("browser select", timeout, async {
            session
                .page
                .evaluate(js)
                .await
                .map_err(cdp_err)?
                .into_value()
                .map_err(cdp_err)
        })
        .await?;
        match outcome.as_str() {
            "ok" => Ok(NavOutcome {
                ok: true,
                url: current_url(&session.page).await,
            }),
            "no_element" => Err(Error::Generic(format!("selector {selector:?} not found"))),
            _ => Err(Error::Generic(format!(
                "no matching option in {selector:?}"
            ))),
        }
    }

    /// `mode` is "by" (relative) or "to" (absolute). Returns the resulting
    /// scroll position.
    pub async fn scroll(&self, mode: &str, x: f64, y: f64) -> Result<ScrollOutcome> {
        let call = match mode {
            "by" => "scrollBy",
            "to" => "scrollTo",
            other => {
                return Err(Error::BadInput(format!(
                    "scroll mode must be \"by\" or \"to\", got {other:?}"
                )))
            }
        };
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        let js = format!(
            "(() => {{ window.{call}({x}, {y}); return [window.scrollX, window.scrollY]; }})()"
        );
        let (sx, sy): (f64, f64) = with_timeout("browser scroll", OP_TIMEOUT, async {
            session
                .page
                .evaluate(js)
                .await
                .map_err(cdp_err)?
                .into_value()
                .map_err(cdp_err)
        })
        .await?;
        Ok(ScrollOutcome {
            ok: true,
            url: current_url(&session.page).await,
            x: sx,
            y: sy,
        })
    }

    /// Wait until the first match of `selector` is visible.
    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<NavOutcome> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        let js = format!(
            "(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const r = el.getBoundingClientRect();
                const s = getComputedStyle(el);
                return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
            }})()",
            sel = js_str(selector)
        );
        with_timeout("browser wait_for", timeout, async {
            loop {
                let visible: bool = session
                    .page
                    .evaluate(js.clone())
                    .await
                    .map_err(cdp_err)?
                    .into_value()
                    .unwrap_or(false);
                if visible {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await?;
        Ok(NavOutcome {
            ok: true,
            url: current_url(&session.page).await,
        })
    }

    pub async fn snapshot(&self, include_html: bool, max_text_chars: usize) -> Result<Snapshot> {
        let max_text_chars = max_text_chars.clamp(500, 500_000);
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::NoSession)?;
        let text: String = with_timeout("browser snapshot", OP_TIMEOUT, async {
            session
                .page
                .evaluate("document.body ? document.body.innerText : ''")
                .await
                .map_err(cdp_err)?
                .into_value()
                .map_err(cdp_err)
        })
        .await?;
        let html = if include_html {
            Some(
                session
                    .page
                    .content()
                    .await
                    .map_err(cdp_err)?,
            )
        } else {
            None
        };
        let title = session.page.get_title().await.unwrap_or(None);
        Ok(Snapshot {
            ok: true,
            url: current_url(&session.page).await,
            title,
            text: clean_snapshot_text(&text, max_text_chars),
            html,
        })
    }

    /// Tear down the session. Safe to call at any time, in any state.
    pub async fn close(&self) {
        let taken = self.session.lock().await.take();
        if let Some(mut session) = taken {
            if let Err(e) = session.browser.close().await {
                tracing::debug!(error = %e, "browser close failed (ignored)");
            }
            let _ = session.browser.wait().await;
            session.handler_task.abort();
        }
    }
}

async fn current_url(page: &Page) -> String {
    match page.url().await {
        Ok(Some(url)) => url,
        _ => "about:blank".to_string(),
    }
}

/// Snapshot text policy: trailing whitespace before newlines removed, runs
/// of 3+ newlines collapsed to 2, truncated on a char boundary.
pub fn clean_snapshot_text(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars * 4));
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run >= 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    let trimmed = out.trim_end_matches('\n');
    let mut result = String::new();
    for (n, ch) in trimmed.chars().enumerate() {
        if n >= max_chars {
            break;
        }
        result.push(ch);
    }
    result
}
