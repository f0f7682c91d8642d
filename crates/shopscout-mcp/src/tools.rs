//! Declarative tool registry and dispatcher.
//!
//! Each tool carries a name, description, object-shaped input schema and a
//! handler over the shared [`Toolbox`]. Dispatch validates required inputs
//! before invoking; results are wrapped in the MCP content envelope
//! (`{content:[{type:"text",text:<pretty JSON>}]}`).

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use shopscout_core::{CompareCriteria, CompareProduct, Error, Result};
use shopscout_local::browser::{DrivenBrowser, SelectTarget, NAV_TIMEOUT, OP_TIMEOUT};
use shopscout_local::cart::{Cart, NewCartItem};
use shopscout_local::compare::compare_products;
use shopscout_local::extract::extract_product;
use shopscout_local::fetch::PageFetcher;
use shopscout_local::search::SearchEngine;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared runtime state handed to every tool handler. One per server
/// process; tests instantiate isolated copies.
pub struct Toolbox {
    pub search: Arc<SearchEngine>,
    pub fetcher: Arc<PageFetcher>,
    pub cart: Mutex<Cart>,
    pub browser: Arc<DrivenBrowser>,
}

impl Toolbox {
    pub fn new() -> Arc<Self> {
        let client = shopscout_local::http_client();
        Arc::new(Self {
            search: Arc::new(SearchEngine::new(client.clone())),
            fetcher: Arc::new(PageFetcher::new(client)),
            cart: Mutex::new(Cart::new()),
            browser: Arc::new(DrivenBrowser::new()),
        })
    }
}

type Handler = Arc<dyn Fn(Arc<Toolbox>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    handler: Handler,
}

pub struct ToolRegistry {
    tools: Vec<ToolDef>,
    by_name: BTreeMap<&'static str, usize>,
}

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Toolbox>, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |toolbox, args| -> BoxFuture<'static, Result<Value>> {
        Box::pin(f(toolbox, args))
    })
}

// ---- Argument extraction ----

fn req_str(args: &Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(Error::BadInput(format!("missing required field: {key}"))),
    }
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

fn req_f64(args: &Value, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| Error::BadInput(format!("missing required field: {key}")))
}

fn bool_or(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn f64_or(args: &Value, key: &str, default: f64) -> f64 {
    args.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn int_in_range(args: &Value, key: &str, lo: i64, hi: i64, default: i64) -> Result<i64> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| Error::BadInput(format!("{key} must be an integer")))?;
            if !(lo..=hi).contains(&n) {
                return Err(Error::BadInput(format!(
                    "{key} must be in [{lo}, {hi}], got {n}"
                )));
            }
            Ok(n)
        }
    }
}

fn timeout_ms(args: &Value, lo: i64, hi: i64, default: i64) -> Result<Duration> {
    let ms = int_in_range(args, "timeout_ms", lo, hi, default)?;
    Ok(Duration::from_millis(ms as u64))
}

fn abs_url(args: &Value, key: &str) -> Result<String> {
    let url = req_str(args, key)?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::BadInput(format!(
            "{key} must be an absolute http(s) URL"
        )));
    }
    Ok(url)
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| Error::Generic(e.to_string()))
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, def: ToolDef) -> Result<()> {
        if self.by_name.contains_key(def.name) {
            return Err(Error::BadInput(format!(
                "duplicate tool name: {}",
                def.name
            )));
        }
        self.by_name.insert(def.name, self.tools.len());
        self.tools.push(def);
        Ok(())
    }

    /// Tool descriptors in registration order.
    pub fn list(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate inputs, run the handler, wrap the payload in the content
    /// envelope.
    pub async fn call(&self, toolbox: Arc<Toolbox>, name: &str, args: Value) -> Result<Value> {
        let Some(&idx) = self.by_name.get(name) else {
            return Err(Error::UnknownTool(name.to_string()));
        };
        let tool = &self.tools[idx];
        validate_required(&tool.input_schema, &args)?;
        let payload = (tool.handler)(toolbox, args).await?;
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|e| Error::Generic(e.to_string()))?;
        Ok(json!({
            "content": [{ "type": "text", "text": text }]
        }))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Required fields must be present, non-null, and non-empty when strings.
fn validate_required(schema: &Value, args: &Value) -> Result<()> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let mut missing: Vec<String> = Vec::new();
    for key in required.iter().filter_map(|k| k.as_str()) {
        let bad = match args.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if bad {
            missing.push(key.to_string());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::BadInput(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Build the full default tool table.
pub fn default_registry() -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    // Registration of the static table cannot collide; a panic here is a
    // programming error caught by the registry tests.
    for def in default_tools() {
        reg.register(def).expect("static tool table has unique names");
    }
    reg
}

fn default_tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "web_search",
            description: "Search the web for product pages with provider fallback",
            input_schema: object_schema(
                json!({
                    "query": { "type": "string" },
                    "max_results": { "type": "integer", "minimum": 1, "maximum": 20, "default": 5 },
                    "region": { "type": ["string", "null"], "default": null },
                }),
                &["query"],
            ),
            handler: handler(|tb, args| async move {
                let query = req_str(&args, "query")?;
                let max_results = int_in_range(&args, "max_results", 1, 20, 5)? as usize;
                let region = opt_str(&args, "region");
                let outcome = tb.search.search(&query, max_results, region.as_deref()).await;
                to_json(&outcome)
            }),
        },
        ToolDef {
            name: "open_page",
            description: "Fetch a page over plain HTTP and reduce it to title/text",
            input_schema: object_schema(json!({ "url": { "type": "string" } }), &["url"]),
            handler: handler(|tb, args| async move {
                let url = abs_url(&args, "url")?;
                let page = tb.fetcher.fetch(&url).await?;
                to_json(&page)
            }),
        },
        ToolDef {
            name: "extract_product",
            description: "Extract a normalized product record from page HTML and text",
            input_schema: object_schema(
                json!({
                    "url": { "type": "string" },
                    "html": { "type": "string" },
                    "text": { "type": "string", "default": "" },
                }),
                &["url", "html"],
            ),
            handler: handler(|_tb, args| async move {
                let url = abs_url(&args, "url")?;
                let html = req_str(&args, "html")?;
                let text = opt_str(&args, "text").unwrap_or_default();
                to_json(&extract_product(&url, &html, &text))
            }),
        },
        ToolDef {
            name: "compare_products",
            description: "Score and rank products against budget and preferences",
            input_schema: object_schema(
                json!({
                    "products": { "type": "array", "minItems": 1 },
                    "criteria": { "type": "object" },
                }),
                &["products"],
            ),
            handler: handler(|_tb, args| async move {
                let products: Vec<CompareProduct> = args
                    .get("products")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| Error::BadInput(format!("invalid products: {e}")))?
                    .unwrap_or_default();
                if products.is_empty() {
                    return Err(Error::BadInput("products must be a non-empty array".into()));
                }
                let criteria: CompareCriteria = args
                    .get("criteria")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| Error::BadInput(format!("invalid criteria: {e}")))?
                    .unwrap_or_default();
                to_json(&json!({ "ranked": compare_products(&products, &criteria) }))
            }),
        },
        ToolDef {
            name: "browser_start",
            description: "Launch the driven browser session (replaces any existing one)",
            input_schema: object_schema(
                json!({
                    "start_url": { "type": ["string", "null"], "default": null },
                    "headless": { "type": "boolean", "default": true },
                    "timeout_ms": { "type": "integer", "minimum": 1000, "maximum": 120000, "default": 30000 },
                }),
                &[],
            ),
            handler: handler(|tb, args| async move {
                let start_url = opt_str(&args, "start_url");
                let headless = bool_or(&args, "headless", true);
                let timeout = timeout_ms(&args, 1000, 120_000, NAV_TIMEOUT.as_millis() as i64)?;
                let out = tb.browser.start(start_url.as_deref(), headless, timeout).await?;
                to_json(&out)
            }),
        },
        ToolDef {
            name: "browser_open",
            description: "Navigate the driven browser to a URL",
            input_schema: object_schema(
                json!({
                    "url": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 1000, "maximum": 120000, "default": 30000 },
                }),
                &["url"],
            ),
            handler: handler(|tb, args| async move {
                let url = abs_url(&args, "url")?;
                let timeout = timeout_ms(&args, 1000, 120_000, NAV_TIMEOUT.as_millis() as i64)?;
                to_json(&tb.browser.open(&url, timeout).await?)
            }),
        },
        ToolDef {
            name: "browser_click",
            description: "Click the first element matching a CSS selector",
            input_schema: object_schema(
                json!({
                    "selector": { "type": "string" },
                    "wait_for_navigation": { "type": "boolean", "default": false },
                    "timeout_ms": { "type": "integer", "minimum": 500, "maximum": 120000, "default": 15000 },
                }),
                &["selector"],
            ),
            handler: handler(|tb, args| async move {
                let selector = req_str(&args, "selector")?;
                let wait = bool_or(&args, "wait_for_navigation", false);
                let timeout = timeout_ms(&args, 500, 120_000, OP_TIMEOUT.as_millis() as i64)?;
                to_json(&tb.browser.click(&selector, wait, timeout).await?)
            }),
        },
        ToolDef {
            name: "browser_type",
            description: "Type into the first element matching a CSS selector",
            input_schema: object_schema(
                json!({
                    "selector": { "type": "string" },
                    "text": { "type": "string" },
                    "append": { "type": "boolean", "default": false },
                    "press_enter": { "type": "boolean", "default": false },
                    "timeout_ms": { "type": "integer", "minimum": 500, "maximum": 120000, "default": 15000 },
                }),
                &["selector", "text"],
            ),
            handler: handler(|tb, args| async move {
                let selector = req_str(&args, "selector")?;
                let text = req_str(&args, "text")?;
                let append = bool_or(&args, "append", false);
                let press_enter = bool_or(&args, "press_enter", false);
                let timeout = timeout_ms(&args, 500, 120_000, OP_TIMEOUT.as_millis() as i64)?;
                to_json(
                    &tb.browser
                        .type_text(&selector, &text, append, press_enter, timeout)
                        .await?,
                )
            }),
        },
        ToolDef {
            name: "browser_select",
            description: "Select an option by value, label or index (exactly one)",
            input_schema: object_schema(
                json!({
                    "selector": { "type": "string" },
                    "value": { "type": ["string", "null"], "default": null },
                    "label": { "type": ["string", "null"], "default": null },
                    "index": { "type": ["integer", "null"], "default": null },
                }),
                &["selector"],
            ),
            handler: handler(|tb, args| async move {
                let selector = req_str(&args, "selector")?;
                let target = SelectTarget {
                    value: opt_str(&args, "value"),
                    label: opt_str(&args, "label"),
                    index: args.get("index").and_then(|v| v.as_u64()),
                };
                to_json(&tb.browser.select_option(&selector, &target, OP_TIMEOUT).await?)
            }),
        },
        ToolDef {
            name: "browser_scroll",
            description: "Scroll the page by a delta or to a position",
            input_schema: object_schema(
                json!({
                    "mode": { "type": "string", "enum": ["by", "to"], "default": "by" },
                    "x": { "type": "number", "default": 0 },
                    "y": { "type": "number", "default": 700 },
                }),
                &[],
            ),
            handler: handler(|tb, args| async move {
                let mode = opt_str(&args, "mode").unwrap_or_else(|| "by".to_string());
                let x = f64_or(&args, "x", 0.0);
                let y = f64_or(&args, "y", 700.0);
                to_json(&tb.browser.scroll(&mode, x, y).await?)
            }),
        },
        ToolDef {
            name: "browser_wait_for",
            description: "Wait until a CSS selector is visible",
            input_schema: object_schema(
                json!({
                    "selector": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 500, "maximum": 120000, "default": 15000 },
                }),
                &["selector"],
            ),
            handler: handler(|tb, args| async move {
                let selector = req_str(&args, "selector")?;
                let timeout = timeout_ms(&args, 500, 120_000, OP_TIMEOUT.as_millis() as i64)?;
                to_json(&tb.browser.wait_for(&selector, timeout).await?)
            }),
        },
        ToolDef {
            name: "browser_snapshot",
            description: "Capture the current page URL, title, text and optionally HTML",
            input_schema: object_schema(
                json!({
                    "include_html": { "type": "boolean", "default": false },
                    "max_text_chars": { "type": "integer", "minimum": 500, "maximum": 500000, "default": 25000 },
                }),
                &[],
            ),
            handler: handler(|tb, args| async move {
                let include_html = bool_or(&args, "include_html", false);
                let max_text_chars = int_in_range(&args, "max_text_chars", 500, 500_000, 25_000)?;
                to_json(
                    &tb.browser
                        .snapshot(include_html, max_text_chars as usize)
                        .await?,
                )
            }),
        },
        ToolDef {
            name: "browser_close",
            description: "Tear down the driven browser session (idempotent)",
            input_schema: object_schema(json!({}), &[]),
            handler: handler(|tb, _args| async move {
                tb.browser.close().await;
                Ok(json!({ "ok": true }))
            }),
        },
        ToolDef {
            name: "add_to_cart",
            description: "Add an item to the in-memory cart (deduped by URL)",
            input_schema: object_schema(
                json!({
                    "name": { "type": "string" },
                    "url": { "type": "string" },
                    "price": { "type": "number" },
                    "currency": { "type": "string" },
                    "source": { "type": "string" },
                    "imageUrl": { "type": ["string", "null"], "default": null },
                    "category": { "type": ["string", "null"], "default": null },
                }),
                &["name", "url", "price", "currency", "source"],
            ),
            handler: handler(|tb, args| async move {
                let item = NewCartItem {
                    name: req_str(&args, "name")?,
                    url: req_str(&args, "url")?,
                    price: req_f64(&args, "price")?,
                    currency: req_str(&args, "currency")?,
                    source: req_str(&args, "source")?,
                    image_url: opt_str(&args, "imageUrl"),
                    category: opt_str(&args, "category"),
                };
                to_json(&tb.cart.lock().await.add(item))
            }),
        },
        ToolDef {
            name: "list_cart",
            description: "List the current cart contents",
            input_schema: object_schema(json!({}), &[]),
            handler: handler(|tb, _args| async move { to_json(&tb.cart.lock().await.list()) }),
        },
        ToolDef {
            name: "remove_from_cart",
            description: "Remove a cart item by id",
            input_schema: object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler: handler(|tb, args| async move {
                let id = req_str(&args, "id")?;
                to_json(&tb.cart.lock().await.remove(&id))
            }),
        },
        ToolDef {
            name: "clear_cart",
            description: "Empty the cart unconditionally",
            input_schema: object_schema(json!({}), &[]),
            handler: handler(|tb, _args| async move { to_json(&tb.cart.lock().await.clear()) }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_lists_all_tools_with_schemas() {
        let reg = default_registry();
        assert_eq!(reg.len(), 17);
        let listed = reg.list();
        let names: Vec<&str> = listed
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        for must_have in [
            "web_search",
            "open_page",
            "extract_product",
            "compare_products",
            "browser_start",
            "browser_snapshot",
            "browser_close",
            "add_to_cart",
            "list_cart",
            "remove_from_cart",
            "clear_cart",
        ] {
            assert!(names.contains(&must_have), "missing tool {must_have}");
        }
        for t in &listed {
            assert!(t["inputSchema"]["type"].as_str() == Some("object"));
        }
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_args_are_rejected() {
        let reg = default_registry();
        let tb = Toolbox::new();

        let err = reg.call(tb.clone(), "no_such_tool", json!({})).await;
        assert!(matches!(err, Err(Error::UnknownTool(_))));

        let err = reg.call(tb.clone(), "extract_product", json!({})).await;
        match err {
            Err(Error::BadInput(msg)) => {
                assert!(msg.contains("url"));
                assert!(msg.contains("html"));
            }
            other => panic!("expected BadInput, got {other:?}"),
        }

        // Empty required strings count as missing.
        let err = reg
            .call(tb, "remove_from_cart", json!({ "id": "  " }))
            .await;
        assert!(matches!(err, Err(Error::BadInput(_))));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut reg = ToolRegistry::new();
        let mk = || ToolDef {
            name: "dup",
            description: "d",
            input_schema: object_schema(json!({}), &[]),
            handler: handler(|_tb, _a| async move { Ok(json!({})) }),
        };
        assert!(reg.register(mk()).is_ok());
        assert!(reg.register(mk()).is_err());
    }

    #[tokio::test]
    async fn call_wraps_payload_in_content_envelope() {
        let reg = default_registry();
        let tb = Toolbox::new();
        let out = reg.call(tb, "list_cart", json!({})).await.unwrap();
        let content = out["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"].as_str(), Some("text"));
        let inner: Value = serde_json::from_str(content[0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["ok"].as_bool(), Some(true));
        assert!(inner["cart"].as_array().unwrap().is_empty());
        // Pretty-printed with indent 2.
        assert!(content[0]["text"].as_str().unwrap().contains("\n  "));
    }

    #[tokio::test]
    async fn cart_round_trip_through_the_dispatcher() {
        let reg = default_registry();
        let tb = Toolbox::new();
        let add = json!({
            "name": "a", "url": "u", "price": 1.0, "currency": "USD", "source": "s"
        });

        let out = reg.call(tb.clone(), "add_to_cart", add.clone()).await.unwrap();
        let inner: Value =
            serde_json::from_str(out["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["ok"].as_bool(), Some(true));
        assert_eq!(inner["cart"].as_array().unwrap().len(), 1);

        // Same URL again: soft failure, cart unchanged.
        let out = reg.call(tb.clone(), "add_to_cart", add).await.unwrap();
        let inner: Value =
            serde_json::from_str(out["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["ok"].as_bool(), Some(false));
        assert_eq!(inner["cart"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_numbers_are_bad_input() {
        let reg = default_registry();
        let tb = Toolbox::new();
        let err = reg
            .call(
                tb.clone(),
                "web_search",
                json!({ "query": "kb", "max_results": 50 }),
            )
            .await;
        assert!(matches!(err, Err(Error::BadInput(_))));

        let err = reg
            .call(
                tb,
                "browser_snapshot",
                json!({ "max_text_chars": 10 }),
            )
            .await;
        assert!(matches!(err, Err(Error::BadInput(_))));
    }

    #[tokio::test]
    async fn compare_products_tool_returns_ranked_entries() {
        let reg = default_registry();
        let tb = Toolbox::new();
        let out = reg
            .call(
                tb,
                "compare_products",
                json!({
                    "products": [
                        { "name": "A", "price": 50.0, "currency": "USD",
                          "specs": {"a": "1"}, "key_features": ["f"] },
                        { "name": "B", "price": 200.0, "currency": "USD",
                          "specs": {"a": "1", "b": "2"}, "key_features": ["f", "g"] }
                    ],
                    "criteria": { "max_budget": 100.0, "currency": "USD",
                                  "use_case": "home", "preferences": [] }
                }),
            )
            .await
            .unwrap();
        let inner: Value =
            serde_json::from_str(out["content"][0]["text"].as_str().unwrap()).unwrap();
        let ranked = inner["ranked"].as_array().unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0]["name"].as_str(), Some("A"));
        assert!(ranked[1]["cons"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c.as_str() == Some("Over budget")));
    }
}
