//! Product extraction: merge structured data (JSON-LD, itemprops) with
//! text heuristics into a normalized `ProductCandidate`.
//!
//! Order of sources matters: later passes only fill what earlier passes
//! left empty. Extraction never fails; missing fields stay null/empty and
//! the confidence score reflects what was recovered.

use html_scraper::{Html, Selector};
use regex::Regex;
use serde_json::Value;
use shopscout_core::{normalize_availability, ProductCandidate};
use std::sync::OnceLock;

pub const MAX_FEATURES: usize = 10;
pub const MAX_IMAGES: usize = 12;
pub const MAX_SPECS: usize = 25;

/// Currencies we are willing to report. Anything else is dropped rather
/// than guessed.
pub const CURRENCY_CODES: &[&str] = &[
    "USD", "GBP", "EUR", "CAD", "AUD", "JPY", "INR", "CNY", "CHF", "SEK", "NZD",
];

pub fn extract_product(url: &str, html: &str, text: &str) -> ProductCandidate {
    let mut p = ProductCandidate::empty(url);
    let mut used_structured = false;

    let doc = Html::parse_document(html);
    if apply_json_ld(&doc, url, &mut p) {
        used_structured = true;
    }
    if apply_itemprops(&doc, url, &mut p) {
        used_structured = true;
    }
    apply_text_heuristics(text, &mut p);
    if p.images.is_empty() {
        harvest_images(&doc, url, &mut p);
    }

    finalize(&mut p, used_structured);
    p
}

// ---- JSON-LD ----

fn apply_json_ld(doc: &Html, base_url: &str, p: &mut ProductCandidate) -> bool {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return false;
    };

    let mut products: Vec<Value> = Vec::new();
    for script in doc.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        collect_product_objects(&parsed, &mut products, 0);
    }
    if products.is_empty() {
        return false;
    }

    // Several product objects can coexist (carousels, related items).
    // Pick the most complete one.
    let best = products
        .iter()
        .max_by_key(|v| score_product_object(v))
        .expect("non-empty");
    apply_product_object(best, base_url, p);
    true
}

fn is_product_type(type_val: Option<&Value>) -> bool {
    match type_val {
        Some(Value::String(s)) => s.eq_ignore_ascii_case("product"),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str())
            .any(|s| s.eq_ignore_ascii_case("product")),
        _ => false,
    }
}

/// Walk the document (including `@graph` and nested values) collecting
/// every object typed `Product`. Depth-bounded against adversarial nesting.
fn collect_product_objects(v: &Value, out: &mut Vec<Value>, depth: usize) {
    if depth > 8 {
        return;
    }
    match v {
        Value::Object(map) => {
            if is_product_type(map.get("@type")) {
                out.push(v.clone());
            }
            for child in map.values() {
                collect_product_objects(child, out, depth + 1);
            }
        }
        Value::Array(arr) => {
            for child in arr {
                collect_product_objects(child, out, depth + 1);
            }
        }
        _ => {}
    }
}

fn score_product_object(v: &Value) -> i32 {
    let Some(map) = v.as_object() else { return 0 };
    let mut score = 0;
    if map.get("name").and_then(|x| x.as_str()).is_some() {
        score += 3;
    }
    if map.contains_key("offers") {
        score += 3;
    }
    if map.contains_key("brand") {
        score += 1;
    }
    if map.contains_key("image") {
        score += 1;
    }
    if map.contains_key("category") {
        score += 1;
    }
    score
}

fn apply_product_object(v: &Value, base_url: &str, p: &mut ProductCandidate) {
    let Some(map) = v.as_object() else { return };

    if p.name.is_none() {
        p.name = map
            .get("name")
            .and_then(|x| x.as_str())
            .map(clean_field)
            .filter(|s| !s.is_empty());
    }
    if p.brand.is_none() {
        p.brand = match map.get("brand") {
            Some(Value::String(s)) => Some(clean_field(s)),
            Some(Value::Object(b)) => b.get("name").and_then(|x| x.as_str()).map(clean_field),
            _ => None,
        }
        .filter(|s| !s.is_empty());
    }
    if p.category.is_none() {
        p.category = match map.get("category") {
            Some(Value::String(s)) => Some(clean_field(s)),
            Some(Value::Array(arr)) => arr.first().and_then(|x| x.as_str()).map(clean_field),
            _ => None,
        }
        .filter(|s| !s.is_empty());
    }
    if p.key_features.is_empty() {
        if let Some(desc) = map.get("description").and_then(|x| x.as_str()) {
            p.key_features = split_description(desc);
        }
    }
    if p.images.is_empty() {
        match map.get("image") {
            Some(Value::String(s)) => push_image(&mut p.images, base_url, s),
            Some(Value::Array(arr)) => {
                for img in arr.iter().filter_map(|x| x.as_str()) {
                    push_image(&mut p.images, base_url, img);
                }
            }
            _ => {}
        }
    }
    if let Some(Value::Array(props)) = map.get("additionalProperty") {
        for prop in props {
            let (Some(name), Some(value)) = (
                prop.get("name").and_then(|x| x.as_str()),
                prop.get("value").map(json_scalar_to_string),
            ) else {
                continue;
            };
            let key = clean_field(name);
            let value = clean_field(&value);
            if key.is_empty() || value.is_empty() || p.specs.len() >= MAX_SPECS {
                continue;
            }
            p.specs.entry(key).or_insert(value);
        }
    }

    if let Some(offer) = pick_offer(map.get("offers")) {
        if p.price.is_none() {
            p.price = offer.get("price").and_then(parse_price_value);
        }
        if p.currency.is_none() {
            p.currency = offer
                .get("priceCurrency")
                .and_then(|x| x.as_str())
                .and_then(normalize_currency_code);
        }
        if p.availability.is_none() {
            p.availability = offer
                .get("availability")
                .and_then(|x| x.as_str())
                .map(normalize_availability)
                .filter(|s| !s.is_empty());
        }
    }
}

/// First offer that carries a price, else the first offer at all.
fn pick_offer(offers: Option<&Value>) -> Option<&serde_json::Map<String, Value>> {
    let flat: Vec<&serde_json::Map<String, Value>> = match offers? {
        Value::Object(o) => vec![o],
        Value::Array(arr) => arr.iter().filter_map(|v| v.as_object()).collect(),
        _ => return None,
    };
    flat.iter()
        .find(|o| o.contains_key("price"))
        .or_else(|| flat.first())
        .copied()
}

fn json_scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Parse "1,299.00", "$49.99" or a bare number into a non-negative price.
fn parse_price_value(v: &Value) -> Option<f64> {
    let price = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s
                .replace(',', "")
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (price >= 0.0 && price.is_finite()).then_some(price)
}

fn normalize_currency_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    CURRENCY_CODES.contains(&code.as_str()).then_some(code)
}

fn clean_field(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sentence/bullet split of a prose description into short feature strings.
fn split_description(desc: &str) -> Vec<String> {
    desc.split(['.', '\u{2022}'])
        .map(|s| clean_field(s))
        .filter(|s| s.len() >= 4)
        .take(6)
        .collect()
}

// ---- Microdata-like itemprops ----

fn apply_itemprops(doc: &Html, base_url: &str, p: &mut ProductCandidate) -> bool {
    let Ok(sel) = Selector::parse("[itemprop]") else {
        return false;
    };
    let mut applied = false;
    // "Fill only what earlier passes left empty" applies to the list as a
    // whole: itemprop images are only collected when the pass started with
    // none, but several itemprop images may then accumulate.
    let had_images = !p.images.is_empty();
    for el in doc.select(&sel) {
        let Some(prop) = el.value().attr("itemprop") else {
            continue;
        };
        // First of content/value/href/src, else the element's own text.
        let value = el
            .value()
            .attr("content")
            .or_else(|| el.value().attr("value"))
            .or_else(|| el.value().attr("href"))
            .or_else(|| el.value().attr("src"))
            .map(|s| s.to_string())
            .unwrap_or_else(|| el.text().collect::<Vec<_>>().join(" "));
        let value = clean_field(&value);
        if value.is_empty() {
            continue;
        }

        match prop.to_ascii_lowercase().as_str() {
            "name" if p.name.is_none() => {
                p.name = Some(value);
                applied = true;
            }
            "brand" if p.brand.is_none() => {
                p.brand = Some(value);
                applied = true;
            }
            "category" if p.category.is_none() => {
                p.category = Some(value);
                applied = true;
            }
            "price" | "lowprice" if p.price.is_none() => {
                if let Some(price) = parse_price_value(&Value::String(value)) {
                    p.price = Some(price);
                    applied = true;
                }
            }
            "pricecurrency" if p.currency.is_none() => {
                if let Some(code) = normalize_currency_code(&value) {
                    p.currency = Some(code);
                    applied = true;
                }
            }
            "availability" if p.availability.is_none() => {
                let norm = normalize_availability(&value);
                if !norm.is_empty() {
                    p.availability = Some(norm);
                    applied = true;
                }
            }
            "image" if !had_images && p.images.len() < MAX_IMAGES => {
                let before = p.images.len();
                push_image(&mut p.images, base_url, &value);
                applied |= p.images.len() > before;
            }
            "description" if p.key_features.is_empty() => {
                p.key_features = split_description(&value);
                applied |= !p.key_features.is_empty();
            }
            _ => {}
        }
    }
    applied
}

// ---- Text heuristics ----

fn nav_boilerplate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(home|menu|shop|search|help|deals|departments|categories|sign in|log in|my account|cart|basket|checkout|wishlist)$|cookie|javascript|privacy policy|terms of|sign up|subscribe|newsletter|free shipping|add to cart|skip to",
        )
        .expect("static regex")
    })
}

fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:([$£€])|\b(USD|GBP|EUR|CAD|AUD)\b)\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)|([0-9][0-9,]*(?:\.[0-9]{1,2})?)\s*(USD|GBP|EUR|CAD|AUD)\b",
        )
        .expect("static regex")
    })
}

fn apply_text_heuristics(text: &str, p: &mut ProductCandidate) {
    if p.name.is_none() {
        p.name = guess_name(text);
    }
    if p.price.is_none() {
        if let Some((price, currency)) = scan_price(text) {
            p.price = Some(price);
            if p.currency.is_none() {
                p.currency = currency;
            }
        }
    }
    if p.availability.is_none() {
        p.availability = scan_availability(text);
    }
    if p.brand.is_none() {
        p.brand = scan_labeled_value(text, "brand", 60);
    }
    if p.category.is_none() {
        p.category = scan_labeled_value(text, "category", 80);
    }
    if p.key_features.is_empty() {
        p.key_features = scan_features(text);
    }
    if p.specs.is_empty() {
        scan_specs(text, p);
    }
}

/// First plausible product-name line among the first 30 non-empty lines.
fn guess_name(text: &str) -> Option<String> {
    for line in text.lines().filter(|l| !l.trim().is_empty()).take(30) {
        let line = clean_field(line);
        let n = line.chars().count();
        if !(6..=140).contains(&n) {
            continue;
        }
        if nav_boilerplate_re().is_match(&line) {
            continue;
        }
        return Some(line);
    }
    None
}

fn symbol_to_currency(sym: &str) -> Option<String> {
    match sym {
        "$" => Some("USD".to_string()),
        "£" => Some("GBP".to_string()),
        "€" => Some("EUR".to_string()),
        _ => None,
    }
}

fn boundary_before(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn boundary_after(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Scan for `SYMBOL NUMBER`, `CODE NUMBER` or `NUMBER CODE`.
/// Occurrences near sale/price vocabulary are preferred; occurrences near
/// list-price/MSRP vocabulary are penalized. Earliest wins on tie.
fn scan_price(text: &str) -> Option<(f64, Option<String>)> {
    static POS: OnceLock<Regex> = OnceLock::new();
    static NEG: OnceLock<Regex> = OnceLock::new();
    let pos = POS.get_or_init(|| {
        Regex::new(r"(?i)\b(our price|price|now|sale|buy)\b").expect("static regex")
    });
    let neg = NEG.get_or_init(|| {
        Regex::new(r"(?i)\b(list price|msrp|was)\b").expect("static regex")
    });

    let mut best: Option<(i32, f64, Option<String>)> = None;
    for caps in price_re().captures_iter(text) {
        let whole = caps.get(0).expect("group 0");
        let (num, currency) = if let Some(num) = caps.get(3) {
            let currency = caps
                .get(1)
                .and_then(|s| symbol_to_currency(s.as_str()))
                .or_else(|| caps.get(2).and_then(|c| normalize_currency_code(c.as_str())));
            (num.as_str(), currency)
        } else {
            let Some(num) = caps.get(4) else { continue };
            let currency = caps.get(5).and_then(|c| normalize_currency_code(c.as_str()));
            (num.as_str(), currency)
        };
        let Some(price) = parse_price_value(&Value::String(num.to_string())) else {
            continue;
        };

        let lo = boundary_before(text, whole.start().saturating_sub(50));
        let hi = boundary_after(text, (whole.end() + 50).min(text.len()));
        let window = &text[lo..hi];
        let mut score = 0i32;
        if pos.is_match(window) {
            score += 2;
        }
        if neg.is_match(window) {
            score -= 1;
        }

        // Strictly-greater keeps the earliest occurrence on ties.
        if best.as_ref().is_none_or(|(s, _, _)| score > *s) {
            best = Some((score, price, currency));
        }
    }
    best.map(|(_, price, currency)| (price, currency))
}

fn scan_availability(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    // Check the negative phrase first: "out of stock" contains "in stock"
    // as a substring-by-accident in some markups, so order matters.
    if lower.contains("out of stock") {
        return Some(shopscout_core::AVAILABILITY_OUT_OF_STOCK.to_string());
    }
    if lower.contains("currently unavailable") {
        return Some(shopscout_core::AVAILABILITY_UNAVAILABLE.to_string());
    }
    if lower.contains("pre-order") || lower.contains("preorder") {
        return Some(shopscout_core::AVAILABILITY_PREORDER.to_string());
    }
    if lower.contains("in stock") {
        return Some(shopscout_core::AVAILABILITY_IN_STOCK.to_string());
    }
    None
}

/// First `label: value` / `label - value` line for a given label.
fn scan_labeled_value(text: &str, label: &str, max_len: usize) -> Option<String> {
    let re = Regex::new(&format!(r"(?im)^\s*{label}\s*[:\-]\s*(.+)$")).ok()?;
    let caps = re.captures(text)?;
    let value = clean_field(caps.get(1)?.as_str());
    let n = value.chars().count();
    (2..=max_len).contains(&n).then_some(value)
}

fn scan_features(text: &str) -> Vec<String> {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    static REVIEWISH: OnceLock<Regex> = OnceLock::new();
    static PROMO: OnceLock<Regex> = OnceLock::new();
    let bullet = BULLET.get_or_init(|| {
        Regex::new(r"(?m)^\s*[-*\u{2022}]\s*(\S.*)$").expect("static regex")
    });
    let reviewish = REVIEWISH.get_or_init(|| {
        Regex::new(r"(?i)^(i|my|we)\b|love it|highly recommend|works great|bought this")
            .expect("static regex")
    });
    let promo = PROMO.get_or_init(|| {
        Regex::new(r"(?i)free shipping|add to cart|sign up|subscribe|newsletter|learn more|shop now|view details|best seller")
            .expect("static regex")
    });

    let mut out = Vec::new();
    for caps in bullet.captures_iter(text) {
        if out.len() >= 8 {
            break;
        }
        let line = clean_field(caps.get(1).expect("group 1").as_str());
        let n = line.chars().count();
        if !(8..=180).contains(&n) {
            continue;
        }
        if reviewish.is_match(&line) || promo.is_match(&line) {
            continue;
        }
        out.push(line);
    }
    out
}

fn scan_specs(text: &str, p: &mut ProductCandidate) {
    static SPEC: OnceLock<Regex> = OnceLock::new();
    let spec = SPEC.get_or_init(|| {
        Regex::new(r"(?m)^\s*([A-Za-z0-9][A-Za-z0-9 /\-]{0,39}?)\s*:\s*(\S.{0,199})$")
            .expect("static regex")
    });
    for caps in spec.captures_iter(text) {
        if p.specs.len() >= MAX_SPECS {
            break;
        }
        let key = clean_field(caps.get(1).expect("group 1").as_str());
        let value = clean_field(caps.get(2).expect("group 2").as_str());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        p.specs.entry(key).or_insert(value);
    }
}

// ---- Images ----

fn junk_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)logo|icon|sprite|pixel|tracking|banner|avatar|\.gif|\.svg|data:image|1x1|placeholder")
            .expect("static regex")
    })
}

fn push_image(images: &mut Vec<String>, base_url: &str, src: &str) {
    if images.len() >= MAX_IMAGES {
        return;
    }
    let src = src.trim();
    if src.is_empty() || junk_image_re().is_match(src) {
        return;
    }
    let absolute = if src.starts_with("http://") || src.starts_with("https://") {
        src.to_string()
    } else {
        let Ok(base) = url::Url::parse(base_url) else {
            return;
        };
        let Ok(joined) = base.join(src) else { return };
        joined.to_string()
    };
    if !images.contains(&absolute) {
        images.push(absolute);
    }
}

/// Meta (OpenGraph/Twitter) images first, then contextful `<img>` tags,
/// then any non-junk `<img>` as a last resort.
fn harvest_images(doc: &Html, base_url: &str, p: &mut ProductCandidate) {
    static PRODUCTISH: OnceLock<Regex> = OnceLock::new();
    let productish = PRODUCTISH.get_or_init(|| {
        Regex::new(r"(?i)product|hero|main|gallery|primary|detail").expect("static regex")
    });

    if let Ok(sel) = Selector::parse(
        r#"meta[property="og:image"], meta[name="og:image"], meta[property="twitter:image"], meta[name="twitter:image"]"#,
    ) {
        for meta in doc.select(&sel) {
            if let Some(content) = meta.value().attr("content") {
                push_image(&mut p.images, base_url, content);
            }
        }
    }

    let Ok(sel_img) = Selector::parse("img[src]") else {
        return;
    };
    if p.images.len() < MAX_IMAGES {
        for img in doc.select(&sel_img) {
            if p.images.len() >= MAX_IMAGES {
                break;
            }
            let Some(src) = img.value().attr("src") else {
                continue;
            };
            let hay = format!(
                "{} {} {} {}",
                img.value().attr("class").unwrap_or(""),
                img.value().attr("id").unwrap_or(""),
                img.value().attr("alt").unwrap_or(""),
                src
            );
            let alt_len = img.value().attr("alt").map(|a| a.trim().len()).unwrap_or(0);
            if productish.is_match(&hay) || alt_len >= 12 {
                push_image(&mut p.images, base_url, src);
            }
        }
    }
    if p.images.is_empty() {
        for img in doc.select(&sel_img) {
            if p.images.len() >= MAX_IMAGES {
                break;
            }
            if let Some(src) = img.value().attr("src") {
                push_image(&mut p.images, base_url, src);
            }
        }
    }
}

// ---- Finalization ----

fn finalize(p: &mut ProductCandidate, used_structured: bool) {
    // Dedup preserving first occurrence, whitespace-normalized.
    let mut seen = std::collections::BTreeSet::new();
    p.key_features.retain(|f| seen.insert(clean_field(f).to_ascii_lowercase()));
    p.key_features.truncate(MAX_FEATURES);

    let mut seen_img = std::collections::BTreeSet::new();
    p.images.retain(|i| seen_img.insert(i.clone()));
    p.images.truncate(MAX_IMAGES);

    if p.specs.len() > MAX_SPECS {
        let keep: Vec<String> = p.specs.keys().take(MAX_SPECS).cloned().collect();
        p.specs.retain(|k, _| keep.contains(k));
    }

    let mut c = 0.0f64;
    if p.name.is_some() {
        c += 0.20;
    }
    if p.price.is_some() {
        c += if p.currency.is_some() { 0.25 } else { 0.15 };
    }
    if p.availability.is_some() {
        c += 0.10;
    }
    if p.brand.is_some() {
        c += 0.10;
    }
    if p.category.is_some() {
        c += 0.05;
    }
    if !p.key_features.is_empty() {
        c += 0.10;
    }
    if !p.images.is_empty() {
        c += 0.10;
    }
    if !p.specs.is_empty() {
        c += 0.10;
    }
    if used_structured {
        c += 0.10;
    }
    p.confidence = (c.clamp(0.0, 1.0) * 100.0).round() / 100.0;
}
