//! Deterministic text normalization for search queries.
//!
//! These helpers are matching/scoring glue, not display formatting: they are
//! intentionally lossy and must stay stable across runs.

/// Words stripped from user prompts before they become search queries.
///
/// Grouped for maintainability; membership is what matters, not grouping.
pub const STOP_WORDS: &[&str] = &[
    // articles / prepositions / conjunctions
    "a", "an", "the", "for", "to", "of", "and", "or", "in", "on", "with", "at", "by", "from",
    // conversational filler
    "want", "need", "looking", "find", "get", "buy", "purchase", "search", "show", "help", "can",
    "you", "me", "my", "please", "something", "some", "any", "also", "just", "like", "would",
    "should", "could", "recommend", "suggest", "what", "which", "that", "this",
    // budget / price vocabulary (budget clauses are stripped separately,
    // this catches stragglers)
    "under", "below", "less", "than", "max", "maximum", "budget", "around", "about", "price",
    "priced", "cheap", "cheapest", "affordable", "expensive",
    // quality adjectives
    "best", "good", "great", "top", "quality", "nice", "decent",
    // gender terms
    "men", "mens", "man", "women", "womens", "woman", "male", "female", "ladies", "lady", "boys",
    "girls",
];

/// Lowercase, split on non-alphanumerics, collapse whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lc in ch.to_lowercase() {
                cur.push(lc);
            }
        } else if !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// Remove budget clauses ("under 200", "max budget £150", bare "£150")
/// before tokenization so bare numbers never leak into the query.
pub fn strip_budget_clauses(prompt: &str) -> String {
    let keyword = regex::Regex::new(
        r"(?i)\b(under|below|less\s+than|max(?:imum)?(?:\s+budget)?)\s*(?:of\s*)?[£$€]?\s*\d+(?:[.,]\d+)?",
    )
    .expect("static regex");
    let bare = regex::Regex::new(r"[£$€]\s*\d+(?:[.,]\d+)?").expect("static regex");
    let s = keyword.replace_all(prompt, " ");
    bare.replace_all(&s, " ").into_owned()
}

/// Reduce a user prompt to search terms: strip budget clauses, tokenize,
/// drop stop words / pure numbers / one-char tokens, then append "buy"
/// to bias results toward merchant pages.
pub fn clean_query(prompt: &str) -> String {
    let stripped = strip_budget_clauses(prompt);
    let mut terms: Vec<String> = tokenize(&stripped)
        .into_iter()
        .filter(|t| t.len() >= 2 && !is_numeric(t) && !is_stop_word(t))
        .collect();
    if terms.is_empty() {
        return String::new();
    }
    terms.push("buy".to_string());
    terms.join(" ")
}

/// Query terms used for relevance matching (the cleaned query without the
/// trailing "buy" bias term).
pub fn query_terms(prompt: &str) -> Vec<String> {
    let cleaned = clean_query(prompt);
    let mut terms: Vec<String> = cleaned.split_whitespace().map(|s| s.to_string()).collect();
    if terms.last().map(|s| s.as_str()) == Some("buy") {
        terms.pop();
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_query_drops_filler_and_appends_buy() {
        let q = clean_query("I want the best mechanical keyboard for my office please");
        assert_eq!(q, "mechanical keyboard office buy");
    }

    #[test]
    fn budget_clauses_are_stripped_before_tokenization() {
        // The bare number from "under 200" must not leak into the query.
        let q = clean_query("wireless headphones under 200");
        assert_eq!(q, "wireless headphones buy");

        let q = clean_query("gaming mouse max budget $80");
        assert_eq!(q, "gaming mouse buy");

        let q = clean_query("£150 espresso machine");
        assert_eq!(q, "espresso machine buy");
    }

    #[test]
    fn numeric_and_short_tokens_are_dropped() {
        // "4k" survives (not purely numeric), bare numbers do not.
        let q = clean_query("a 4k tv 55 2024");
        assert_eq!(q, "4k tv buy");
    }

    #[test]
    fn query_terms_exclude_the_buy_bias() {
        let terms = query_terms("find me a mechanical keyboard");
        assert_eq!(terms, vec!["mechanical", "keyboard"]);
    }

    #[test]
    fn empty_prompt_yields_empty_query() {
        assert_eq!(clean_query("please find me something"), "");
    }
}
