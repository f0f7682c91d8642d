//! Score products against user criteria.
//!
//! Six buckets totalling 100: data completeness (20), budget fit (25),
//! relative value (20), spec richness (15), feature richness (10) and
//! preference match (10). Output order is score-descending and stable.

use shopscout_core::{CompareCriteria, CompareProduct, RankedEntry};
use std::collections::BTreeSet;

pub fn compare_products(
    products: &[CompareProduct],
    criteria: &CompareCriteria,
) -> Vec<RankedEntry> {
    let priced: Vec<f64> = products.iter().filter_map(|p| p.price).collect();
    let min_price = priced.iter().copied().fold(f64::INFINITY, f64::min);
    let max_price = priced.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let spec_key_union: BTreeSet<&str> = products
        .iter()
        .flat_map(|p| p.specs.keys().map(String::as_str))
        .collect();
    let max_features = products
        .iter()
        .map(|p| p.key_features.len())
        .max()
        .unwrap_or(0);

    let mut entries: Vec<RankedEntry> = products
        .iter()
        .map(|p| {
            score_one(
                p,
                criteria,
                &priced,
                min_price,
                max_price,
                spec_key_union.len(),
                max_features,
            )
        })
        .collect();

    // Stable sort keeps input order for equal scores.
    entries.sort_by(|a, b| b.score.cmp(&a.score));
    entries
}

#[allow(clippy::too_many_arguments)]
fn score_one(
    p: &CompareProduct,
    criteria: &CompareCriteria,
    priced: &[f64],
    min_price: f64,
    max_price: f64,
    spec_union: usize,
    max_features: usize,
) -> RankedEntry {
    let mut trace: Vec<String> = Vec::new();
    let mut pros: Vec<String> = Vec::new();
    let mut cons: Vec<String> = Vec::new();
    let mut total: i64 = 0;

    // Data completeness, max 20.
    let mut completeness: i64 = 0;
    if p.price.is_some() {
        completeness += 8;
        if p.currency.is_some() {
            completeness += 2;
        }
    } else {
        cons.push("No price information".to_string());
    }
    if p.brand.is_some() {
        completeness += 3;
    }
    if !p.specs.is_empty() {
        completeness += 4;
    }
    if !p.key_features.is_empty() {
        completeness += 3;
    }
    total += completeness;
    trace.push(format!("+{completeness} data completeness"));

    // Budget fit, max 25.
    match (criteria.max_budget, p.price) {
        (Some(budget), Some(price)) => {
            if price <= budget {
                total += 25;
                trace.push("+25 within budget".to_string());
                pros.push("Within budget".to_string());
            } else {
                trace.push("-25 over budget".to_string());
                cons.push("Over budget".to_string());
            }
        }
        (Some(_), None) => {
            trace.push("-25 price unknown vs budget".to_string());
            cons.push("Cannot verify budget fit".to_string());
        }
        (None, _) => {
            total += 15;
            trace.push("+15 no budget constraint".to_string());
        }
    }

    // Relative value, max 20: normalized price position among priced products.
    let relative: i64 = match p.price {
        Some(price) if priced.len() >= 2 => {
            if max_price > min_price {
                ((1.0 - (price - min_price) / (max_price - min_price)) * 20.0).round() as i64
            } else {
                // Everyone shares one price; each is simultaneously cheapest.
                20
            }
        }
        Some(_) => 10,
        None => 0,
    };
    total += relative;
    trace.push(format!("+{relative} relative value"));
    if p.price.is_some() && priced.len() >= 2 {
        if p.price == Some(min_price) {
            pros.push("Lowest price in set".to_string());
        }
        if p.price == Some(max_price) && max_price > min_price {
            cons.push("Highest price in set".to_string());
        }
    }

    // Spec richness, max 15: coverage of the union of spec keys.
    let spec_points: i64 = if spec_union > 0 {
        ((p.specs.len() as f64 / spec_union as f64) * 15.0).round() as i64
    } else {
        0
    };
    total += spec_points;
    trace.push(format!("+{spec_points} spec coverage"));
    if p.specs.len() >= 3 {
        pros.push(format!("Detailed specifications ({})", p.specs.len()));
    }

    // Feature richness, max 10.
    let feature_points: i64 = if max_features > 0 {
        ((p.key_features.len() as f64 / max_features as f64) * 10.0).round() as i64
    } else {
        0
    };
    total += feature_points;
    trace.push(format!("+{feature_points} feature coverage"));
    if p.key_features.len() >= 3 {
        pros.push(format!("Rich feature list ({})", p.key_features.len()));
    }

    // Preference match, max 10: lowercase substring match over a searchable
    // concatenation of name/brand/features/spec keys/spec values.
    if criteria.preferences.is_empty() {
        total += 5;
        trace.push("+5 no preferences given".to_string());
    } else {
        let haystack = searchable_text(p);
        let matched: Vec<&str> = criteria
            .preferences
            .iter()
            .map(String::as_str)
            .filter(|pref| {
                let pref = pref.trim().to_ascii_lowercase();
                !pref.is_empty() && haystack.contains(&pref)
            })
            .collect();
        let points =
            ((matched.len() as f64 / criteria.preferences.len() as f64) * 10.0).round() as i64;
        total += points;
        if matched.is_empty() {
            trace.push("-10 no preferences matched".to_string());
            cons.push("No stated preferences matched".to_string());
        } else {
            trace.push(format!("+{points} preference match"));
            pros.push(format!("Matches preferences: {}", matched.join(", ")));
        }
    }

    let score = total.clamp(0, 100) as u32;
    let reason = format!("Score {score}/100: {}", trace.join("; "));
    RankedEntry {
        name: p.name.clone(),
        score,
        pros,
        cons,
        reason,
    }
}

fn searchable_text(p: &CompareProduct) -> String {
    let mut parts: Vec<&str> = vec![p.name.as_str()];
    if let Some(brand) = p.brand.as_deref() {
        parts.push(brand);
    }
    parts.extend(p.key_features.iter().map(String::as_str));
    parts.extend(p.specs.keys().map(String::as_str));
    parts.extend(p.specs.values().map(String::as_str));
    parts.join("|").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn product(name: &str, price: Option<f64>) -> CompareProduct {
        CompareProduct {
            name: name.to_string(),
            price,
            currency: price.map(|_| "USD".to_string()),
            brand: None,
            key_features: Vec::new(),
            specs: BTreeMap::new(),
            availability: None,
        }
    }

    fn specs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn budget_gate_ranks_affordable_product_first() {
        let mut a = product("A", Some(50.0));
        a.specs = specs(&[("a", "1")]);
        a.key_features = vec!["f".to_string()];
        let mut b = product("B", Some(200.0));
        b.specs = specs(&[("a", "1"), ("b", "2")]);
        b.key_features = vec!["f".to_string(), "g".to_string()];

        let criteria = CompareCriteria {
            max_budget: Some(100.0),
            currency: Some("USD".to_string()),
            use_case: "home".to_string(),
            preferences: Vec::new(),
        };
        let ranked = compare_products(&[a, b], &criteria);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].name, "A");
        assert!(ranked[1].cons.iter().any(|c| c == "Over budget"));
        assert!(ranked[0].pros.iter().any(|c| c == "Within budget"));
    }

    #[test]
    fn scores_are_bounded_integers_and_output_is_complete() {
        let products = vec![
            product("A", Some(10.0)),
            product("B", None),
            product("C", Some(500.0)),
        ];
        let ranked = compare_products(&products, &CompareCriteria::default());
        assert_eq!(ranked.len(), products.len());
        for r in &ranked {
            assert!(r.score <= 100);
            assert!(r.reason.starts_with(&format!("Score {}/100:", r.score)));
        }
    }

    #[test]
    fn ties_preserve_input_order() {
        let ranked = compare_products(
            &[product("First", None), product("Second", None)],
            &CompareCriteria::default(),
        );
        assert_eq!(ranked[0].score, ranked[1].score);
        assert_eq!(ranked[0].name, "First");
        assert_eq!(ranked[1].name, "Second");
    }

    #[test]
    fn zero_budget_fails_every_priced_product() {
        let ranked = compare_products(
            &[product("A", Some(1.0))],
            &CompareCriteria {
                max_budget: Some(0.0),
                ..Default::default()
            },
        );
        assert!(ranked[0].cons.iter().any(|c| c == "Over budget"));
        assert!(ranked[0].reason.contains("-25 over budget"));
    }

    #[test]
    fn missing_price_with_budget_cannot_verify() {
        let ranked = compare_products(
            &[product("A", None)],
            &CompareCriteria {
                max_budget: Some(100.0),
                ..Default::default()
            },
        );
        assert!(ranked[0].cons.iter().any(|c| c == "Cannot verify budget fit"));
        assert!(ranked[0].cons.iter().any(|c| c == "No price information"));
    }

    #[test]
    fn single_priced_product_takes_neutral_relative_value() {
        let ranked = compare_products(
            &[product("A", Some(42.0)), product("B", None)],
            &CompareCriteria::default(),
        );
        let a = ranked.iter().find(|r| r.name == "A").unwrap();
        assert!(a.reason.contains("+10 relative value"));
    }

    #[test]
    fn preferences_match_against_specs_and_features() {
        let mut a = product("Quietboard", Some(100.0));
        a.key_features = vec!["silent switches".to_string()];
        a.specs = specs(&[("Backlight", "RGB")]);
        let mut b = product("Loudboard", Some(100.0));
        b.key_features = vec!["clicky switches".to_string()];

        let criteria = CompareCriteria {
            preferences: vec!["silent".to_string(), "rgb".to_string()],
            ..Default::default()
        };
        let ranked = compare_products(&[b, a], &criteria);
        assert_eq!(ranked[0].name, "Quietboard");
        assert!(ranked[0]
            .pros
            .iter()
            .any(|p| p.contains("silent") && p.contains("rgb")));
        let loud = ranked.iter().find(|r| r.name == "Loudboard").unwrap();
        assert!(loud.cons.iter().any(|c| c == "No stated preferences matched"));
    }

    #[test]
    fn lowest_and_highest_price_annotations() {
        let ranked = compare_products(
            &[product("Cheap", Some(10.0)), product("Dear", Some(90.0))],
            &CompareCriteria::default(),
        );
        let cheap = ranked.iter().find(|r| r.name == "Cheap").unwrap();
        let dear = ranked.iter().find(|r| r.name == "Dear").unwrap();
        assert!(cheap.pros.iter().any(|p| p == "Lowest price in set"));
        assert!(dear.cons.iter().any(|c| c == "Highest price in set"));
    }
}
