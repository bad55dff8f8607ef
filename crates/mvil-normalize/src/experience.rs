use mvil_core::{Experience, ExperienceBand};
use serde_json::Value as JsonValue;
use tracing::debug;

const MAX_PLAUSIBLE_YEARS: f64 = 60.0;

const TEXT_KEYS: &[&str] = &["text", "level", "seniority", "experience", "required", "value"];

/// Numbers in free text, in order of appearance. `"2-4 yrs"` yields `[2.0, 4.0]`.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

fn plausible(years: f64) -> Option<f64> {
    (years.is_finite() && (0.0..=MAX_PLAUSIBLE_YEARS).contains(&years)).then_some(years)
}

fn is_range(text: &str) -> bool {
    text.contains('-') || text.contains('–') || text.contains(" to ") || text.contains('/')
}

fn band_from_words(text: &str) -> Option<ExperienceBand> {
    let words = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let words = words.split_whitespace().collect::<Vec<_>>();
    let has = |vocab: &[&str]| words.iter().any(|w| vocab.contains(w));

    if has(&["lead", "principal", "staff", "head", "director", "architect", "expert"]) {
        Some(ExperienceBand::TenPlus)
    } else if has(&["senior", "sr", "experienced"]) {
        Some(ExperienceBand::FiveToTen)
    } else if has(&["mid", "intermediate", "midlevel"]) {
        Some(ExperienceBand::ThreeToFive)
    } else if has(&["entry", "junior", "jr", "graduate", "intern", "internship", "trainee", "fresher", "none"]) {
        Some(ExperienceBand::ZeroToTwo)
    } else {
        None
    }
}

fn parse_text(text: &str) -> Option<Experience> {
    let lower = text.to_lowercase();
    let numbers = extract_numbers(&lower);
    match numbers.as_slice() {
        [low, high, ..] if is_range(&lower) => {
            let (low, high) = (low.min(*high), low.max(*high));
            plausible((low + high) / 2.0).map(Experience::Years)
        }
        [first, ..] => plausible(*first).map(Experience::Years),
        [] => band_from_words(&lower).map(Experience::Band),
    }
}

fn number_of(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => extract_numbers(s).first().copied(),
        _ => None,
    }
}

fn parse_value(value: &JsonValue) -> Option<Experience> {
    match value {
        JsonValue::Number(n) => n.as_f64().and_then(plausible).map(Experience::Years),
        JsonValue::String(s) => parse_text(s),
        JsonValue::Array(items) => items.iter().find_map(parse_value),
        JsonValue::Object(map) => {
            let min = ["min", "min_years", "minimum_years", "minimum", "from"]
                .iter()
                .find_map(|k| map.get(*k).and_then(number_of));
            let max = ["max", "max_years", "maximum_years", "maximum", "to"]
                .iter()
                .find_map(|k| map.get(*k).and_then(number_of));
            let years = map.get("years").and_then(number_of);
            match (min, max, years) {
                (Some(lo), Some(hi), _) => plausible((lo.min(hi) + lo.max(hi)) / 2.0).map(Experience::Years),
                (_, _, Some(y)) => plausible(y).map(Experience::Years),
                (Some(lo), None, None) => plausible(lo).map(Experience::Years),
                (None, Some(hi), None) => plausible(hi).map(Experience::Years),
                (None, None, None) => TEXT_KEYS
                    .iter()
                    .filter_map(|k| map.get(*k))
                    .find_map(parse_value),
            }
        }
        _ => None,
    }
}

/// Numeric years or a qualitative band. Ranges resolve to their midpoint.
pub fn parse_experience(raw: Option<&JsonValue>) -> Option<Experience> {
    let raw = raw?;
    let parsed = parse_value(raw);
    if parsed.is_none() && !raw.is_null() {
        debug!(raw = %raw, "experience not recognized");
    }
    parsed
}

/// Years of experience; qualitative bands map to their midpoint-equivalent.
pub fn normalize_experience(raw: Option<&JsonValue>) -> Option<f64> {
    parse_experience(raw).and_then(|e| e.years())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn band(v: JsonValue) -> Option<ExperienceBand> {
        parse_experience(Some(&v)).map(|e| e.band())
    }

    #[test]
    fn ranges_take_the_midpoint() {
        assert_eq!(normalize_experience(Some(&json!("2-4 years"))), Some(3.0));
        assert_eq!(normalize_experience(Some(&json!("3 to 6 yrs"))), Some(4.5));
        assert_eq!(normalize_experience(Some(&json!({"min": 1, "max": 3}))), Some(2.0));
    }

    #[test]
    fn single_numbers_and_objects() {
        assert_eq!(normalize_experience(Some(&json!("7 yrs"))), Some(7.0));
        assert_eq!(normalize_experience(Some(&json!("5+ years"))), Some(5.0));
        assert_eq!(normalize_experience(Some(&json!(4))), Some(4.0));
        assert_eq!(normalize_experience(Some(&json!({"years": "6"}))), Some(6.0));
        assert_eq!(normalize_experience(Some(&json!({"level": "Senior"}))), Some(7.5));
    }

    #[test]
    fn qualitative_bands_are_kept() {
        assert_eq!(band(json!("entry level")), Some(ExperienceBand::ZeroToTwo));
        assert_eq!(band(json!("Mid-level")), Some(ExperienceBand::ThreeToFive));
        assert_eq!(band(json!("Senior")), Some(ExperienceBand::FiveToTen));
        assert_eq!(band(json!("Principal engineer")), Some(ExperienceBand::TenPlus));
        assert_eq!(
            parse_experience(Some(&json!("junior"))),
            Some(Experience::Band(ExperienceBand::ZeroToTwo))
        );
    }

    #[test]
    fn scenario_expressions_bin_as_expected() {
        assert_eq!(band(json!("2-4 years")), Some(ExperienceBand::ThreeToFive));
        assert_eq!(band(json!("entry level")), Some(ExperienceBand::ZeroToTwo));
        assert_eq!(band(json!("7 yrs")), Some(ExperienceBand::FiveToTen));
    }

    #[test]
    fn unparseable_is_none() {
        assert_eq!(parse_experience(None), None);
        for v in [json!(null), json!("lots"), json!(true), json!({}), json!(-3), json!("400 years")] {
            assert_eq!(parse_experience(Some(&v)), None, "{v}");
        }
    }

    #[test]
    fn extract_numbers_handles_decimals() {
        assert_eq!(extract_numbers("1.5 - 3. years"), vec![1.5, 3.0]);
        assert!(extract_numbers("no digits").is_empty());
    }
}
