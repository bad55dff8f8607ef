use mvil_core::EducationLevel;
use serde_json::Value as JsonValue;
use tracing::debug;

const OBJECT_KEYS: &[&str] = &[
    "level",
    "degree",
    "minimum",
    "min_level",
    "required",
    "requirement",
    "education",
    "qualification",
    "name",
    "value",
];

const PHD: &[&str] = &["phd", "doctorate", "doctoral", "dphil", "doctor"];
const MASTERS: &[&str] = &[
    "master", "masters", "msc", "ma", "mba", "meng", "mphil", "mres", "postgraduate", "pgd",
];
/// Words after a bare "ms" that make it a degree rather than "MS Office".
const MS_DEGREE_NEXT: &[&str] = &["in", "degree", "degrees"];
const CONJUNCTIONS: &[&str] = &["or", "and"];
const BACHELORS: &[&str] = &[
    "bachelor",
    "bachelors",
    "bsc",
    "bs",
    "ba",
    "beng",
    "btech",
    "bcom",
    "bed",
    "llb",
    "mbbs",
    "undergraduate",
];
/// A degree of unstated level reads as the first degree.
const GENERIC_DEGREE: &[&str] = &["degree", "university"];
const CERTIFICATE: &[&str] = &[
    "diploma",
    "certificate",
    "certification",
    "hnd",
    "ond",
    "nd",
    "associate",
    "associates",
    "vocational",
    "tvet",
    "ssce",
    "waec",
    "gcse",
];

fn is_degree_word(word: &str) -> bool {
    [PHD, MASTERS, BACHELORS].iter().any(|vocab| vocab.contains(&word))
}

/// "MS" counts only next to other degree vocabulary ("MS in", "BS/MS",
/// "MS or PhD") or on its own.
fn mentions_ms_degree(lowered: &str, words: &[&str]) -> bool {
    if lowered.contains("m.s.") || lowered.contains("m. s.") {
        return true;
    }
    let at = |i: Option<usize>| i.and_then(|i| words.get(i)).copied();
    words.iter().enumerate().any(|(i, w)| {
        if *w != "ms" {
            return false;
        }
        let next = at(Some(i + 1));
        let prev = at(i.checked_sub(1));
        let linked_degree = |link: Option<&str>, beyond: Option<&str>| {
            link.is_some_and(|l| CONJUNCTIONS.contains(&l)) && beyond.is_some_and(is_degree_word)
        };
        words.len() == 1
            || next.is_some_and(|n| MS_DEGREE_NEXT.contains(&n))
            || prev.is_some_and(is_degree_word)
            || linked_degree(next, at(Some(i + 2)))
            || linked_degree(prev, at(i.checked_sub(2)))
    })
}

fn classify_text(text: &str) -> Option<EducationLevel> {
    let lowered = text.to_lowercase();
    let cleaned = lowered
        .replace(['.', '\'', '’'], "")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let words = cleaned.split_whitespace().collect::<Vec<_>>();
    let has = |vocab: &[&str]| words.iter().any(|w| vocab.contains(w));

    // Lowest level mentioned is the entry requirement ("Bachelor's or Master's").
    if has(CERTIFICATE) {
        Some(EducationLevel::CertificateDiploma)
    } else if has(BACHELORS) {
        Some(EducationLevel::Bachelors)
    } else if has(MASTERS) || mentions_ms_degree(&lowered, &words) {
        Some(EducationLevel::Masters)
    } else if has(PHD) {
        Some(EducationLevel::Phd)
    } else if has(GENERIC_DEGREE) {
        Some(EducationLevel::Bachelors)
    } else {
        None
    }
}

fn classify_value(value: &JsonValue) -> Option<EducationLevel> {
    match value {
        JsonValue::String(s) => classify_text(s),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(classify_value)
            .min_by_key(EducationLevel::rank),
        JsonValue::Object(map) => OBJECT_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(classify_value)
            .or_else(|| {
                map.values()
                    .filter(|v| v.is_string())
                    .find_map(classify_value)
            }),
        _ => None,
    }
}

/// Maps any education representation onto the fixed enumeration.
/// Anything unrecognized is `Not specified`.
pub fn normalize_education(raw: Option<&JsonValue>) -> EducationLevel {
    let Some(raw) = raw else {
        return EducationLevel::NotSpecified;
    };
    match classify_value(raw) {
        Some(level) => level,
        None => {
            if !raw.is_null() {
                debug!(raw = %raw, "education not recognized; defaulting to Not specified");
            }
            EducationLevel::NotSpecified
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn level(v: JsonValue) -> EducationLevel {
        normalize_education(Some(&v))
    }

    #[test]
    fn bachelor_variants_collapse() {
        for s in ["BSc", "B.S.", "Bachelor", "Bachelor's degree in Statistics", "B.Sc Economics"] {
            assert_eq!(level(json!(s)), EducationLevel::Bachelors, "{s}");
        }
    }

    #[test]
    fn other_levels() {
        assert_eq!(level(json!("M.S. Computer Science")), EducationLevel::Masters);
        assert_eq!(level(json!("MBA")), EducationLevel::Masters);
        assert_eq!(level(json!("PhD in Physics")), EducationLevel::Phd);
        assert_eq!(level(json!("HND / OND")), EducationLevel::CertificateDiploma);
        assert_eq!(level(json!("Bachelor's or Master's")), EducationLevel::Bachelors);
    }

    #[test]
    fn degree_word_does_not_pull_higher_levels_down() {
        assert_eq!(level(json!("Master's degree in Statistics")), EducationLevel::Masters);
        assert_eq!(level(json!("PhD degree")), EducationLevel::Phd);
        assert_eq!(level(json!("MSc degree")), EducationLevel::Masters);
        assert_eq!(level(json!("Doctoral degree")), EducationLevel::Phd);
        assert_eq!(level(json!("University degree in any field")), EducationLevel::Bachelors);
        assert_eq!(level(json!("Associate degree")), EducationLevel::CertificateDiploma);
    }

    #[test]
    fn ms_needs_degree_context() {
        assert_eq!(level(json!("MS Office proficiency")), EducationLevel::NotSpecified);
        assert_eq!(level(json!("Good with MS Excel and MS Word")), EducationLevel::NotSpecified);
        assert_eq!(level(json!("MS in Computer Science")), EducationLevel::Masters);
        assert_eq!(level(json!("MS or PhD preferred")), EducationLevel::Masters);
        assert_eq!(level(json!("BS/MS")), EducationLevel::Bachelors);
        assert_eq!(level(json!({"level": "MS"})), EducationLevel::Masters);
    }

    #[test]
    fn mappings_and_lists() {
        assert_eq!(level(json!({"level": "MSc", "field": "Data"})), EducationLevel::Masters);
        assert_eq!(level(json!({"notes": "Diploma preferred"})), EducationLevel::CertificateDiploma);
        assert_eq!(level(json!(["PhD", "MSc"])), EducationLevel::Masters);
    }

    #[test]
    fn unparseable_is_not_specified() {
        assert_eq!(normalize_education(None), EducationLevel::NotSpecified);
        for v in [json!(null), json!(""), json!(42), json!({"x": 1}), json!("whatever")] {
            assert_eq!(level(v), EducationLevel::NotSpecified);
        }
    }
}
