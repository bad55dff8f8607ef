use std::collections::BTreeSet;

use mvil_core::Posting;
use serde_json::Value as JsonValue;

use crate::alias::normalize_text;
use crate::skills::SkillsField;
use crate::taxonomy::Taxonomy;

pub const TITLE_WEIGHT: f64 = 0.25;
pub const DESCRIPTION_WEIGHT: f64 = 0.35;
pub const DESCRIPTION_CAP_CHARS: usize = 800;
pub const SKILLS_WEIGHT: f64 = 0.20;
pub const MIN_SKILLS_FOR_CREDIT: usize = 5;
pub const ORGANIZATION_WEIGHT: f64 = 0.10;
pub const SALARY_WEIGHT: f64 = 0.10;

/// Completeness/trust score in `[0, 1]`. Fixed weights; pure and idempotent.
#[derive(Debug, Clone, Copy)]
pub struct QualityScorer<'a> {
    taxonomy: &'a Taxonomy,
}

fn has_content(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(items) => items.iter().any(has_content),
        JsonValue::Object(map) => map.values().any(has_content),
        JsonValue::Number(n) => n.as_f64().map(|v| v > 0.0).unwrap_or(false),
        JsonValue::Bool(b) => *b,
    }
}

impl<'a> QualityScorer<'a> {
    pub fn new(taxonomy: &'a Taxonomy) -> Self {
        Self { taxonomy }
    }

    /// Distinct skill names, counted from the normalized list when present and
    /// from the raw field otherwise (scoring runs before canonicalization).
    fn skills_extracted(posting: &Posting) -> usize {
        if !posting.skills.is_empty() {
            return posting.skills.len();
        }
        posting
            .skills_raw
            .as_ref()
            .and_then(|raw| SkillsField::from_value(raw).ok())
            .map(|field| {
                field
                    .names()
                    .into_iter()
                    .map(normalize_text)
                    .filter(|n| !n.is_empty())
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn score(&self, posting: &Posting) -> f64 {
        let mut score = 0.0;

        if !self.taxonomy.is_generic_title(&posting.title_raw) {
            score += TITLE_WEIGHT;
        }

        let description_chars = posting.description.trim().chars().count();
        score += DESCRIPTION_WEIGHT
            * (description_chars.min(DESCRIPTION_CAP_CHARS) as f64 / DESCRIPTION_CAP_CHARS as f64);

        if Self::skills_extracted(posting) >= MIN_SKILLS_FOR_CREDIT {
            score += SKILLS_WEIGHT;
        }

        if posting
            .company
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
        {
            score += ORGANIZATION_WEIGHT;
        }

        if posting.salary.as_ref().map(has_content).unwrap_or(false) {
            score += SALARY_WEIGHT;
        }

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mvil_core::RawPosting;
    use serde_json::json;
    use uuid::Uuid;

    fn posting(title: &str, description: &str) -> Posting {
        Posting::from_raw(
            Uuid::new_v4(),
            RawPosting {
                url: "https://jobs.example.com/1".into(),
                title: title.into(),
                company: None,
                description: description.into(),
                location: None,
                posted_at: None,
                skills: None,
                education: None,
                experience: None,
                salary: None,
            },
            Utc::now(),
        )
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn weights_sum_to_one() {
        let total = TITLE_WEIGHT + DESCRIPTION_WEIGHT + SKILLS_WEIGHT + ORGANIZATION_WEIGHT + SALARY_WEIGHT;
        assert!(approx(total, 1.0));
    }

    #[test]
    fn complete_posting_scores_one() {
        let taxonomy = Taxonomy::builtin();
        let mut p = posting("Data Analyst", &"x".repeat(1200));
        p.company = Some("Acme".into());
        p.salary = Some(json!({"min": 300000, "currency": "NGN"}));
        p.skills_raw = Some(json!(["sql", "excel", "python", "tableau", "power bi"]));
        let score = QualityScorer::new(&taxonomy).score(&p);
        assert!(approx(score, 1.0), "{score}");
    }

    #[test]
    fn missing_fields_contribute_nothing() {
        let taxonomy = Taxonomy::builtin();
        let scorer = QualityScorer::new(&taxonomy);
        assert!(approx(scorer.score(&posting("Vacancy", "")), 0.0));
        assert!(approx(scorer.score(&posting("", "")), 0.0));

        let half_description = posting("Data Analyst", &"y".repeat(400));
        assert!(approx(scorer.score(&half_description), TITLE_WEIGHT + DESCRIPTION_WEIGHT / 2.0));
    }

    #[test]
    fn four_skills_earn_no_skill_credit_and_scoring_is_idempotent() {
        let taxonomy = Taxonomy::builtin();
        let scorer = QualityScorer::new(&taxonomy);
        let mut p = posting("Careers", "");
        p.skills_raw = Some(json!({"sql": 1, "SQL": 1, "excel": 1, "python": 1, "r": 1}));
        assert!(approx(scorer.score(&p), 0.0));
        p.skills_raw = Some(json!("not a list"));
        assert_eq!(scorer.score(&p), scorer.score(&p));
    }
}
