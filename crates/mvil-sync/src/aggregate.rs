//! Per-family baselines: skill frequency, education and experience shares, demand.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use mvil_core::{
    is_low_confidence, BaselineEvidence, BaselineKind, BaselineSet, DemandSnapshot,
    EducationBaseline, EducationLevel, ExperienceBand, ExperienceBaseline, Posting, SkillBaseline,
    MAX_SAMPLE_JOB_IDS, MIN_FAMILY_POSTINGS, OTHER_ROLE_FAMILY,
};
use mvil_normalize::normalize_text;

use crate::refresh::AggregationError;

/// Qualifying postings of one role family, ordered most recently seen first
/// (ties by id) so evidence sampling is deterministic.
#[derive(Debug, Clone)]
pub struct FamilySample {
    pub role_family: String,
    pub postings: Vec<Posting>,
    pub computed_at: DateTime<Utc>,
}

impl FamilySample {
    pub fn new(role_family: impl Into<String>, mut postings: Vec<Posting>, computed_at: DateTime<Utc>) -> Self {
        postings.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        Self {
            role_family: role_family.into(),
            postings,
            computed_at,
        }
    }

    pub fn total(&self) -> usize {
        self.postings.len()
    }

    /// Evidence for a row backed by the postings matching `contributes`.
    fn evidence(&self, contributes: impl Fn(&Posting) -> bool) -> BaselineEvidence {
        BaselineEvidence {
            sample_job_ids: self
                .postings
                .iter()
                .filter(|p| p.is_active && contributes(p))
                .take(MAX_SAMPLE_JOB_IDS)
                .map(|p| p.id)
                .collect(),
            count_total_jobs_used: self.total() as u32,
            computed_at: self.computed_at,
            low_confidence: is_low_confidence(self.total()),
        }
    }

    fn share(&self, count: usize) -> f64 {
        count as f64 / self.total() as f64
    }
}

/// Active, canonical, above the quality floor and in a recognized family.
pub fn is_qualifying(posting: &Posting, quality_floor: f64) -> bool {
    posting.is_active
        && posting.is_canonical()
        && posting.quality_score.map(|q| q > quality_floor).unwrap_or(false)
        && posting
            .role_family
            .as_deref()
            .map(|f| !f.is_empty() && f != OTHER_ROLE_FAMILY)
            .unwrap_or(false)
}

/// Groups qualifying postings by family, dropping families below the minimum size.
pub fn family_samples(
    postings: Vec<Posting>,
    quality_floor: f64,
    computed_at: DateTime<Utc>,
) -> Vec<FamilySample> {
    let mut by_family: BTreeMap<String, Vec<Posting>> = BTreeMap::new();
    for posting in postings {
        if !is_qualifying(&posting, quality_floor) {
            continue;
        }
        if let Some(family) = posting.role_family.clone() {
            by_family.entry(family).or_default().push(posting);
        }
    }
    by_family
        .into_iter()
        .filter(|(_, postings)| postings.len() >= MIN_FAMILY_POSTINGS)
        .map(|(family, postings)| FamilySample::new(family, postings, computed_at))
        .collect()
}

/// One computation stage for one family. The refresh manager drives stages
/// through this seam; failing any stage aborts the whole refresh.
pub trait BaselineComputer: Send + Sync {
    fn compute_stage(&self, stage: BaselineKind, family: &FamilySample) -> Result<BaselineSet, AggregationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAggregator;

impl RoleAggregator {
    pub fn skill_baseline(&self, family: &FamilySample) -> Vec<SkillBaseline> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for posting in &family.postings {
            for skill in posting.skill_set() {
                *counts.entry(skill).or_default() += 1;
            }
        }
        let mut rows = counts
            .into_iter()
            .map(|(skill, count)| SkillBaseline {
                role_family: family.role_family.clone(),
                skill_name: skill.to_string(),
                frequency: family.share(count),
                count_ads: count as u32,
                evidence: family.evidence(|p| p.skills.iter().any(|s| s == skill)),
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.count_ads.cmp(&a.count_ads).then_with(|| a.skill_name.cmp(&b.skill_name)));
        rows
    }

    pub fn education_baseline(&self, family: &FamilySample) -> Vec<EducationBaseline> {
        let level_of = |p: &Posting| p.education_level.unwrap_or(EducationLevel::NotSpecified);
        EducationLevel::ALL
            .into_iter()
            .filter_map(|level| {
                let count = family.postings.iter().filter(|p| level_of(p) == level).count();
                (count > 0).then(|| EducationBaseline {
                    role_family: family.role_family.clone(),
                    education_level: level,
                    share: family.share(count),
                    count_ads: count as u32,
                    evidence: family.evidence(|p| level_of(p) == level),
                })
            })
            .collect()
    }

    pub fn experience_baseline(&self, family: &FamilySample) -> Vec<ExperienceBaseline> {
        let band_of = |p: &Posting| {
            p.experience
                .map(|e| e.band())
                .unwrap_or(ExperienceBand::NotSpecified)
        };
        ExperienceBand::ALL
            .into_iter()
            .filter_map(|band| {
                let count = family.postings.iter().filter(|p| band_of(p) == band).count();
                (count > 0).then(|| ExperienceBaseline {
                    role_family: family.role_family.clone(),
                    experience_band: band,
                    share: family.share(count),
                    count_ads: count as u32,
                    evidence: family.evidence(|p| band_of(p) == band),
                })
            })
            .collect()
    }

    pub fn demand_snapshot(&self, family: &FamilySample) -> DemandSnapshot {
        let active = family.postings.iter().filter(|p| p.is_active).count();
        let employers = family
            .postings
            .iter()
            .filter(|p| p.is_active)
            .filter_map(|p| p.company.as_deref().map(normalize_text))
            .filter(|c| !c.is_empty())
            .collect::<BTreeSet<_>>();
        DemandSnapshot {
            role_family: family.role_family.clone(),
            date: family.computed_at.date_naive(),
            count_ads: active as u32,
            unique_employers: employers.len() as u32,
            evidence: family.evidence(|_| true),
        }
    }

    /// All four baselines over `postings`, as one pure pass.
    pub fn compute_baselines(
        &self,
        postings: Vec<Posting>,
        quality_floor: f64,
        computed_at: DateTime<Utc>,
    ) -> BaselineSet {
        let mut set = BaselineSet::default();
        for family in family_samples(postings, quality_floor, computed_at) {
            set.skill.extend(self.skill_baseline(&family));
            set.education.extend(self.education_baseline(&family));
            set.experience.extend(self.experience_baseline(&family));
            set.demand.push(self.demand_snapshot(&family));
        }
        set
    }
}

impl BaselineComputer for RoleAggregator {
    fn compute_stage(&self, stage: BaselineKind, family: &FamilySample) -> Result<BaselineSet, AggregationError> {
        let mut set = BaselineSet::default();
        match stage {
            BaselineKind::Skill => set.skill = self.skill_baseline(family),
            BaselineKind::Education => set.education = self.education_baseline(family),
            BaselineKind::Experience => set.experience = self.experience_baseline(family),
            BaselineKind::Demand => set.demand.push(self.demand_snapshot(family)),
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mvil_core::{Experience, RawPosting};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 3, 0, 0).single().unwrap()
    }

    fn posting(family: &str, days_ago: i64, skills: &[&str]) -> Posting {
        let seen = now() - Duration::days(days_ago);
        let mut p = Posting::from_raw(
            Uuid::new_v4(),
            RawPosting {
                url: format!("https://x.io/{}", Uuid::new_v4()),
                title: "t".into(),
                company: Some("Acme".into()),
                description: String::new(),
                location: None,
                posted_at: None,
                skills: None,
                education: None,
                experience: None,
                salary: None,
            },
            seen,
        );
        p.canonical_posting_id = Some(p.id);
        p.role_family = Some(family.into());
        p.quality_score = Some(0.9);
        p.skills = skills.iter().map(|s| s.to_string()).collect();
        p
    }

    #[test]
    fn qualifying_excludes_other_inactive_duplicates_and_low_quality() {
        let ok = posting("sales", 1, &[]);
        assert!(is_qualifying(&ok, 0.4));

        let mut other = ok.clone();
        other.role_family = Some(OTHER_ROLE_FAMILY.into());
        let mut inactive = ok.clone();
        inactive.is_active = false;
        let mut duplicate = ok.clone();
        duplicate.canonical_posting_id = Some(Uuid::new_v4());
        let mut weak = ok.clone();
        weak.quality_score = Some(0.4);
        for p in [other, inactive, duplicate, weak] {
            assert!(!is_qualifying(&p, 0.4));
        }
    }

    #[test]
    fn family_size_boundaries() {
        let postings = (0..2)
            .map(|i| posting("two", i, &[]))
            .chain((0..3).map(|i| posting("three", i, &[])))
            .chain((0..10).map(|i| posting("ten", i, &[])))
            .collect::<Vec<_>>();
        let set = RoleAggregator.compute_baselines(postings, 0.4, now());

        assert!(set.for_family("two").is_none());
        assert!(set.for_family("three").unwrap().low_confidence);
        assert!(!set.for_family("ten").unwrap().low_confidence);
        assert!(set.education.iter().all(|r| r.role_family != "two"));
    }

    #[test]
    fn skill_frequency_and_evidence_order() {
        let postings = vec![
            posting("data_analytics", 5, &["excel", "sql"]),
            posting("data_analytics", 1, &["excel"]),
            posting("data_analytics", 3, &["excel", "python"]),
            posting("data_analytics", 2, &[]),
        ];
        let expected_order = {
            let mut ps = postings.iter().filter(|p| p.skills.contains(&"excel".into())).collect::<Vec<_>>();
            ps.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            ps.into_iter().map(|p| p.id).collect::<Vec<_>>()
        };

        let set = RoleAggregator.compute_baselines(postings, 0.4, now());
        let excel = &set.skill[0];
        assert_eq!(excel.skill_name, "excel");
        assert_eq!(excel.count_ads, 3);
        assert_eq!(excel.frequency, 0.75);
        assert_eq!(excel.evidence.count_total_jobs_used, 4);
        assert_eq!(excel.evidence.sample_job_ids, expected_order);
        assert_eq!(set.skill.len(), 3);
    }

    #[test]
    fn shares_cover_not_specified_and_sum_to_one() {
        let mut postings = (0..4).map(|i| posting("finance", i, &[])).collect::<Vec<_>>();
        postings[0].education_level = Some(EducationLevel::Masters);
        postings[1].education_level = Some(EducationLevel::Bachelors);
        postings[2].experience = Some(Experience::Years(12.0));
        postings[3].experience = Some(Experience::Band(ExperienceBand::ZeroToTwo));

        let set = RoleAggregator.compute_baselines(postings, 0.4, now());
        let education_total: f64 = set.education.iter().map(|r| r.share).sum();
        let experience_total: f64 = set.experience.iter().map(|r| r.share).sum();
        assert!((education_total - 1.0).abs() < 1e-9);
        assert!((experience_total - 1.0).abs() < 1e-9);
        let unspecified = set
            .education
            .iter()
            .find(|r| r.education_level == EducationLevel::NotSpecified)
            .unwrap();
        assert_eq!(unspecified.count_ads, 2);
        assert_eq!(unspecified.evidence.sample_job_ids.len(), 2);
    }

    #[test]
    fn demand_counts_distinct_employers_and_caps_evidence() {
        let mut postings = (0..12).map(|i| posting("sales", i, &[])).collect::<Vec<_>>();
        postings[0].company = Some("  GLOBEX ".into());
        postings[1].company = Some("globex".into());
        postings[2].company = None;

        let set = RoleAggregator.compute_baselines(postings, 0.4, now());
        let demand = &set.demand[0];
        assert_eq!(demand.count_ads, 12);
        assert_eq!(demand.unique_employers, 2);
        assert_eq!(demand.date, now().date_naive());
        assert_eq!(demand.evidence.sample_job_ids.len(), MAX_SAMPLE_JOB_IDS);
    }

    #[test]
    fn identical_input_gives_identical_output() {
        let postings = (0..6)
            .map(|i| posting("design", i % 2, &["figma"]))
            .collect::<Vec<_>>();
        let a = RoleAggregator.compute_baselines(postings.clone(), 0.4, now());
        let mut reversed = postings;
        reversed.reverse();
        let b = RoleAggregator.compute_baselines(reversed, 0.4, now());
        assert_eq!(a, b);
    }
}
