//! Core domain model for MVIL: postings, dedupe mappings and role baselines.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mvil-core";

/// Families with fewer qualifying postings than this emit no baseline rows.
pub const MIN_FAMILY_POSTINGS: usize = 3;
/// Families at or above this size are no longer flagged low-confidence.
pub const CONFIDENT_FAMILY_POSTINGS: usize = 10;
pub const MAX_SAMPLE_JOB_IDS: usize = 10;
/// Role family assigned to titles no taxonomy rule recognizes. Never aggregated.
pub const OTHER_ROLE_FAMILY: &str = "other";

pub fn is_low_confidence(count_total_jobs_used: usize) -> bool {
    (MIN_FAMILY_POSTINGS..CONFIDENT_FAMILY_POSTINGS).contains(&count_total_jobs_used)
}

/// Scraper handoff contract. Only `url`, `title` and `description` are guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skills: Option<JsonValue>,
    #[serde(default)]
    pub education: Option<JsonValue>,
    #[serde(default)]
    pub experience: Option<JsonValue>,
    #[serde(default)]
    pub salary: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EducationLevel {
    #[serde(rename = "Certificate/Diploma")]
    CertificateDiploma,
    #[serde(rename = "Bachelor's")]
    Bachelors,
    #[serde(rename = "Master's")]
    Masters,
    #[serde(rename = "PhD")]
    Phd,
    #[serde(rename = "Not specified")]
    NotSpecified,
}

impl EducationLevel {
    pub const ALL: [EducationLevel; 5] = [
        EducationLevel::CertificateDiploma,
        EducationLevel::Bachelors,
        EducationLevel::Masters,
        EducationLevel::Phd,
        EducationLevel::NotSpecified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EducationLevel::CertificateDiploma => "Certificate/Diploma",
            EducationLevel::Bachelors => "Bachelor's",
            EducationLevel::Masters => "Master's",
            EducationLevel::Phd => "PhD",
            EducationLevel::NotSpecified => "Not specified",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == label)
    }

    /// Ordering used when one posting lists several qualifications.
    pub fn rank(&self) -> u8 {
        match self {
            EducationLevel::NotSpecified => 0,
            EducationLevel::CertificateDiploma => 1,
            EducationLevel::Bachelors => 2,
            EducationLevel::Masters => 3,
            EducationLevel::Phd => 4,
        }
    }
}

impl fmt::Display for EducationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExperienceBand {
    #[serde(rename = "0-2")]
    ZeroToTwo,
    #[serde(rename = "3-5")]
    ThreeToFive,
    #[serde(rename = "5-10")]
    FiveToTen,
    #[serde(rename = "10+")]
    TenPlus,
    #[serde(rename = "Not specified")]
    NotSpecified,
}

impl ExperienceBand {
    pub const ALL: [ExperienceBand; 5] = [
        ExperienceBand::ZeroToTwo,
        ExperienceBand::ThreeToFive,
        ExperienceBand::FiveToTen,
        ExperienceBand::TenPlus,
        ExperienceBand::NotSpecified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceBand::ZeroToTwo => "0-2",
            ExperienceBand::ThreeToFive => "3-5",
            ExperienceBand::FiveToTen => "5-10",
            ExperienceBand::TenPlus => "10+",
            ExperienceBand::NotSpecified => "Not specified",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|band| band.as_str() == label)
    }

    /// Plain conditional binning; boundaries are inclusive on the upper end
    /// except for the open-ended top band.
    pub fn from_years(years: f64) -> Self {
        if !years.is_finite() || years < 0.0 {
            ExperienceBand::NotSpecified
        } else if years <= 2.0 {
            ExperienceBand::ZeroToTwo
        } else if years <= 5.0 {
            ExperienceBand::ThreeToFive
        } else if years < 10.0 {
            ExperienceBand::FiveToTen
        } else {
            ExperienceBand::TenPlus
        }
    }

    pub fn midpoint_years(&self) -> Option<f64> {
        match self {
            ExperienceBand::ZeroToTwo => Some(1.0),
            ExperienceBand::ThreeToFive => Some(4.0),
            ExperienceBand::FiveToTen => Some(7.5),
            ExperienceBand::TenPlus => Some(12.0),
            ExperienceBand::NotSpecified => None,
        }
    }
}

impl fmt::Display for ExperienceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized experience requirement: numeric years, or a qualitative band kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Experience {
    Years(f64),
    Band(ExperienceBand),
}

impl Experience {
    pub fn band(&self) -> ExperienceBand {
        match self {
            Experience::Years(years) => ExperienceBand::from_years(*years),
            Experience::Band(band) => *band,
        }
    }

    pub fn years(&self) -> Option<f64> {
        match self {
            Experience::Years(years) => Some(*years),
            Experience::Band(band) => band.midpoint_years(),
        }
    }
}

/// Normalized `(title, company, location)` compared by the fuzzy duplicate
/// layer. Computed once at ingestion and stored with the posting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzyKey {
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
}

/// One job advertisement, raw on ingestion and normalized in place afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub url: String,
    pub url_normalized: String,
    pub title_raw: String,
    pub title_normalized: Option<String>,
    pub role_family: Option<String>,
    pub company: Option<String>,
    pub location_raw: Option<String>,
    pub location_normalized: Option<String>,
    pub description: String,
    pub skills_raw: Option<JsonValue>,
    /// Canonical skill names, sorted and unique.
    #[serde(default)]
    pub skills: Vec<String>,
    pub education_raw: Option<JsonValue>,
    pub education_level: Option<EducationLevel>,
    pub experience_raw: Option<JsonValue>,
    pub experience: Option<Experience>,
    pub salary: Option<JsonValue>,
    pub posted_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub quality_score: Option<f64>,
    pub canonical_posting_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_signature: Vec<u64>,
    #[serde(default)]
    pub fuzzy_key: FuzzyKey,
}

impl Posting {
    /// Unprocessed posting; `first_seen` is the scrape time, not the advertised date.
    pub fn from_raw(id: Uuid, raw: RawPosting, seen_at: DateTime<Utc>) -> Self {
        Self {
            id,
            url_normalized: String::new(),
            url: raw.url,
            title_raw: raw.title,
            title_normalized: None,
            role_family: None,
            company: raw.company,
            location_raw: raw.location,
            location_normalized: None,
            description: raw.description,
            skills_raw: raw.skills,
            skills: Vec::new(),
            education_raw: raw.education,
            education_level: None,
            experience_raw: raw.experience,
            experience: None,
            salary: raw.salary,
            posted_at: raw.posted_at,
            first_seen: seen_at,
            last_seen: seen_at,
            is_active: true,
            quality_score: None,
            canonical_posting_id: None,
            content_signature: Vec::new(),
            fuzzy_key: FuzzyKey::default(),
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.canonical_posting_id == Some(self.id)
    }

    /// Monotonic: an older sighting never moves `last_seen` backwards.
    pub fn mark_seen(&mut self, seen_at: DateTime<Utc>) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    pub fn skill_set(&self) -> BTreeSet<&str> {
        self.skills.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactUrl,
    FuzzyTitle,
    ContentSimilarity,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExactUrl => "exact_url",
            MatchStrategy::FuzzyTitle => "fuzzy_title",
            MatchStrategy::ContentSimilarity => "content_similarity",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "exact_url" => Some(MatchStrategy::ExactUrl),
            "fuzzy_title" => Some(MatchStrategy::FuzzyTitle),
            "content_similarity" => Some(MatchStrategy::ContentSimilarity),
            _ => None,
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a posting onto its canonical representative. Exactly one per posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub posting_id: Uuid,
    pub canonical_posting_id: Uuid,
    pub similarity_score: f64,
    pub match_strategy: MatchStrategy,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only meaningful on self-mapping rows: how many duplicates pointed here.
    pub repost_count: u32,
}

impl DedupeRecord {
    pub fn self_mapping(posting_id: Uuid, detected_at: DateTime<Utc>) -> Self {
        Self {
            posting_id,
            canonical_posting_id: posting_id,
            similarity_score: 1.0,
            match_strategy: MatchStrategy::ExactUrl,
            detected_at,
            updated_at: detected_at,
            repost_count: 0,
        }
    }

    pub fn duplicate_of(
        posting_id: Uuid,
        canonical_posting_id: Uuid,
        similarity_score: f64,
        match_strategy: MatchStrategy,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            posting_id,
            canonical_posting_id,
            similarity_score: similarity_score.clamp(0.0, 1.0),
            match_strategy,
            detected_at,
            updated_at: detected_at,
            repost_count: 0,
        }
    }

    pub fn is_self_mapping(&self) -> bool {
        self.posting_id == self.canonical_posting_id
    }
}

/// Evidence and confidence fields shared by every baseline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEvidence {
    /// Recency-first; order is part of the contract.
    pub sample_job_ids: Vec<Uuid>,
    pub count_total_jobs_used: u32,
    pub computed_at: DateTime<Utc>,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillBaseline {
    pub role_family: String,
    pub skill_name: String,
    pub frequency: f64,
    pub count_ads: u32,
    #[serde(flatten)]
    pub evidence: BaselineEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducationBaseline {
    pub role_family: String,
    pub education_level: EducationLevel,
    pub share: f64,
    pub count_ads: u32,
    #[serde(flatten)]
    pub evidence: BaselineEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceBaseline {
    pub role_family: String,
    pub experience_band: ExperienceBand,
    pub share: f64,
    pub count_ads: u32,
    #[serde(flatten)]
    pub evidence: BaselineEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSnapshot {
    pub role_family: String,
    pub date: NaiveDate,
    pub count_ads: u32,
    pub unique_employers: u32,
    #[serde(flatten)]
    pub evidence: BaselineEvidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineKind {
    Skill,
    Education,
    Experience,
    Demand,
}

impl BaselineKind {
    pub const ALL: [BaselineKind; 4] = [
        BaselineKind::Skill,
        BaselineKind::Education,
        BaselineKind::Experience,
        BaselineKind::Demand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineKind::Skill => "skill",
            BaselineKind::Education => "education",
            BaselineKind::Experience => "experience",
            BaselineKind::Demand => "demand",
        }
    }
}

impl fmt::Display for BaselineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete output of one aggregation pass, staged before commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineSet {
    pub skill: Vec<SkillBaseline>,
    pub education: Vec<EducationBaseline>,
    pub experience: Vec<ExperienceBaseline>,
    pub demand: Vec<DemandSnapshot>,
}

impl BaselineSet {
    pub fn rows_written(&self) -> usize {
        self.skill.len() + self.education.len() + self.experience.len() + self.demand.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows_written() == 0
    }

    /// Families that produced a demand snapshot, i.e. every emitted family.
    pub fn role_families(&self) -> BTreeSet<String> {
        self.demand.iter().map(|d| d.role_family.clone()).collect()
    }

    pub fn low_confidence_families(&self) -> BTreeSet<String> {
        self.demand
            .iter()
            .filter(|d| d.evidence.low_confidence)
            .map(|d| d.role_family.clone())
            .collect()
    }

    pub fn extend(&mut self, other: BaselineSet) {
        self.skill.extend(other.skill);
        self.education.extend(other.education);
        self.experience.extend(other.experience);
        self.demand.extend(other.demand);
    }

    pub fn for_family(&self, role_family: &str) -> Option<FamilyBaselines> {
        let demand = self
            .demand
            .iter()
            .find(|d| d.role_family == role_family)?
            .clone();
        Some(FamilyBaselines {
            role_family: role_family.to_string(),
            low_confidence: demand.evidence.low_confidence,
            skill: self
                .skill
                .iter()
                .filter(|r| r.role_family == role_family)
                .cloned()
                .collect(),
            education: self
                .education
                .iter()
                .filter(|r| r.role_family == role_family)
                .cloned()
                .collect(),
            experience: self
                .experience
                .iter()
                .filter(|r| r.role_family == role_family)
                .cloned()
                .collect(),
            demand,
        })
    }
}

/// All four baselines for one role family, as read by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyBaselines {
    pub role_family: String,
    pub low_confidence: bool,
    pub skill: Vec<SkillBaseline>,
    pub education: Vec<EducationBaseline>,
    pub experience: Vec<ExperienceBaseline>,
    pub demand: DemandSnapshot,
}

/// Bookkeeping for one committed refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRun {
    pub run_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub rows_written: u64,
    pub families_processed: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub rows_written: usize,
    pub families_processed: usize,
    pub low_confidence_families: Vec<String>,
    pub computed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RefreshSummary {
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn low_confidence_window_is_three_to_nine() {
        assert!(!is_low_confidence(2));
        assert!(is_low_confidence(3));
        assert!(is_low_confidence(9));
        assert!(!is_low_confidence(10));
    }

    #[test]
    fn experience_bins_use_fixed_boundaries() {
        assert_eq!(ExperienceBand::from_years(0.0), ExperienceBand::ZeroToTwo);
        assert_eq!(ExperienceBand::from_years(2.0), ExperienceBand::ZeroToTwo);
        assert_eq!(ExperienceBand::from_years(3.0), ExperienceBand::ThreeToFive);
        assert_eq!(ExperienceBand::from_years(5.0), ExperienceBand::ThreeToFive);
        assert_eq!(ExperienceBand::from_years(7.0), ExperienceBand::FiveToTen);
        assert_eq!(ExperienceBand::from_years(10.0), ExperienceBand::TenPlus);
        assert_eq!(ExperienceBand::from_years(-1.0), ExperienceBand::NotSpecified);
        assert_eq!(Experience::Band(ExperienceBand::TenPlus).years(), Some(12.0));
    }

    #[test]
    fn labels_round_trip_through_from_label() {
        for level in EducationLevel::ALL {
            assert_eq!(EducationLevel::from_label(level.as_str()), Some(level));
        }
        for band in ExperienceBand::ALL {
            assert_eq!(ExperienceBand::from_label(band.as_str()), Some(band));
        }
        let json = serde_json::to_string(&EducationLevel::Bachelors).unwrap();
        assert_eq!(json, "\"Bachelor's\"");
    }

    #[test]
    fn mark_seen_never_moves_backwards() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).single().unwrap();
        let raw = RawPosting {
            url: "https://jobs.example.com/1".into(),
            title: "Data Analyst".into(),
            company: None,
            description: String::new(),
            location: None,
            posted_at: None,
            skills: None,
            education: None,
            experience: None,
            salary: None,
        };
        let mut posting = Posting::from_raw(Uuid::new_v4(), raw, t1);
        posting.mark_seen(t0);
        assert_eq!(posting.last_seen, t1);
        assert!(posting.last_seen >= posting.first_seen);
    }
}
