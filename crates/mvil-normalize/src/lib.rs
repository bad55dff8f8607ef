//! Canonicalization library + quality scorer for MVIL.
//!
//! Every function here is pure and total: malformed input degrades to a defined
//! default (unchanged string, `Not specified`, `None`) and is logged, never raised.

mod alias;
mod canonical_url;
mod education;
mod experience;
mod location;
mod quality;
mod skills;
mod taxonomy;
mod title;

pub use alias::{canonicalize, normalize_text, AliasTable};
pub use canonical_url::{is_tracking_param, normalize_url, TRACKING_PARAMS};
pub use education::normalize_education;
pub use experience::{extract_numbers, normalize_experience, parse_experience};
pub use location::normalize_location;
pub use quality::{
    QualityScorer, DESCRIPTION_CAP_CHARS, DESCRIPTION_WEIGHT, MIN_SKILLS_FOR_CREDIT,
    ORGANIZATION_WEIGHT, SALARY_WEIGHT, SKILLS_WEIGHT, TITLE_WEIGHT,
};
pub use skills::{KeyedSkill, MalformedInput, SkillsField};
pub use taxonomy::{FamilyKeywordRule, Taxonomy, TaxonomyError, TitleEntry};
pub use title::TitleMatch;

pub const CRATE_NAME: &str = "mvil-normalize";
