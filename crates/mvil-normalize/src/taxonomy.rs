use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use mvil_core::{EducationLevel, Experience, Posting};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::alias::{canonicalize, normalize_text, AliasTable};
use crate::skills::SkillsField;
use crate::title::{self, TitleMatch};
use crate::{education, experience, location};

const BUILTIN_TAXONOMY: &str = include_str!("../taxonomy/default.yaml");

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("reading taxonomy {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("alias cycle in {table} table involving {alias:?}")]
    AliasCycle { table: &'static str, alias: String },
    #[error("canonical title {title:?} has no role family")]
    MissingFamily { title: String },
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    skills: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    titles: Vec<TitleEntry>,
    #[serde(default)]
    family_keywords: Vec<FamilyKeywordRule>,
    #[serde(default)]
    generic_titles: Vec<String>,
    #[serde(default)]
    title_boilerplate: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TitleEntry {
    pub title: String,
    pub family: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Keyword fallback applied when no title alias matches; first rule wins.
#[derive(Debug, Clone, Deserialize)]
pub struct FamilyKeywordRule {
    pub family: String,
    pub title: String,
    pub contains_any: Vec<String>,
}

/// Loaded alias/taxonomy tables. Passed explicitly to every normalizer.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    skills: AliasTable,
    titles: AliasTable,
    /// normalized canonical title -> (display title, role family)
    title_families: BTreeMap<String, (String, String)>,
    family_keywords: Vec<FamilyKeywordRule>,
    generic_titles: BTreeSet<String>,
    title_boilerplate: Vec<Vec<String>>,
}

impl Taxonomy {
    /// The compiled-in default taxonomy.
    pub fn builtin() -> Self {
        Self::from_yaml_str(BUILTIN_TAXONOMY).expect("builtin taxonomy is valid")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        Self::from_file(file)
    }

    fn from_file(file: TaxonomyFile) -> Result<Self, TaxonomyError> {
        let skill_pairs = file.skills.iter().flat_map(|(canonical, aliases)| {
            aliases
                .iter()
                .map(move |alias| (alias.as_str(), canonical.as_str()))
        });
        let skills = AliasTable::from_pairs(skill_pairs)
            .map_err(|alias| TaxonomyError::AliasCycle { table: "skills", alias })?;

        let boilerplate = file
            .title_boilerplate
            .iter()
            .map(|phrase| title::tokens(phrase))
            .filter(|tokens| !tokens.is_empty())
            .collect::<Vec<_>>();

        let mut title_families = BTreeMap::new();
        let mut title_pairs = Vec::new();
        for entry in &file.titles {
            let key = title::clean_title(&entry.title, &boilerplate);
            if entry.family.trim().is_empty() {
                return Err(TaxonomyError::MissingFamily {
                    title: entry.title.clone(),
                });
            }
            title_families.insert(
                key.clone(),
                (entry.title.trim().to_string(), normalize_text(&entry.family)),
            );
            for alias in &entry.aliases {
                title_pairs.push((title::clean_title(alias, &boilerplate), key.clone()));
            }
        }
        let titles = AliasTable::from_pairs(title_pairs)
            .map_err(|alias| TaxonomyError::AliasCycle { table: "titles", alias })?;
        for canonical in titles.canonical_values() {
            if !title_families.contains_key(canonical) {
                return Err(TaxonomyError::MissingFamily {
                    title: canonical.to_string(),
                });
            }
        }

        let family_keywords = file
            .family_keywords
            .into_iter()
            .map(|rule| FamilyKeywordRule {
                family: normalize_text(&rule.family),
                title: rule.title.trim().to_string(),
                contains_any: rule
                    .contains_any
                    .iter()
                    .map(|k| title::clean_title(k, &[]))
                    .filter(|k| !k.is_empty())
                    .collect(),
            })
            .collect();

        let generic_titles = file
            .generic_titles
            .iter()
            .map(|t| title::clean_title(t, &[]))
            .filter(|t| !t.is_empty())
            .collect();

        Ok(Self {
            skills,
            titles,
            title_families,
            family_keywords,
            generic_titles,
            title_boilerplate: boilerplate,
        })
    }

    pub fn skill_aliases(&self) -> &AliasTable {
        &self.skills
    }

    pub fn canonicalize_skill(&self, name: &str) -> String {
        canonicalize(name, &self.skills)
    }

    /// Canonical, sorted, de-duplicated skill set for a heterogeneous raw field.
    pub fn canonical_skills(&self, raw: Option<&JsonValue>) -> Vec<String> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        let field = match SkillsField::from_value(raw) {
            Ok(field) => field,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed skills field");
                return Vec::new();
            }
        };
        field
            .names()
            .into_iter()
            .map(|name| self.canonicalize_skill(name))
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Title with boilerplate, annotations and punctuation removed. Used for
    /// both family matching and fuzzy duplicate comparison.
    pub fn normalize_title(&self, title: &str) -> String {
        title::clean_title(title, &self.title_boilerplate)
    }

    pub fn canonicalize_title(&self, raw_title: &str) -> TitleMatch {
        let cleaned = self.normalize_title(raw_title);
        if cleaned.is_empty() {
            return TitleMatch::other(cleaned);
        }

        let key = self.titles.lookup(&cleaned).unwrap_or(&cleaned);
        if let Some((display, family)) = self.title_families.get(key) {
            return TitleMatch {
                role_family: family.clone(),
                canonical_title: display.clone(),
            };
        }

        let padded = format!(" {cleaned} ");
        for rule in &self.family_keywords {
            if rule
                .contains_any
                .iter()
                .any(|keyword| padded.contains(&format!(" {keyword}")))
            {
                return TitleMatch {
                    role_family: rule.family.clone(),
                    canonical_title: rule.title.clone(),
                };
            }
        }

        TitleMatch::other(cleaned)
    }

    pub fn is_generic_title(&self, raw_title: &str) -> bool {
        let cleaned = title::clean_title(raw_title, &[]);
        cleaned.is_empty()
            || self.generic_titles.contains(&cleaned)
            || self.generic_titles.contains(&self.normalize_title(raw_title))
    }

    pub fn normalize_education(&self, raw: Option<&JsonValue>) -> EducationLevel {
        education::normalize_education(raw)
    }

    pub fn parse_experience(&self, raw: Option<&JsonValue>) -> Option<Experience> {
        experience::parse_experience(raw)
    }

    /// Fills every normalized field on `posting` from its raw counterparts.
    pub fn normalize_posting(&self, posting: &mut Posting) {
        let title = self.canonicalize_title(&posting.title_raw);
        posting.title_normalized = Some(title.canonical_title);
        posting.role_family = Some(title.role_family);
        posting.location_normalized = posting
            .location_raw
            .as_deref()
            .map(location::normalize_location)
            .filter(|l| !l.is_empty());
        posting.skills = self.canonical_skills(posting.skills_raw.as_ref());
        posting.education_level = Some(self.normalize_education(posting.education_raw.as_ref()));
        posting.experience = self.parse_experience(posting.experience_raw.as_ref());
    }
}
