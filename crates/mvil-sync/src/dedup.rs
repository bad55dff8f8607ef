//! Layered duplicate resolution: exact URL, then fuzzy composite, then content
//! similarity, else the posting becomes its own canonical.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use mvil_core::{DedupeRecord, FuzzyKey, MatchStrategy, Posting};
use mvil_normalize::{normalize_location, normalize_text, normalize_url, Taxonomy};
use mvil_storage::{CandidateScope, CanonicalCandidate, CorpusStore, StoreError, UniquenessCheck};
use strsim::normalized_levenshtein;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::signature::{content_signature, signature_similarity};

pub const TITLE_FIELD_WEIGHT: f64 = 0.6;
pub const COMPANY_FIELD_WEIGHT: f64 = 0.25;
pub const LOCATION_FIELD_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
    pub content_threshold: f64,
    pub max_conflict_retries: usize,
    /// Only canonicals seen within this many days are fuzzy/content candidates.
    pub candidate_window_days: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.80,
            content_threshold: 0.90,
            max_conflict_retries: 16,
            candidate_window_days: 60,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("corpus index unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("posting {posting_id} still conflicted after {attempts} attempts")]
    RetriesExhausted { posting_id: Uuid, attempts: usize },
}

fn present(value: Option<&str>) -> Option<String> {
    value.map(normalize_text).filter(|v| !v.is_empty())
}

/// A field missing on one side is a disagreement; missing on both, it says nothing.
fn field_similarity(a: &Option<String>, b: &Option<String>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(normalized_levenshtein(a, b)),
        (None, None) => None,
        _ => Some(0.0),
    }
}

/// A mapping plus the candidate set it was decided against.
struct Decision {
    record: DedupeRecord,
    scope: CandidateScope,
    seen: HashSet<Uuid>,
}

pub struct DuplicateResolver {
    config: DedupConfig,
    taxonomy: Arc<Taxonomy>,
}

impl DuplicateResolver {
    pub fn new(config: DedupConfig, taxonomy: Arc<Taxonomy>) -> Self {
        Self { config, taxonomy }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Populates the matching fields persisted with the posting. A posting
    /// that skipped taxonomy normalization still gets a role family, since
    /// candidates are scoped by it.
    pub fn fingerprint(&self, posting: &mut Posting) {
        posting.url_normalized = normalize_url(&posting.url);
        posting.content_signature = content_signature(&posting.description);
        if posting.role_family.is_none() {
            posting.role_family = Some(self.taxonomy.canonicalize_title(&posting.title_raw).role_family);
        }
        posting.fuzzy_key = FuzzyKey {
            title: self.taxonomy.normalize_title(&posting.title_raw),
            company: present(posting.company.as_deref()),
            location: present(posting.location_raw.as_deref().map(normalize_location).as_deref()),
        };
    }

    /// Weighted ratio of title, company and location. Fields absent on both
    /// sides drop out of the weighting; 0.0 without titles.
    fn fuzzy_similarity(a: &FuzzyKey, b: &FuzzyKey) -> f64 {
        if a.title.is_empty() || b.title.is_empty() {
            return 0.0;
        }
        let mut weighted = TITLE_FIELD_WEIGHT * normalized_levenshtein(&a.title, &b.title);
        let mut total = TITLE_FIELD_WEIGHT;
        for (weight, score) in [
            (COMPANY_FIELD_WEIGHT, field_similarity(&a.company, &b.company)),
            (LOCATION_FIELD_WEIGHT, field_similarity(&a.location, &b.location)),
        ] {
            if let Some(score) = score {
                weighted += weight * score;
                total += weight;
            }
        }
        weighted / total
    }

    /// Fuzzy candidates share the posting's role family.
    fn fuzzy_score(posting: &Posting, scope: &CandidateScope, candidate: &CanonicalCandidate) -> Option<f64> {
        (candidate.role_family() == scope.role_family)
            .then(|| Self::fuzzy_similarity(&posting.fuzzy_key, &candidate.fuzzy_key))
    }

    /// Whether `candidate` would have been chosen by either similarity layer.
    fn overlaps(&self, posting: &Posting, scope: &CandidateScope, candidate: &CanonicalCandidate) -> bool {
        candidate.id != posting.id
            && (Self::fuzzy_score(posting, scope, candidate)
                .is_some_and(|s| s >= self.config.fuzzy_threshold)
                || signature_similarity(&posting.content_signature, &candidate.content_signature)
                    .is_some_and(|s| s >= self.config.content_threshold))
    }

    /// Highest-scoring candidate at or above `threshold`. Candidates arrive in
    /// `(first_seen, id)` order and ties keep the earliest, so the choice is stable.
    fn best_match<'c>(
        candidates: &'c [CanonicalCandidate],
        threshold: f64,
        mut score: impl FnMut(&CanonicalCandidate) -> Option<f64>,
    ) -> Option<(&'c CanonicalCandidate, f64)> {
        let mut best: Option<(&CanonicalCandidate, f64)> = None;
        for candidate in candidates {
            let Some(s) = score(candidate) else { continue };
            if s >= threshold && best.map(|(_, b)| s > b).unwrap_or(true) {
                best = Some((candidate, s));
            }
        }
        best
    }

    /// Decides the mapping for `posting` against the current corpus without
    /// writing anything. Store errors propagate; they never mean "unique".
    pub async fn resolve(
        &self,
        posting: &Posting,
        store: &dyn CorpusStore,
    ) -> Result<DedupeRecord, ResolveError> {
        let mut posting = posting.clone();
        self.fingerprint(&mut posting);
        Ok(self.decide(&posting, store).await?.record)
    }

    /// `posting` must already be fingerprinted.
    async fn decide(&self, posting: &Posting, store: &dyn CorpusStore) -> Result<Decision, ResolveError> {
        let seen_at = posting.last_seen;
        let since = seen_at - Duration::days(self.config.candidate_window_days);
        let scope = CandidateScope::of(posting, since);
        let decided = |record: DedupeRecord, seen: HashSet<Uuid>| Decision { record, scope: scope.clone(), seen };

        if !posting.url_normalized.is_empty() {
            if let Some(canonical) = store.find_canonical_by_url(&posting.url_normalized).await? {
                if canonical.id != posting.id {
                    debug!(posting_id = %posting.id, canonical_id = %canonical.id, "exact url match");
                    let record = DedupeRecord::duplicate_of(
                        posting.id,
                        canonical.id,
                        1.0,
                        MatchStrategy::ExactUrl,
                        seen_at,
                    );
                    return Ok(decided(record, HashSet::new()));
                }
            }
        }

        let candidates = store
            .canonical_candidates(&scope)
            .await?
            .into_iter()
            .filter(|c| c.id != posting.id)
            .collect::<Vec<_>>();
        let seen = candidates.iter().map(|c| c.id).collect::<HashSet<_>>();

        let fuzzy = Self::best_match(&candidates, self.config.fuzzy_threshold, |c| {
            Self::fuzzy_score(posting, &scope, c)
        });
        if let Some((canonical, score)) = fuzzy {
            debug!(posting_id = %posting.id, canonical_id = %canonical.id, score, "fuzzy title match");
            let record = DedupeRecord::duplicate_of(
                posting.id,
                canonical.id,
                score,
                MatchStrategy::FuzzyTitle,
                seen_at,
            );
            return Ok(decided(record, seen));
        }

        let content = Self::best_match(&candidates, self.config.content_threshold, |c| {
            signature_similarity(&posting.content_signature, &c.content_signature)
        });
        if let Some((canonical, score)) = content {
            debug!(posting_id = %posting.id, canonical_id = %canonical.id, score, "content match");
            let record = DedupeRecord::duplicate_of(
                posting.id,
                canonical.id,
                score,
                MatchStrategy::ContentSimilarity,
                seen_at,
            );
            return Ok(decided(record, seen));
        }

        Ok(decided(DedupeRecord::self_mapping(posting.id, seen_at), seen))
    }

    /// Resolves and persists `posting` with its record. The store rejects a
    /// write only when an overlapping posting landed since the decision (same
    /// URL, or a new canonical this one would have matched); matching is then
    /// redone against the new state.
    pub async fn resolve_and_record(
        &self,
        mut posting: Posting,
        store: &dyn CorpusStore,
    ) -> Result<DedupeRecord, ResolveError> {
        self.fingerprint(&mut posting);
        let attempts = self.config.max_conflict_retries.max(1);
        for attempt in 1..=attempts {
            let decision = self.decide(&posting, store).await?;
            let record = decision.record;
            posting.canonical_posting_id = Some(record.canonical_posting_id);

            let written = if record.is_self_mapping() {
                let scope = &decision.scope;
                let matches = |candidate: &CanonicalCandidate| self.overlaps(&posting, scope, candidate);
                let check = UniquenessCheck {
                    scope,
                    seen: &decision.seen,
                    matches: &matches,
                };
                store.insert_canonical(posting.clone(), record.clone(), check).await
            } else {
                store.insert_duplicate(posting.clone(), record.clone()).await
            };
            match written {
                Ok(()) => return Ok(record),
                Err(err) if err.is_conflict() => {
                    debug!(posting_id = %posting.id, attempt, %err, "overlapping write, re-resolving");
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(posting_id = %posting.id, attempts, "giving up after repeated write conflicts");
        Err(ResolveError::RetriesExhausted {
            posting_id: posting.id,
            attempts,
        })
    }
}
