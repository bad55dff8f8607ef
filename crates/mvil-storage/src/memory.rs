use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mvil_core::{
    BaselineSet, DedupeRecord, DemandSnapshot, EducationBaseline, ExperienceBaseline,
    FamilyBaselines, Posting, RefreshRun, SkillBaseline, OTHER_ROLE_FAMILY,
};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    content_bands, BaselineStore, CandidateScope, CanonicalCandidate, CorpusStore, RefreshLease,
    StoreError, StoreResult, UniquenessCheck,
};

#[derive(Debug, Default)]
struct CorpusState {
    postings: BTreeMap<Uuid, Posting>,
    records: BTreeMap<Uuid, DedupeRecord>,
    /// Normalized URL of every posting -> the canonical it maps to.
    canonical_by_url: HashMap<String, Uuid>,
    by_family: HashMap<String, BTreeSet<Uuid>>,
    by_band: HashMap<u64, BTreeSet<Uuid>>,
}

impl CorpusState {
    fn in_scope(&self, scope: &CandidateScope) -> Vec<CanonicalCandidate> {
        let mut ids = self
            .by_family
            .get(&scope.role_family)
            .cloned()
            .unwrap_or_default();
        for band in &scope.content_bands {
            if let Some(members) = self.by_band.get(band) {
                ids.extend(members);
            }
        }
        let mut out = ids
            .iter()
            .filter_map(|id| self.postings.get(id))
            .filter(|p| p.is_active && p.last_seen >= scope.since)
            .map(CanonicalCandidate::from)
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
        out
    }

    fn index_canonical(&mut self, posting: &Posting) {
        let family = posting
            .role_family
            .clone()
            .unwrap_or_else(|| OTHER_ROLE_FAMILY.to_string());
        self.by_family.entry(family).or_default().insert(posting.id);
        for band in content_bands(&posting.content_signature) {
            self.by_band.entry(band).or_default().insert(posting.id);
        }
        self.canonical_by_url
            .insert(posting.url_normalized.clone(), posting.id);
    }
}

/// Baseline rows are tagged with the run that produced them.
#[derive(Debug, Default)]
struct BaselineState {
    skill: Vec<(Uuid, SkillBaseline)>,
    education: Vec<(Uuid, EducationBaseline)>,
    experience: Vec<(Uuid, ExperienceBaseline)>,
    demand: Vec<(Uuid, DemandSnapshot)>,
    current_run: Option<RefreshRun>,
}

impl BaselineState {
    fn retain_run(&mut self, run_id: Uuid, keep: bool) {
        self.skill.retain(|(id, _)| (*id == run_id) == keep);
        self.education.retain(|(id, _)| (*id == run_id) == keep);
        self.experience.retain(|(id, _)| (*id == run_id) == keep);
        self.demand.retain(|(id, _)| (*id == run_id) == keep);
    }

    fn snapshot(&self) -> BaselineSet {
        let Some(run) = &self.current_run else {
            return BaselineSet::default();
        };
        let current = |id: &Uuid| *id == run.run_id;
        BaselineSet {
            skill: self.skill.iter().filter(|(id, _)| current(id)).map(|(_, r)| r.clone()).collect(),
            education: self.education.iter().filter(|(id, _)| current(id)).map(|(_, r)| r.clone()).collect(),
            experience: self.experience.iter().filter(|(id, _)| current(id)).map(|(_, r)| r.clone()).collect(),
            demand: self.demand.iter().filter(|(id, _)| current(id)).map(|(_, r)| r.clone()).collect(),
        }
    }
}

/// In-process store. Reads run concurrently; each mutation holds the write
/// lock only for the duration of its own bookkeeping.
#[derive(Debug, Default)]
pub struct MemoryStore {
    corpus: RwLock<CorpusState>,
    baselines: RwLock<BaselineState>,
    refresh_lock: Arc<Mutex<()>>,
    unavailable: AtomicBool,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fault injection: the next `replace_baselines` fails after writing its new
    /// rows and before removing the old ones.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    pub async fn posting_count(&self) -> usize {
        self.corpus.read().await.postings.len()
    }

    pub async fn all_dedupe_records(&self) -> Vec<DedupeRecord> {
        self.corpus.read().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl CorpusStore for MemoryStore {
    async fn find_canonical_by_url(&self, url_normalized: &str) -> StoreResult<Option<CanonicalCandidate>> {
        self.check_available()?;
        let state = self.corpus.read().await;
        Ok(state
            .canonical_by_url
            .get(url_normalized)
            .and_then(|id| state.postings.get(id))
            .map(CanonicalCandidate::from))
    }

    async fn canonical_candidates(&self, scope: &CandidateScope) -> StoreResult<Vec<CanonicalCandidate>> {
        self.check_available()?;
        Ok(self.corpus.read().await.in_scope(scope))
    }

    async fn insert_canonical(
        &self,
        posting: Posting,
        record: DedupeRecord,
        check: UniquenessCheck<'_>,
    ) -> StoreResult<()> {
        self.check_available()?;
        if !record.is_self_mapping() || record.posting_id != posting.id || !posting.is_canonical() {
            return Err(StoreError::Corrupt {
                id: posting.id.to_string(),
                reason: "canonical insert requires a self-mapping record".into(),
            });
        }
        let mut state = self.corpus.write().await;
        if state.postings.contains_key(&posting.id) {
            return Err(StoreError::Conflict(format!("posting {} already recorded", posting.id)));
        }
        if let Some(existing) = state.canonical_by_url.get(&posting.url_normalized) {
            return Err(StoreError::Conflict(format!(
                "{} already maps to {existing}",
                posting.url_normalized
            )));
        }
        if let Some(overlap) = state
            .in_scope(check.scope)
            .into_iter()
            .filter(|c| !check.seen.contains(&c.id))
            .find(|c| (check.matches)(c))
        {
            return Err(StoreError::Conflict(format!(
                "canonical {} entered the match scope concurrently",
                overlap.id
            )));
        }
        state.index_canonical(&posting);
        state.records.insert(record.posting_id, record);
        state.postings.insert(posting.id, posting);
        Ok(())
    }

    async fn insert_duplicate(&self, posting: Posting, record: DedupeRecord) -> StoreResult<()> {
        self.check_available()?;
        if record.is_self_mapping() || record.posting_id != posting.id {
            return Err(StoreError::Corrupt {
                id: posting.id.to_string(),
                reason: "duplicate insert requires a record pointing elsewhere".into(),
            });
        }
        let mut state = self.corpus.write().await;
        if state.postings.contains_key(&posting.id) {
            return Err(StoreError::Conflict(format!("posting {} already recorded", posting.id)));
        }
        let canonical_id = record.canonical_posting_id;
        if let Some(existing) = state.canonical_by_url.get(&posting.url_normalized) {
            if *existing != canonical_id {
                return Err(StoreError::Conflict(format!(
                    "{} already maps to {existing}",
                    posting.url_normalized
                )));
            }
        }
        match state.postings.get_mut(&canonical_id) {
            Some(canonical) if canonical.is_canonical() => {
                canonical.mark_seen(posting.last_seen);
                canonical.is_active = true;
            }
            _ => {
                return Err(StoreError::Conflict(format!(
                    "{canonical_id} is no longer a canonical posting"
                )))
            }
        }
        if let Some(canonical_record) = state.records.get_mut(&canonical_id) {
            canonical_record.repost_count += 1;
            canonical_record.updated_at = record.detected_at;
        }
        state
            .canonical_by_url
            .entry(posting.url_normalized.clone())
            .or_insert(canonical_id);
        state.records.insert(record.posting_id, record);
        state.postings.insert(posting.id, posting);
        Ok(())
    }

    async fn get_posting(&self, id: Uuid) -> StoreResult<Option<Posting>> {
        self.check_available()?;
        Ok(self.corpus.read().await.postings.get(&id).cloned())
    }

    async fn get_dedupe_record(&self, posting_id: Uuid) -> StoreResult<Option<DedupeRecord>> {
        self.check_available()?;
        Ok(self.corpus.read().await.records.get(&posting_id).cloned())
    }

    async fn canonical_postings(&self) -> StoreResult<Vec<Posting>> {
        self.check_available()?;
        Ok(self
            .corpus
            .read()
            .await
            .postings
            .values()
            .filter(|p| p.is_canonical())
            .cloned()
            .collect())
    }

    async fn canonical_count(&self) -> StoreResult<u64> {
        self.check_available()?;
        let state = self.corpus.read().await;
        Ok(state.postings.values().filter(|p| p.is_canonical()).count() as u64)
    }

    async fn deactivate_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.corpus.write().await;
        let mut count = 0;
        for posting in state.postings.values_mut() {
            if posting.is_canonical() && posting.is_active && posting.last_seen < older_than {
                posting.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn try_acquire_refresh_lease(&self) -> StoreResult<Option<RefreshLease>> {
        self.check_available()?;
        Ok(self
            .refresh_lock
            .clone()
            .try_lock_owned()
            .ok()
            .map(RefreshLease::local))
    }

    async fn replace_baselines(&self, run: &RefreshRun, set: &BaselineSet) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.baselines.write().await;
        let run_id = run.run_id;
        state.skill.extend(set.skill.iter().cloned().map(|r| (run_id, r)));
        state.education.extend(set.education.iter().cloned().map(|r| (run_id, r)));
        state.experience.extend(set.experience.iter().cloned().map(|r| (run_id, r)));
        state.demand.extend(set.demand.iter().cloned().map(|r| (run_id, r)));

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            state.retain_run(run_id, false);
            return Err(StoreError::Unavailable("injected failure before commit".into()));
        }

        state.retain_run(run_id, true);
        state.current_run = Some(run.clone());
        Ok(())
    }

    async fn last_successful_run(&self) -> StoreResult<Option<RefreshRun>> {
        self.check_available()?;
        Ok(self.baselines.read().await.current_run.clone())
    }

    async fn current_baselines(&self) -> StoreResult<BaselineSet> {
        self.check_available()?;
        Ok(self.baselines.read().await.snapshot())
    }

    async fn baselines_for_family(&self, role_family: &str) -> StoreResult<Option<FamilyBaselines>> {
        Ok(self.current_baselines().await?.for_family(role_family))
    }

    async fn role_families(&self) -> StoreResult<Vec<String>> {
        Ok(self.current_baselines().await?.role_families().into_iter().collect())
    }
}
