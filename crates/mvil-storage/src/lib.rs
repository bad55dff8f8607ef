//! Corpus + baseline persistence for MVIL.
//!
//! Two implementations share the same traits: [`MemoryStore`] for tests and
//! single-process runs, and [`PgStore`] backed by Postgres via sqlx.

mod memory;
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mvil_core::{
    BaselineSet, DedupeRecord, FamilyBaselines, FuzzyKey, Posting, RefreshRun, OTHER_ROLE_FAMILY,
};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "mvil-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A concurrent write invalidated the decision; the caller should re-read and retry.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rows of consecutive MinHash values hashed into one bucket per band.
pub const CONTENT_BANDS: usize = 16;

/// Locality-sensitive buckets over a content signature. Two signatures at 0.9
/// similarity share at least one bucket with near certainty, so bucket overlap
/// is the prefilter for the content layer. Empty for an empty signature.
pub fn content_bands(signature: &[u64]) -> Vec<u64> {
    if signature.is_empty() {
        return Vec::new();
    }
    let rows = signature.len().div_ceil(CONTENT_BANDS);
    signature
        .chunks(rows)
        .enumerate()
        .map(|(band, chunk)| {
            chunk.iter().fold(0xCBF2_9CE4_8422_2325 ^ band as u64, |hash, value| {
                (hash ^ value).wrapping_mul(0x0000_0100_0000_01B3).rotate_left(29)
            })
        })
        .collect()
}

/// The fields duplicate matching needs from an existing canonical posting.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCandidate {
    pub id: Uuid,
    pub url_normalized: String,
    pub role_family: Option<String>,
    pub fuzzy_key: FuzzyKey,
    pub content_signature: Vec<u64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

impl CanonicalCandidate {
    pub fn role_family(&self) -> &str {
        self.role_family.as_deref().unwrap_or(OTHER_ROLE_FAMILY)
    }
}

impl From<&Posting> for CanonicalCandidate {
    fn from(p: &Posting) -> Self {
        Self {
            id: p.id,
            url_normalized: p.url_normalized.clone(),
            role_family: p.role_family.clone(),
            fuzzy_key: p.fuzzy_key.clone(),
            content_signature: p.content_signature.clone(),
            first_seen: p.first_seen,
            last_seen: p.last_seen,
            is_active: p.is_active,
        }
    }
}

/// The neighbourhood a posting's duplicates can live in: active canonicals
/// seen since `since` that share its role family (fuzzy layer) or one of its
/// content bands (content layer).
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScope {
    pub role_family: String,
    pub content_bands: Vec<u64>,
    pub since: DateTime<Utc>,
}

impl CandidateScope {
    pub fn of(posting: &Posting, since: DateTime<Utc>) -> Self {
        Self {
            role_family: posting
                .role_family
                .clone()
                .unwrap_or_else(|| OTHER_ROLE_FAMILY.to_string()),
            content_bands: content_bands(&posting.content_signature),
            since,
        }
    }

    /// Keys serializing writers whose scopes overlap, sorted and unique.
    pub fn lock_keys(&self, url_normalized: &str) -> Vec<String> {
        let mut keys = vec![url_lock_key(url_normalized), format!("family:{}", self.role_family)];
        keys.extend(self.content_bands.iter().map(|band| format!("band:{band:016x}")));
        keys.sort();
        keys.dedup();
        keys
    }
}

pub fn url_lock_key(url_normalized: &str) -> String {
    format!("url:{url_normalized}")
}

/// What a "no match, new canonical" decision was made against. The store
/// re-validates it atomically with the insert: any canonical that entered the
/// scope since, and that `matches` accepts, turns the insert into a `Conflict`.
pub struct UniquenessCheck<'a> {
    pub scope: &'a CandidateScope,
    /// Candidates already evaluated by the resolver.
    pub seen: &'a HashSet<Uuid>,
    pub matches: &'a (dyn Fn(&CanonicalCandidate) -> bool + Send + Sync),
}

/// Posting + DedupeRecord tables: the only shared mutable state in the pipeline.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Canonical of whichever posting (canonical or duplicate) carries this
    /// normalized URL. Every posting sharing a URL maps to the same canonical.
    async fn find_canonical_by_url(&self, url_normalized: &str) -> StoreResult<Option<CanonicalCandidate>>;

    /// Canonical postings inside `scope`, ordered by `(first_seen, id)` so
    /// matching is deterministic.
    async fn canonical_candidates(&self, scope: &CandidateScope) -> StoreResult<Vec<CanonicalCandidate>>;

    /// Inserts a self-mapping posting. Fails with `Conflict` if its URL has been
    /// recorded since, or if `check` finds an overlapping canonical.
    async fn insert_canonical(
        &self,
        posting: Posting,
        record: DedupeRecord,
        check: UniquenessCheck<'_>,
    ) -> StoreResult<()>;

    /// Inserts a duplicate and, atomically with it, bumps the canonical's
    /// `last_seen` (monotonically), reactivates it, and increments its repost count.
    /// Fails with `Conflict` if the target is no longer a canonical posting or
    /// the URL already belongs to a different canonical.
    async fn insert_duplicate(&self, posting: Posting, record: DedupeRecord) -> StoreResult<()>;

    async fn get_posting(&self, id: Uuid) -> StoreResult<Option<Posting>>;

    async fn get_dedupe_record(&self, posting_id: Uuid) -> StoreResult<Option<DedupeRecord>>;

    /// Every canonical posting, active or not; the aggregator filters.
    async fn canonical_postings(&self) -> StoreResult<Vec<Posting>>;

    async fn canonical_count(&self) -> StoreResult<u64>;

    /// Marks canonical postings not seen since `older_than` inactive. Returns the count.
    async fn deactivate_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}

/// Exclusive right to run a baseline refresh, across processes for stores
/// that support it. Dropping the lease releases it.
pub struct RefreshLease {
    inner: LeaseInner,
}

enum LeaseInner {
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
    Postgres(Option<PoolConnection<Postgres>>),
}

impl RefreshLease {
    pub(crate) fn local(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: LeaseInner::Local(guard),
        }
    }

    pub(crate) fn postgres(conn: PoolConnection<Postgres>) -> Self {
        Self {
            inner: LeaseInner::Postgres(Some(conn)),
        }
    }

    /// Releases the lease and hands any held connection back to its pool.
    pub async fn release(mut self) -> StoreResult<()> {
        if let LeaseInner::Postgres(conn) = &mut self.inner {
            if let Some(mut conn) = conn.take() {
                if let Err(err) = postgres::release_refresh_lock(&mut conn).await {
                    drop(conn.detach());
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        // Unreleased advisory locks die with their session, so the connection
        // is closed rather than pooled.
        if let LeaseInner::Postgres(conn) = &mut self.inner {
            if let Some(conn) = conn.take() {
                drop(conn.detach());
            }
        }
    }
}

/// Role baseline tables plus refresh bookkeeping.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// `None` while another refresh holds the lease.
    async fn try_acquire_refresh_lease(&self) -> StoreResult<Option<RefreshLease>>;

    /// Atomically swaps in `set` as the current baselines: new rows are written
    /// first, then rows from earlier runs are removed, in one commit. Concurrent
    /// commits are serialized. On error the previous baselines remain exactly as
    /// they were.
    async fn replace_baselines(&self, run: &RefreshRun, set: &BaselineSet) -> StoreResult<()>;

    async fn last_successful_run(&self) -> StoreResult<Option<RefreshRun>>;

    /// False until the first refresh commits ("never aggregated").
    async fn has_any_baselines(&self) -> StoreResult<bool> {
        Ok(self.last_successful_run().await?.is_some())
    }

    /// Every row of exactly one run, the latest committed one.
    async fn current_baselines(&self) -> StoreResult<BaselineSet>;

    async fn baselines_for_family(&self, role_family: &str) -> StoreResult<Option<FamilyBaselines>>;

    async fn role_families(&self) -> StoreResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signature(seed: u64) -> Vec<u64> {
        (0..64).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect()
    }

    #[test]
    fn bands_follow_signature_rows() {
        let a = signature(7);
        assert_eq!(content_bands(&a).len(), CONTENT_BANDS);
        assert_eq!(content_bands(&a), content_bands(&signature(7)));

        let mut one_row_changed = a.clone();
        one_row_changed[0] ^= 1;
        let shared = content_bands(&a)
            .iter()
            .zip(content_bands(&one_row_changed))
            .filter(|(x, y)| **x == *y)
            .count();
        assert_eq!(shared, CONTENT_BANDS - 1);
        assert!(content_bands(&[]).is_empty());
    }

    #[test]
    fn lock_keys_are_sorted_and_cover_url_family_and_bands() {
        let scope = CandidateScope {
            role_family: "sales".into(),
            content_bands: vec![2, 1, 2],
            since: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
        };
        let keys = scope.lock_keys("https://x.io/1");
        assert_eq!(
            keys,
            vec![
                "band:0000000000000001".to_string(),
                "band:0000000000000002".to_string(),
                "family:sales".to_string(),
                "url:https://x.io/1".to_string(),
            ]
        );
    }
}
