use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mvil_core::{
    BaselineEvidence, BaselineSet, DedupeRecord, DemandSnapshot, EducationBaseline, EducationLevel,
    ExperienceBand, ExperienceBaseline, FamilyBaselines, FuzzyKey, MatchStrategy, Posting,
    RefreshRun, SkillBaseline,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    content_bands, url_lock_key, BaselineStore, CandidateScope, CanonicalCandidate, CorpusStore,
    RefreshLease, StoreError, StoreResult, UniquenessCheck,
};

const POSTING_COLUMNS: &str = r#"
    id, url, url_normalized, title_raw, title_normalized, role_family, company,
    location_raw, location_normalized, description, skills_raw, skills,
    education_raw, education_level, experience_raw, experience, salary,
    posted_at, first_seen, last_seen, is_active, quality_score,
    canonical_posting_id, content_signature, title_key, company_key, location_key
"#;

const CANDIDATE_COLUMNS: &str = r#"
    id, url_normalized, role_family, title_key, company_key, location_key,
    content_signature, first_seen, last_seen, is_active
"#;

/// Canonical, active and recent postings sharing the role family ($2) or a
/// content band ($3).
const IN_SCOPE: &str = "canonical_posting_id = id AND is_active AND last_seen >= $1 \
     AND (role_family = $2 OR content_bands && $3)";

/// Two-key advisory locks live in their own space, apart from the hashed
/// single-key scope locks.
const LOCK_CLASS: i32 = 0x4D56_494C;
const REFRESH_LEASE_LOCK: i32 = 1;
const BASELINE_COMMIT_LOCK: i32 = 2;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn corrupt(id: impl ToString, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Unique violations surface as `Conflict` so the resolver re-reads and retries.
fn map_write_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn signature_to_sql(signature: &[u64]) -> Vec<i64> {
    signature.iter().map(|v| *v as i64).collect()
}

fn signature_from_sql(signature: Vec<i64>) -> Vec<u64> {
    signature.into_iter().map(|v| v as u64).collect()
}

fn count_from_sql(id: &str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| corrupt(id, format!("negative count {value}")))
}

fn u64_from_sql(id: &str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| corrupt(id, format!("negative counter {value}")))
}

fn posting_from_row(row: &PgRow) -> StoreResult<Posting> {
    let id: Uuid = row.try_get("id")?;
    let education_level = row
        .try_get::<Option<String>, _>("education_level")?
        .map(|label| {
            EducationLevel::from_label(&label)
                .ok_or_else(|| corrupt(id, format!("unknown education level {label:?}")))
        })
        .transpose()?;
    let experience = row
        .try_get::<Option<JsonValue>, _>("experience")?
        .map(serde_json::from_value)
        .transpose()
        .map_err(|err| corrupt(id, format!("experience: {err}")))?;

    Ok(Posting {
        id,
        url: row.try_get("url")?,
        url_normalized: row.try_get("url_normalized")?,
        title_raw: row.try_get("title_raw")?,
        title_normalized: row.try_get("title_normalized")?,
        role_family: row.try_get("role_family")?,
        company: row.try_get("company")?,
        location_raw: row.try_get("location_raw")?,
        location_normalized: row.try_get("location_normalized")?,
        description: row.try_get("description")?,
        skills_raw: row.try_get("skills_raw")?,
        skills: row.try_get("skills")?,
        education_raw: row.try_get("education_raw")?,
        education_level,
        experience_raw: row.try_get("experience_raw")?,
        experience,
        salary: row.try_get("salary")?,
        posted_at: row.try_get("posted_at")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        is_active: row.try_get("is_active")?,
        quality_score: row.try_get("quality_score")?,
        canonical_posting_id: row.try_get("canonical_posting_id")?,
        content_signature: signature_from_sql(row.try_get("content_signature")?),
        fuzzy_key: fuzzy_key_from_row(row)?,
    })
}

fn fuzzy_key_from_row(row: &PgRow) -> StoreResult<FuzzyKey> {
    Ok(FuzzyKey {
        title: row.try_get("title_key")?,
        company: row.try_get("company_key")?,
        location: row.try_get("location_key")?,
    })
}

fn candidate_from_row(row: &PgRow) -> StoreResult<CanonicalCandidate> {
    Ok(CanonicalCandidate {
        id: row.try_get("id")?,
        url_normalized: row.try_get("url_normalized")?,
        role_family: row.try_get("role_family")?,
        fuzzy_key: fuzzy_key_from_row(row)?,
        content_signature: signature_from_sql(row.try_get("content_signature")?),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        is_active: row.try_get("is_active")?,
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<DedupeRecord> {
    let posting_id: Uuid = row.try_get("posting_id")?;
    let strategy: String = row.try_get("match_strategy")?;
    let id = posting_id.to_string();
    Ok(DedupeRecord {
        posting_id,
        canonical_posting_id: row.try_get("canonical_posting_id")?,
        similarity_score: row.try_get("similarity_score")?,
        match_strategy: MatchStrategy::from_label(&strategy)
            .ok_or_else(|| corrupt(&id, format!("unknown match strategy {strategy:?}")))?,
        detected_at: row.try_get("detected_at")?,
        updated_at: row.try_get("updated_at")?,
        repost_count: count_from_sql(&id, row.try_get("repost_count")?)?,
    })
}

fn evidence_from_row(row: &PgRow, id: &str) -> StoreResult<BaselineEvidence> {
    Ok(BaselineEvidence {
        sample_job_ids: row.try_get("sample_job_ids")?,
        count_total_jobs_used: count_from_sql(id, row.try_get("count_total_jobs_used")?)?,
        computed_at: row.try_get("computed_at")?,
        low_confidence: row.try_get("low_confidence")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<RefreshRun> {
    let run_id: Uuid = row.try_get("run_id")?;
    let id = run_id.to_string();
    Ok(RefreshRun {
        run_id,
        computed_at: row.try_get("computed_at")?,
        rows_written: u64_from_sql(&id, row.try_get("rows_written")?)?,
        families_processed: u64_from_sql(&id, row.try_get("families_processed")?)?,
        duration_ms: u64_from_sql(&id, row.try_get("duration_ms")?)?,
    })
}

async fn insert_posting_row(
    conn: &mut sqlx::PgConnection,
    posting: &Posting,
) -> StoreResult<()> {
    let experience = posting
        .experience
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| corrupt(posting.id, format!("experience: {err}")))?;
    sqlx::query(&format!(
        "INSERT INTO postings ({POSTING_COLUMNS}, content_bands) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
          $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)"
    ))
    .bind(posting.id)
    .bind(&posting.url)
    .bind(&posting.url_normalized)
    .bind(&posting.title_raw)
    .bind(&posting.title_normalized)
    .bind(&posting.role_family)
    .bind(&posting.company)
    .bind(&posting.location_raw)
    .bind(&posting.location_normalized)
    .bind(&posting.description)
    .bind(&posting.skills_raw)
    .bind(&posting.skills)
    .bind(&posting.education_raw)
    .bind(posting.education_level.map(|level| level.as_str()))
    .bind(&posting.experience_raw)
    .bind(experience)
    .bind(&posting.salary)
    .bind(posting.posted_at)
    .bind(posting.first_seen)
    .bind(posting.last_seen)
    .bind(posting.is_active)
    .bind(posting.quality_score)
    .bind(posting.canonical_posting_id)
    .bind(signature_to_sql(&posting.content_signature))
    .bind(&posting.fuzzy_key.title)
    .bind(&posting.fuzzy_key.company)
    .bind(&posting.fuzzy_key.location)
    .bind(signature_to_sql(&content_bands(&posting.content_signature)))
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

async fn insert_record_row(
    conn: &mut sqlx::PgConnection,
    record: &DedupeRecord,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dedupe_records
            (posting_id, canonical_posting_id, similarity_score, match_strategy,
             detected_at, updated_at, repost_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(record.posting_id)
    .bind(record.canonical_posting_id)
    .bind(record.similarity_score)
    .bind(record.match_strategy.as_str())
    .bind(record.detected_at)
    .bind(record.updated_at)
    .bind(record.repost_count as i32)
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

/// Takes transaction-scoped advisory locks for `keys` in a stable order, so
/// writers with overlapping scopes queue behind each other instead of deadlocking.
async fn lock_keys(conn: &mut PgConnection, keys: &[String]) -> StoreResult<()> {
    let lock_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT hashtextextended(key, 0) AS lock_id \
           FROM unnest($1::text[]) AS key ORDER BY lock_id",
    )
    .bind(keys)
    .fetch_all(&mut *conn)
    .await?;
    for lock_id in lock_ids {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Canonical some posting with this URL maps to, other than `except`.
async fn url_owner(
    conn: &mut PgConnection,
    url_normalized: &str,
    except: Option<Uuid>,
) -> StoreResult<Option<Uuid>> {
    let owner: Option<Option<Uuid>> = sqlx::query_scalar(
        "SELECT canonical_posting_id FROM postings \
          WHERE url_normalized = $1 AND canonical_posting_id IS DISTINCT FROM $2 \
          LIMIT 1",
    )
    .bind(url_normalized)
    .bind(except)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(owner.flatten())
}

pub(crate) async fn release_refresh_lock(conn: &mut PgConnection) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_unlock($1, $2)")
        .bind(LOCK_CLASS)
        .bind(REFRESH_LEASE_LOCK)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Id of the latest committed refresh run, read on `conn`.
async fn latest_run_id(conn: &mut PgConnection) -> StoreResult<Option<Uuid>> {
    Ok(sqlx::query_scalar(
        "SELECT run_id FROM aggregation_runs ORDER BY committed_at DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CorpusStore for PgStore {
    async fn find_canonical_by_url(&self, url_normalized: &str) -> StoreResult<Option<CanonicalCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM postings \
              WHERE id = (SELECT canonical_posting_id FROM postings \
                           WHERE url_normalized = $1 \
                           ORDER BY first_seen, id LIMIT 1)"
        ))
        .bind(url_normalized)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    async fn canonical_candidates(&self, scope: &CandidateScope) -> StoreResult<Vec<CanonicalCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM postings WHERE {IN_SCOPE} ORDER BY first_seen, id"
        ))
        .bind(scope.since)
        .bind(&scope.role_family)
        .bind(signature_to_sql(&scope.content_bands))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn insert_canonical(
        &self,
        posting: Posting,
        record: DedupeRecord,
        check: UniquenessCheck<'_>,
    ) -> StoreResult<()> {
        if !record.is_self_mapping() || record.posting_id != posting.id || !posting.is_canonical() {
            return Err(corrupt(posting.id, "canonical insert requires a self-mapping record"));
        }
        let mut tx = self.pool.begin().await?;
        lock_keys(&mut tx, &check.scope.lock_keys(&posting.url_normalized)).await?;

        if let Some(owner) = url_owner(&mut tx, &posting.url_normalized, None).await? {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "{} already maps to {owner}",
                posting.url_normalized
            )));
        }
        let seen = check.seen.iter().copied().collect::<Vec<_>>();
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM postings WHERE {IN_SCOPE} AND NOT (id = ANY($4))"
        ))
        .bind(check.scope.since)
        .bind(&check.scope.role_family)
        .bind(signature_to_sql(&check.scope.content_bands))
        .bind(&seen)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let candidate = candidate_from_row(row)?;
            if (check.matches)(&candidate) {
                tx.rollback().await?;
                return Err(StoreError::Conflict(format!(
                    "canonical {} entered the match scope concurrently",
                    candidate.id
                )));
            }
        }

        insert_posting_row(&mut tx, &posting).await?;
        insert_record_row(&mut tx, &record).await?;
        tx.commit().await?;
        debug!(posting_id = %posting.id, "canonical posting inserted");
        Ok(())
    }

    async fn insert_duplicate(&self, posting: Posting, record: DedupeRecord) -> StoreResult<()> {
        if record.is_self_mapping() || record.posting_id != posting.id {
            return Err(corrupt(posting.id, "duplicate insert requires a record pointing elsewhere"));
        }
        let canonical_id = record.canonical_posting_id;
        let mut tx = self.pool.begin().await?;
        lock_keys(&mut tx, &[url_lock_key(&posting.url_normalized)]).await?;
        if let Some(owner) = url_owner(&mut tx, &posting.url_normalized, Some(canonical_id)).await? {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "{} already maps to {owner}",
                posting.url_normalized
            )));
        }
        let locked: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT canonical_posting_id FROM postings WHERE id = $1 FOR UPDATE",
        )
        .bind(canonical_id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked != Some(Some(canonical_id)) {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "{canonical_id} is no longer a canonical posting"
            )));
        }

        sqlx::query(
            "UPDATE postings SET last_seen = GREATEST(last_seen, $2), is_active = TRUE WHERE id = $1",
        )
        .bind(canonical_id)
        .bind(posting.last_seen)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE dedupe_records SET repost_count = repost_count + 1, updated_at = $2 \
             WHERE posting_id = $1",
        )
        .bind(canonical_id)
        .bind(record.detected_at)
        .execute(&mut *tx)
        .await?;

        insert_posting_row(&mut tx, &posting).await?;
        insert_record_row(&mut tx, &record).await?;
        tx.commit().await?;
        debug!(posting_id = %posting.id, %canonical_id, "duplicate posting inserted");
        Ok(())
    }

    async fn get_posting(&self, id: Uuid) -> StoreResult<Option<Posting>> {
        let row = sqlx::query(&format!("SELECT {POSTING_COLUMNS} FROM postings WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn get_dedupe_record(&self, posting_id: Uuid) -> StoreResult<Option<DedupeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT posting_id, canonical_posting_id, similarity_score, match_strategy,
                   detected_at, updated_at, repost_count
              FROM dedupe_records
             WHERE posting_id = $1
            "#,
        )
        .bind(posting_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn canonical_postings(&self) -> StoreResult<Vec<Posting>> {
        let rows = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE canonical_posting_id = id ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(posting_from_row).collect()
    }

    async fn canonical_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM postings WHERE canonical_posting_id = id")
            .fetch_one(&self.pool)
            .await?;
        u64_from_sql("postings", count)
    }

    async fn deactivate_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE postings SET is_active = FALSE \
             WHERE canonical_posting_id = id AND is_active AND last_seen < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BaselineStore for PgStore {
    /// A session-level advisory lock on a connection held for the lease, so the
    /// CLI and the server scheduler exclude each other.
    async fn try_acquire_refresh_lease(&self) -> StoreResult<Option<RefreshLease>> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(REFRESH_LEASE_LOCK)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            debug!("refresh lease held elsewhere");
            return Ok(None);
        }
        Ok(Some(RefreshLease::postgres(conn)))
    }

    async fn replace_baselines(&self, run: &RefreshRun, set: &BaselineSet) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        // A second commit waits here, then its delete sees and removes this run's rows.
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(BASELINE_COMMIT_LOCK)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO aggregation_runs
                (run_id, computed_at, rows_written, families_processed, duration_ms)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.run_id)
        .bind(run.computed_at)
        .bind(run.rows_written as i64)
        .bind(run.families_processed as i64)
        .bind(run.duration_ms as i64)
        .execute(&mut *tx)
        .await?;

        for row in &set.skill {
            sqlx::query(
                r#"
                INSERT INTO skill_baselines
                    (run_id, role_family, skill_name, frequency, count_ads,
                     sample_job_ids, count_total_jobs_used, computed_at, low_confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(run.run_id)
            .bind(&row.role_family)
            .bind(&row.skill_name)
            .bind(row.frequency)
            .bind(row.count_ads as i32)
            .bind(&row.evidence.sample_job_ids)
            .bind(row.evidence.count_total_jobs_used as i32)
            .bind(row.evidence.computed_at)
            .bind(row.evidence.low_confidence)
            .execute(&mut *tx)
            .await?;
        }

        for row in &set.education {
            sqlx::query(
                r#"
                INSERT INTO education_baselines
                    (run_id, role_family, education_level, share, count_ads,
                     sample_job_ids, count_total_jobs_used, computed_at, low_confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(run.run_id)
            .bind(&row.role_family)
            .bind(row.education_level.as_str())
            .bind(row.share)
            .bind(row.count_ads as i32)
            .bind(&row.evidence.sample_job_ids)
            .bind(row.evidence.count_total_jobs_used as i32)
            .bind(row.evidence.computed_at)
            .bind(row.evidence.low_confidence)
            .execute(&mut *tx)
            .await?;
        }

        for row in &set.experience {
            sqlx::query(
                r#"
                INSERT INTO experience_baselines
                    (run_id, role_family, experience_band, share, count_ads,
                     sample_job_ids, count_total_jobs_used, computed_at, low_confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(run.run_id)
            .bind(&row.role_family)
            .bind(row.experience_band.as_str())
            .bind(row.share)
            .bind(row.count_ads as i32)
            .bind(&row.evidence.sample_job_ids)
            .bind(row.evidence.count_total_jobs_used as i32)
            .bind(row.evidence.computed_at)
            .bind(row.evidence.low_confidence)
            .execute(&mut *tx)
            .await?;
        }

        for row in &set.demand {
            sqlx::query(
                r#"
                INSERT INTO demand_snapshots
                    (run_id, role_family, snapshot_date, count_ads, unique_employers,
                     sample_job_ids, count_total_jobs_used, computed_at, low_confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(run.run_id)
            .bind(&row.role_family)
            .bind(row.date)
            .bind(row.count_ads as i32)
            .bind(row.unique_employers as i32)
            .bind(&row.evidence.sample_job_ids)
            .bind(row.evidence.count_total_jobs_used as i32)
            .bind(row.evidence.computed_at)
            .bind(row.evidence.low_confidence)
            .execute(&mut *tx)
            .await?;
        }

        // New rows are in place; only now drop the previous run's.
        for table in [
            "skill_baselines",
            "education_baselines",
            "experience_baselines",
            "demand_snapshots",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE run_id <> $1"))
                .bind(run.run_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(run_id = %run.run_id, rows = set.rows_written(), "baselines replaced");
        Ok(())
    }

    async fn last_successful_run(&self) -> StoreResult<Option<RefreshRun>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, computed_at, rows_written, families_processed, duration_ms
              FROM aggregation_runs
             ORDER BY committed_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn current_baselines(&self) -> StoreResult<BaselineSet> {
        let mut set = BaselineSet::default();
        // The run id and all four tables come from one snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let Some(run_id) = latest_run_id(&mut tx).await? else {
            tx.commit().await?;
            return Ok(set);
        };

        let rows = sqlx::query(
            r#"
            SELECT role_family, skill_name, frequency, count_ads,
                   sample_job_ids, count_total_jobs_used, computed_at, low_confidence
              FROM skill_baselines
             WHERE run_id = $1
             ORDER BY role_family, frequency DESC, skill_name
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let skill_name: String = row.try_get("skill_name")?;
            set.skill.push(SkillBaseline {
                role_family: row.try_get("role_family")?,
                frequency: row.try_get("frequency")?,
                count_ads: count_from_sql(&skill_name, row.try_get("count_ads")?)?,
                evidence: evidence_from_row(row, &skill_name)?,
                skill_name,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT role_family, education_level, share, count_ads,
                   sample_job_ids, count_total_jobs_used, computed_at, low_confidence
              FROM education_baselines
             WHERE run_id = $1
             ORDER BY role_family, education_level
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let label: String = row.try_get("education_level")?;
            set.education.push(EducationBaseline {
                role_family: row.try_get("role_family")?,
                education_level: EducationLevel::from_label(&label)
                    .ok_or_else(|| corrupt(&label, "unknown education level"))?,
                share: row.try_get("share")?,
                count_ads: count_from_sql(&label, row.try_get("count_ads")?)?,
                evidence: evidence_from_row(row, &label)?,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT role_family, experience_band, share, count_ads,
                   sample_job_ids, count_total_jobs_used, computed_at, low_confidence
              FROM experience_baselines
             WHERE run_id = $1
             ORDER BY role_family, experience_band
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let label: String = row.try_get("experience_band")?;
            set.experience.push(ExperienceBaseline {
                role_family: row.try_get("role_family")?,
                experience_band: ExperienceBand::from_label(&label)
                    .ok_or_else(|| corrupt(&label, "unknown experience band"))?,
                share: row.try_get("share")?,
                count_ads: count_from_sql(&label, row.try_get("count_ads")?)?,
                evidence: evidence_from_row(row, &label)?,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT role_family, snapshot_date, count_ads, unique_employers,
                   sample_job_ids, count_total_jobs_used, computed_at, low_confidence
              FROM demand_snapshots
             WHERE run_id = $1
             ORDER BY role_family, snapshot_date
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let role_family: String = row.try_get("role_family")?;
            set.demand.push(DemandSnapshot {
                date: row.try_get("snapshot_date")?,
                count_ads: count_from_sql(&role_family, row.try_get("count_ads")?)?,
                unique_employers: count_from_sql(&role_family, row.try_get("unique_employers")?)?,
                evidence: evidence_from_row(row, &role_family)?,
                role_family,
            });
        }

        tx.commit().await?;
        Ok(set)
    }

    async fn baselines_for_family(&self, role_family: &str) -> StoreResult<Option<FamilyBaselines>> {
        // Small tables; filtering the full current set keeps one read path.
        Ok(self.current_baselines().await?.for_family(role_family))
    }

    async fn role_families(&self) -> StoreResult<Vec<String>> {
        let families: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT role_family
              FROM demand_snapshots
             WHERE run_id = (SELECT run_id FROM aggregation_runs
                              ORDER BY committed_at DESC LIMIT 1)
             ORDER BY role_family
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mvil_core::BaselineEvidence;

    /// Runs only against a scratch database named by `MVIL_TEST_DATABASE_URL`.
    async fn connect_test_store() -> Option<PgStore> {
        let database_url = std::env::var("MVIL_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&database_url, 4).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    fn demand(family: &str, at: DateTime<Utc>) -> DemandSnapshot {
        DemandSnapshot {
            role_family: family.into(),
            date: at.date_naive(),
            count_ads: 4,
            unique_employers: 2,
            evidence: BaselineEvidence {
                sample_job_ids: vec![],
                count_total_jobs_used: 4,
                computed_at: at,
                low_confidence: true,
            },
        }
    }

    fn run(at: DateTime<Utc>) -> RefreshRun {
        RefreshRun {
            run_id: Uuid::new_v4(),
            computed_at: at,
            rows_written: 1,
            families_processed: 1,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn concurrent_commits_leave_exactly_one_run() {
        let Some(store) = connect_test_store().await else {
            return;
        };
        let store = Arc::new(store);
        let at = Utc::now();
        let mut handles = Vec::new();
        for family in ["sales", "nursing", "design"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let set = BaselineSet {
                    demand: vec![demand(family, at)],
                    ..Default::default()
                };
                store.replace_baselines(&run(at), &set).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let runs: Vec<Uuid> = sqlx::query_scalar("SELECT DISTINCT run_id FROM demand_snapshots")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        let current = store.current_baselines().await.unwrap();
        assert_eq!(current.demand.len(), 1);
        assert_eq!(store.role_families().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_lease_excludes_another_pool() {
        let (Some(first), Some(second)) = (connect_test_store().await, connect_test_store().await) else {
            return;
        };
        let lease = first.try_acquire_refresh_lease().await.unwrap().unwrap();
        assert!(second.try_acquire_refresh_lease().await.unwrap().is_none());
        lease.release().await.unwrap();
        let again = second.try_acquire_refresh_lease().await.unwrap().unwrap();
        again.release().await.unwrap();
    }
}
