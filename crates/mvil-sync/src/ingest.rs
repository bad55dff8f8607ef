use std::sync::Arc;

use chrono::{DateTime, Utc};
use mvil_core::{DedupeRecord, Posting, RawPosting};
use mvil_normalize::{QualityScorer, Taxonomy};
use mvil_storage::CorpusStore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{DuplicateResolver, ResolveError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("posting has no url")]
    MissingUrl,
    #[error("duplicate resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub posting_id: Uuid,
    pub quality_score: f64,
    pub record: DedupeRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub unique: usize,
    pub failed: Vec<IngestFailure>,
}

impl IngestSummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        self.accepted += 1;
        if outcome.record.is_self_mapping() {
            self.unique += 1;
        } else {
            self.duplicates += 1;
        }
    }
}

/// Quality scoring, duplicate resolution and canonicalization for raw postings.
#[derive(Clone)]
pub struct IngestPipeline {
    taxonomy: Arc<Taxonomy>,
    resolver: Arc<DuplicateResolver>,
    store: Arc<dyn CorpusStore>,
    concurrency: usize,
}

impl IngestPipeline {
    pub fn new(
        taxonomy: Arc<Taxonomy>,
        resolver: Arc<DuplicateResolver>,
        store: Arc<dyn CorpusStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            taxonomy,
            resolver,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Scored and normalized posting, ready for resolution. Low-quality postings
    /// are kept with their score; the aggregator applies the floor.
    pub fn prepare(&self, raw: RawPosting, seen_at: DateTime<Utc>) -> Posting {
        let mut posting = Posting::from_raw(Uuid::new_v4(), raw, seen_at);
        posting.quality_score = Some(QualityScorer::new(&self.taxonomy).score(&posting));
        self.taxonomy.normalize_posting(&mut posting);
        posting
    }

    pub async fn ingest_one(
        &self,
        raw: RawPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        if raw.url.trim().is_empty() {
            return Err(IngestError::MissingUrl);
        }
        let posting = self.prepare(raw, seen_at);
        let posting_id = posting.id;
        let quality_score = posting.quality_score.unwrap_or_default();
        let record = self
            .resolver
            .resolve_and_record(posting, self.store.as_ref())
            .await?;
        Ok(IngestOutcome {
            posting_id,
            quality_score,
            record,
        })
    }

    /// Runs postings with bounded parallelism. One posting failing never affects
    /// its siblings; failures are reported in the summary.
    pub async fn ingest_batch(&self, raws: Vec<RawPosting>, seen_at: DateTime<Utc>) -> IngestSummary {
        let span = info_span!("ingest_batch", postings = raws.len());
        async move {
            let semaphore = Arc::new(Semaphore::new(self.concurrency));
            let mut tasks = JoinSet::new();
            let mut summary = IngestSummary::default();

            for raw in raws {
                let url = raw.url.clone();
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        summary.failed.push(IngestFailure {
                            url,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                let pipeline = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = pipeline.ingest_one(raw, seen_at).await;
                    (url, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(outcome))) => summary.record(&outcome),
                    Ok((url, Err(err))) => {
                        warn!(%url, error = %err, "posting ingestion failed");
                        summary.failed.push(IngestFailure {
                            url,
                            error: err.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "ingest task aborted");
                        summary.failed.push(IngestFailure {
                            url: String::new(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            summary.failed.sort_by(|a, b| a.url.cmp(&b.url));

            info!(
                accepted = summary.accepted,
                unique = summary.unique,
                duplicates = summary.duplicates,
                failed = summary.failed.len(),
                "ingest batch complete"
            );
            summary
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupConfig;
    use mvil_core::{EducationLevel, ExperienceBand};
    use mvil_storage::MemoryStore;
    use serde_json::json;

    fn pipeline(store: Arc<MemoryStore>) -> IngestPipeline {
        let taxonomy = Arc::new(Taxonomy::builtin());
        let resolver = Arc::new(DuplicateResolver::new(DedupConfig::default(), taxonomy.clone()));
        IngestPipeline::new(taxonomy, resolver, store, 4)
    }

    fn raw(url: &str) -> RawPosting {
        RawPosting {
            url: url.into(),
            title: "Senior Data Analyst".into(),
            company: Some("Acme".into()),
            description: "x".repeat(900),
            location: Some("lagos, nigeria".into()),
            posted_at: None,
            skills: Some(json!(["MS Excel", "SQL", "Python", "Tableau", "Power BI"])),
            education: Some(json!("BSc Statistics")),
            experience: Some(json!("3-5 years")),
            salary: Some(json!({"min": 250000})),
        }
    }

    #[tokio::test]
    async fn ingest_one_scores_normalizes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let outcome = pipeline(store.clone())
            .ingest_one(raw("https://jobs.example.com/1"), Utc::now())
            .await
            .unwrap();
        assert!((outcome.quality_score - 1.0).abs() < 1e-9);
        assert!(outcome.record.is_self_mapping());

        let stored = store.get_posting(outcome.posting_id).await.unwrap().unwrap();
        assert_eq!(stored.role_family.as_deref(), Some("data_analytics"));
        assert_eq!(stored.location_normalized.as_deref(), Some("Lagos, Nigeria"));
        assert_eq!(stored.education_level, Some(EducationLevel::Bachelors));
        assert_eq!(stored.experience.map(|e| e.band()), Some(ExperienceBand::ThreeToFive));
        assert!(stored.skills.contains(&"excel".to_string()));
        assert_eq!(stored.url_normalized, "https://jobs.example.com/1");
        assert!(stored.is_canonical());
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_counts_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let mut raws = (0..6)
            .map(|i| raw(&format!("https://jobs.example.com/{i}")))
            .collect::<Vec<_>>();
        raws.push(raw("https://jobs.example.com/0?utm_campaign=spring"));
        raws.push(raw("   "));

        let summary = pipeline(store.clone()).ingest_batch(raws, Utc::now()).await;
        assert_eq!(summary.accepted, 7);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.unique + summary.duplicates, 7);
        assert!(summary.duplicates >= 1);
        assert_eq!(store.canonical_postings().await.unwrap().len(), summary.unique);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_postings_all_land_under_heavy_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let taxonomy = Arc::new(Taxonomy::builtin());
        let resolver = Arc::new(DuplicateResolver::new(DedupConfig::default(), taxonomy.clone()));
        let pipeline = IngestPipeline::new(taxonomy, resolver, store.clone(), 32);
        // One shared role family and no descriptions, so every insert contends
        // on the same scope without any of them overlapping.
        let raws = (0..300)
            .map(|i| RawPosting {
                url: format!("https://jobs.example.com/{i}"),
                title: format!("Role {}", Uuid::new_v4().simple()),
                company: None,
                description: if i % 2 == 0 { String::new() } else { "Short.".into() },
                location: None,
                posted_at: None,
                skills: None,
                education: None,
                experience: None,
                salary: None,
            })
            .collect::<Vec<_>>();

        let summary = pipeline.ingest_batch(raws, Utc::now()).await;
        assert!(summary.failed.is_empty(), "first failure: {:?}", summary.failed.first());
        assert_eq!(summary.unique, 300);
        assert_eq!(store.canonical_count().await.unwrap(), 300);
    }
}
