// End-to-end checks over the in-memory store: ingest, resolve, aggregate, commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use mvil_core::{DedupeRecord, ExperienceBand, MatchStrategy, RawPosting};
use mvil_normalize::Taxonomy;
use mvil_storage::{BaselineStore, CorpusStore, MemoryStore, StoreError};
use mvil_sync::{
    AggregationError, InsightsService, MvilConfig, RefreshMode, RefreshOutcome,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn raw(url: &str, title: &str, company: &str, description: &str, skills: Value) -> RawPosting {
    RawPosting {
        url: url.into(),
        title: title.into(),
        company: Some(company.into()),
        description: description.into(),
        location: None,
        posted_at: None,
        skills: Some(skills),
        education: Some(json!("BSc Economics")),
        experience: None,
        salary: None,
    }
}

fn service() -> (InsightsService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = InsightsService::new(
        MvilConfig::default(),
        Taxonomy::builtin(),
        store.clone(),
        store.clone(),
    );
    (service, store)
}

/// Three distinct data_analytics postings: titles, employers and descriptions
/// differ enough that none of the duplicate layers fire.
fn analytics_trio() -> Vec<RawPosting> {
    vec![
        raw(
            "https://jobs.example.com/a",
            "Data Analyst",
            "Kobo Logistics",
            "Own weekly sales dashboards, clean point of sale extracts and brief regional managers every Monday morning.",
            json!(["MS Excel", "SQL", "Python", "Tableau", "Power BI"]),
        ),
        raw(
            "https://careers.example.org/b",
            "Data Scientist",
            "Zenith Microfinance",
            "Build credit scoring models on repayment histories and explain feature drift to the risk committee quarterly.",
            json!(["Excel Macros", "R", "Statistics", "Machine Learning", "SQL"]),
        ),
        raw(
            "https://hire.example.net/c",
            "Business Intelligence Analyst",
            "Harbor Telecom",
            "Model subscriber churn cohorts inside the warehouse and publish executive scorecards through our reporting portal.",
            json!(["Advanced Excel", "Looker", "SQL", "dbt", "Python"]),
        ),
    ]
}

#[tokio::test]
async fn tracking_params_resolve_to_exact_url_repost() {
    let (service, store) = service();
    let seen = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).single().unwrap();
    let first = service
        .ingest
        .ingest_one(
            raw(
                "https://jobs.example.com/x?utm_source=twitter&fbclid=abc",
                "Data Analyst",
                "Kobo Logistics",
                "Short role.",
                json!(["sql"]),
            ),
            seen,
        )
        .await
        .unwrap();
    let second = service
        .ingest
        .ingest_one(
            raw(
                "https://jobs.example.com/x",
                "Data Analyst",
                "Kobo Logistics",
                "Short role.",
                json!(["sql"]),
            ),
            seen + Duration::hours(1),
        )
        .await
        .unwrap();

    assert!(first.record.is_self_mapping());
    assert_eq!(second.record.canonical_posting_id, first.posting_id);
    assert_eq!(second.record.match_strategy, MatchStrategy::ExactUrl);
    assert_eq!(second.record.similarity_score, 1.0);

    let canonical: DedupeRecord = store.get_dedupe_record(first.posting_id).await.unwrap().unwrap();
    assert_eq!(canonical.repost_count, 1);
    let posting = store.get_posting(first.posting_id).await.unwrap().unwrap();
    assert_eq!(posting.last_seen, seen + Duration::hours(1));
    assert_eq!(posting.first_seen, seen);
}

#[tokio::test]
async fn skill_variants_collapse_into_one_baseline_row() {
    let (service, _store) = service();
    let (summary, outcome) = service.ingest_batch(analytics_trio(), true).await;
    assert_eq!(summary.unique, 3);
    assert!(summary.failed.is_empty());
    assert!(matches!(outcome, Some(RefreshOutcome::Completed(_))));

    let family = service
        .baselines
        .baselines_for_family("data_analytics")
        .await
        .unwrap()
        .unwrap();
    let excel = family
        .skill
        .iter()
        .filter(|row| row.skill_name.contains("excel"))
        .collect::<Vec<_>>();
    assert_eq!(excel.len(), 1);
    assert_eq!(excel[0].skill_name, "excel");
    assert_eq!(excel[0].count_ads, 3);
    assert!((excel[0].frequency - 1.0).abs() < 1e-9);
    assert!(family.low_confidence);
    assert_eq!(family.demand.count_ads, 3);
    assert_eq!(family.demand.unique_employers, 3);
}

#[tokio::test]
async fn experience_expressions_land_in_expected_bins() {
    let (service, _store) = service();
    let mut raws = analytics_trio();
    for (posting, experience) in raws.iter_mut().zip(["2-4 years", "entry level", "7 yrs"]) {
        posting.experience = Some(json!(experience));
    }
    service.ingest_batch(raws, true).await;

    let family = service
        .baselines
        .baselines_for_family("data_analytics")
        .await
        .unwrap()
        .unwrap();
    let bands = family
        .experience
        .iter()
        .map(|row| (row.experience_band, row.count_ads))
        .collect::<BTreeSet<_>>();
    assert_eq!(
        bands,
        BTreeSet::from([
            (ExperienceBand::ZeroToTwo, 1),
            (ExperienceBand::ThreeToFive, 1),
            (ExperienceBand::FiveToTen, 1),
        ])
    );
    let total: f64 = family.experience.iter().map(|row| row.share).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn failed_commit_keeps_previous_baselines_readable() {
    let (service, store) = service();
    service.ingest_batch(analytics_trio(), true).await;
    let before = service.baselines.current_baselines().await.unwrap();
    assert!(!before.is_empty());

    store.fail_next_commit();
    let err = service
        .refresh
        .refresh_all(RefreshMode::Forced, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AggregationError::Store(StoreError::Unavailable(_))));
    assert_eq!(service.baselines.current_baselines().await.unwrap(), before);

    let retried = service
        .refresh
        .refresh_all(RefreshMode::Forced, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(retried.rows_written, before.rows_written());
}

#[tokio::test]
async fn families_below_three_postings_emit_nothing() {
    let (service, _store) = service();
    let mut raws = analytics_trio();
    raws.pop();
    let (_, outcome) = service.ingest_batch(raws, true).await;
    let Some(RefreshOutcome::Completed(summary)) = outcome else {
        panic!("refresh should have run");
    };
    assert_eq!(summary.rows_written, 0);
    assert!(service.baselines.has_any_baselines().await.unwrap());
    assert!(service
        .baselines
        .baselines_for_family("data_analytics")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn duplicates_never_chain_and_evidence_points_at_canonicals() {
    let (service, store) = service();
    let mut raws = analytics_trio();
    let reposts = raws
        .iter()
        .map(|r| RawPosting {
            url: format!("{}?utm_medium=email", r.url),
            ..r.clone()
        })
        .collect::<Vec<_>>();
    raws.extend(reposts);
    raws.push(RawPosting {
        url: "https://mirror.example.com/copy-of-a".into(),
        ..analytics_trio()[0].clone()
    });

    let (summary, _) = service.ingest_batch(raws, true).await;
    assert_eq!(summary.unique, 3);
    assert_eq!(summary.duplicates, 4);

    let records = store.all_dedupe_records().await;
    let canonical_ids = records
        .iter()
        .filter(|r| r.is_self_mapping())
        .map(|r| r.posting_id)
        .collect::<BTreeSet<_>>();
    for record in &records {
        assert!(canonical_ids.contains(&record.canonical_posting_id));
    }

    let set = service.baselines.current_baselines().await.unwrap();
    for demand in &set.demand {
        assert_eq!(demand.count_ads, 3);
        for id in &demand.evidence.sample_job_ids {
            assert!(canonical_ids.contains(id));
        }
    }
    let reposted = records
        .iter()
        .filter(|r| r.is_self_mapping())
        .map(|r| r.repost_count)
        .sum::<u32>();
    assert_eq!(reposted, 4);
}

#[tokio::test]
async fn identical_corpus_gives_identical_baselines() {
    let (service, _store) = service();
    service.ingest_batch(analytics_trio(), false).await;
    let cancel = CancellationToken::new();

    let first = service.refresh.refresh_all(RefreshMode::Forced, &cancel).await.unwrap();
    let a = service.baselines.current_baselines().await.unwrap();
    let second = service.refresh.refresh_all(RefreshMode::Forced, &cancel).await.unwrap();
    let b = service.baselines.current_baselines().await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(a.skill.len(), b.skill.len());
    for (x, y) in a.skill.iter().zip(&b.skill) {
        assert_eq!(x.skill_name, y.skill_name);
        assert_eq!(x.count_ads, y.count_ads);
        assert_eq!(x.evidence.sample_job_ids, y.evidence.sample_job_ids);
    }
    assert_eq!(a.demand[0].evidence.sample_job_ids, b.demand[0].evidence.sample_job_ids);
}
