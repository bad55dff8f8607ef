//! Parquet snapshots of the current baselines plus a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{ArrayRef, BooleanArray, Date32Array, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use mvil_core::{BaselineEvidence, BaselineSet, RefreshRun};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("building record batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("writing parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("serializing manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> ExportError {
    let path = path.display().to_string();
    move |source| ExportError::Io { action, path, source }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Option<Uuid>,
    pub computed_at: Option<DateTime<Utc>>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the four baseline tables and `manifest.json` into `dir`; returns the
/// manifest path.
pub async fn export_baseline_snapshots(
    dir: &Path,
    set: &BaselineSet,
    run: Option<&RefreshRun>,
) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(dir)
        .await
        .map_err(io_error("creating", dir))?;

    let skill_path = dir.join("skill_baselines.parquet");
    let education_path = dir.join("education_baselines.parquet");
    let experience_path = dir.join("experience_baselines.parquet");
    let demand_path = dir.join("demand_snapshots.parquet");

    write_parquet(&skill_path, skill_batch(set)?)?;
    write_parquet(&education_path, education_batch(set)?)?;
    write_parquet(&experience_path, experience_batch(set)?)?;
    write_parquet(&demand_path, demand_batch(set)?)?;

    let manifest = SnapshotManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        run_id: run.map(|r| r.run_id),
        computed_at: run.map(|r| r.computed_at),
        files: vec![
            manifest_entry("skill_baselines", dir, &skill_path, set.skill.len())?,
            manifest_entry("education_baselines", dir, &education_path, set.education.len())?,
            manifest_entry("experience_baselines", dir, &experience_path, set.experience.len())?,
            manifest_entry("demand_snapshots", dir, &demand_path, set.demand.len())?,
        ],
    };

    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&manifest_path, bytes)
        .await
        .map_err(io_error("writing", &manifest_path))?;
    info!(path = %manifest_path.display(), "baseline snapshots exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<(), ExportError> {
    let file = File::create(path).map_err(io_error("creating", path))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile, ExportError> {
    let bytes = std::fs::read(path).map_err(io_error("reading", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(SnapshotFile {
        name: name.to_string(),
        path: path.strip_prefix(dir).unwrap_or(path).display().to_string(),
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

fn evidence_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new(
            "sample_job_ids",
            DataType::List(Arc::new(ArrowField::new("item", DataType::Utf8, true))),
            false,
        ),
        ArrowField::new("count_total_jobs_used", DataType::UInt32, false),
        ArrowField::new("computed_at", DataType::Utf8, false),
        ArrowField::new("low_confidence", DataType::Boolean, false),
    ]
}

fn evidence_columns<'a>(evidence: impl Iterator<Item = &'a BaselineEvidence> + Clone) -> Vec<ArrayRef> {
    let mut samples = ListBuilder::new(StringBuilder::new());
    for e in evidence.clone() {
        for id in &e.sample_job_ids {
            samples.values().append_value(id.to_string());
        }
        samples.append(true);
    }
    vec![
        Arc::new(samples.finish()),
        Arc::new(UInt32Array::from(
            evidence.clone().map(|e| e.count_total_jobs_used).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            evidence.clone().map(|e| e.computed_at.to_rfc3339()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            evidence.map(|e| e.low_confidence).collect::<Vec<_>>(),
        )),
    ]
}

fn batch(mut fields: Vec<ArrowField>, mut columns: Vec<ArrayRef>, evidence: Vec<ArrayRef>) -> Result<RecordBatch, ArrowError> {
    fields.extend(evidence_fields());
    columns.extend(evidence);
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

fn skill_batch(set: &BaselineSet) -> Result<RecordBatch, ArrowError> {
    let rows = &set.skill;
    batch(
        vec![
            ArrowField::new("role_family", DataType::Utf8, false),
            ArrowField::new("skill_name", DataType::Utf8, false),
            ArrowField::new("frequency", DataType::Float64, false),
            ArrowField::new("count_ads", DataType::UInt32, false),
        ],
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.role_family.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| r.skill_name.as_str()).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.frequency).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.count_ads).collect::<Vec<_>>())),
        ],
        evidence_columns(rows.iter().map(|r| &r.evidence)),
    )
}

fn education_batch(set: &BaselineSet) -> Result<RecordBatch, ArrowError> {
    let rows = &set.education;
    batch(
        vec![
            ArrowField::new("role_family", DataType::Utf8, false),
            ArrowField::new("education_level", DataType::Utf8, false),
            ArrowField::new("share", DataType::Float64, false),
            ArrowField::new("count_ads", DataType::UInt32, false),
        ],
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.role_family.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| r.education_level.as_str()).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.share).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.count_ads).collect::<Vec<_>>())),
        ],
        evidence_columns(rows.iter().map(|r| &r.evidence)),
    )
}

fn experience_batch(set: &BaselineSet) -> Result<RecordBatch, ArrowError> {
    let rows = &set.experience;
    batch(
        vec![
            ArrowField::new("role_family", DataType::Utf8, false),
            ArrowField::new("experience_band", DataType::Utf8, false),
            ArrowField::new("share", DataType::Float64, false),
            ArrowField::new("count_ads", DataType::UInt32, false),
        ],
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.role_family.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| r.experience_band.as_str()).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.share).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.count_ads).collect::<Vec<_>>())),
        ],
        evidence_columns(rows.iter().map(|r| &r.evidence)),
    )
}

/// Days from the common era to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn demand_batch(set: &BaselineSet) -> Result<RecordBatch, ArrowError> {
    let rows = &set.demand;
    batch(
        vec![
            ArrowField::new("role_family", DataType::Utf8, false),
            ArrowField::new("date", DataType::Date32, false),
            ArrowField::new("count_ads", DataType::UInt32, false),
            ArrowField::new("unique_employers", DataType::UInt32, false),
        ],
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.role_family.as_str()).collect::<Vec<_>>())),
            Arc::new(Date32Array::from(rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.count_ads).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.unique_employers).collect::<Vec<_>>())),
        ],
        evidence_columns(rows.iter().map(|r| &r.evidence)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mvil_core::{DemandSnapshot, SkillBaseline};

    fn evidence(n: u32) -> BaselineEvidence {
        BaselineEvidence {
            sample_job_ids: (0..n.min(10)).map(|_| Uuid::new_v4()).collect(),
            count_total_jobs_used: n,
            computed_at: Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).single().unwrap(),
            low_confidence: n < 10,
        }
    }

    #[test]
    fn epoch_day_conversion() {
        let d = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        assert_eq!(days_since_epoch(d), 10);
    }

    #[tokio::test]
    async fn writes_four_files_and_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let set = BaselineSet {
            skill: vec![SkillBaseline {
                role_family: "data_analytics".into(),
                skill_name: "excel".into(),
                frequency: 1.0,
                count_ads: 3,
                evidence: evidence(3),
            }],
            demand: vec![DemandSnapshot {
                role_family: "data_analytics".into(),
                date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
                count_ads: 3,
                unique_employers: 2,
                evidence: evidence(3),
            }],
            ..Default::default()
        };

        let manifest_path = export_baseline_snapshots(dir.path(), &set, None).await.unwrap();
        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 4);
        assert_eq!(manifest.run_id, None);
        for file in &manifest.files {
            let path = dir.path().join(&file.path);
            assert!(path.exists(), "{}", file.path);
            assert_eq!(file.sha256.len(), 64);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), file.bytes);
        }
        let skills = manifest.files.iter().find(|f| f.name == "skill_baselines").unwrap();
        assert_eq!(skills.rows, 1);
        let education = manifest.files.iter().find(|f| f.name == "education_baselines").unwrap();
        assert_eq!(education.rows, 0);
    }
}
