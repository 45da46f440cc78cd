//! Parquet snapshot of the cleaned dataset for analysis collaborators.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use jobmarket_core::JobPosting;
use jobmarket_storage::JobStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub since: Option<NaiveDate>,
    pub postings: usize,
    pub skill_rows: usize,
    pub files: Vec<ExportFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `job_postings.parquet`, `job_skills.parquet` and `manifest.json`
/// into `out_dir`.
pub async fn export_dataset(store: &JobStore, out_dir: &Path, since: Option<NaiveDate>) -> Result<ExportManifest> {
    let postings = store
        .postings_since(since)
        .await
        .context("loading postings for export")?;
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let postings_path = out_dir.join("job_postings.parquet");
    let skills_path = out_dir.join("job_skills.parquet");
    write_postings_parquet(&postings_path, &postings)?;
    let skill_rows = write_skills_parquet(&skills_path, &postings)?;

    let manifest = ExportManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        since,
        postings: postings.len(),
        skill_rows,
        files: vec![
            manifest_entry("job_postings", out_dir, &postings_path)?,
            manifest_entry("job_skills", out_dir, &skills_path)?,
        ],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        postings = manifest.postings,
        skill_rows,
        out_dir = %out_dir.display(),
        "dataset exported"
    );
    Ok(manifest)
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_postings_parquet(path: &PathBuf, postings: &[JobPosting]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("city_unmapped", DataType::Boolean, true),
        ArrowField::new("experience_min", DataType::UInt32, true),
        ArrowField::new("experience_max", DataType::UInt32, true),
        ArrowField::new("experience_level", DataType::Utf8, false),
        ArrowField::new("salary_min", DataType::Float64, true),
        ArrowField::new("salary_max", DataType::Float64, true),
        ArrowField::new("salary_currency", DataType::Utf8, true),
        ArrowField::new("salary_disclosed", DataType::Boolean, false),
        ArrowField::new("posted_on", DataType::Utf8, true),
        ArrowField::new("source_url", DataType::Utf8, true),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("scraped_at", DataType::Utf8, false),
    ]));

    let keys = StringArray::from(postings.iter().map(|p| Some(p.identity_key.as_str())).collect::<Vec<_>>());
    let titles = StringArray::from(postings.iter().map(|p| Some(p.title.as_str())).collect::<Vec<_>>());
    let companies = StringArray::from(postings.iter().map(|p| p.company.as_deref()).collect::<Vec<_>>());
    let cities = StringArray::from(
        postings
            .iter()
            .map(|p| p.city.as_ref().map(|c| c.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let unmapped = BooleanArray::from(
        postings
            .iter()
            .map(|p| p.city.as_ref().map(|c| c.unmapped))
            .collect::<Vec<_>>(),
    );
    let exp_min = UInt32Array::from(postings.iter().map(|p| p.experience.min_years).collect::<Vec<_>>());
    let exp_max = UInt32Array::from(postings.iter().map(|p| p.experience.max_years).collect::<Vec<_>>());
    let levels = StringArray::from(
        postings
            .iter()
            .map(|p| Some(p.experience.level().as_str()))
            .collect::<Vec<_>>(),
    );
    let sal_min = Float64Array::from(postings.iter().map(|p| p.salary.min).collect::<Vec<_>>());
    let sal_max = Float64Array::from(postings.iter().map(|p| p.salary.max).collect::<Vec<_>>());
    let currencies = StringArray::from(postings.iter().map(|p| p.salary.currency.as_deref()).collect::<Vec<_>>());
    let disclosed = BooleanArray::from(postings.iter().map(|p| p.salary.disclosed).collect::<Vec<_>>());
    let posted = StringArray::from(
        postings
            .iter()
            .map(|p| p.posted_on.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(postings.iter().map(|p| p.source_url.as_deref()).collect::<Vec<_>>());
    let descriptions = StringArray::from(postings.iter().map(|p| p.description.as_deref()).collect::<Vec<_>>());
    let scraped = StringArray::from(
        postings
            .iter()
            .map(|p| Some(p.scraped_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(titles),
            Arc::new(companies),
            Arc::new(cities),
            Arc::new(unmapped),
            Arc::new(exp_min),
            Arc::new(exp_max),
            Arc::new(levels),
            Arc::new(sal_min),
            Arc::new(sal_max),
            Arc::new(currencies),
            Arc::new(disclosed),
            Arc::new(posted),
            Arc::new(urls),
            Arc::new(descriptions),
            Arc::new(scraped),
        ],
    )
    .context("building job_postings record batch")?;
    write_parquet(path, batch)
}

fn write_skills_parquet(path: &PathBuf, postings: &[JobPosting]) -> Result<usize> {
    let rows = postings
        .iter()
        .flat_map(JobPosting::skill_associations)
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("skill", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, true),
    ]));
    let keys = StringArray::from(rows.iter().map(|r| Some(r.identity_key.as_str())).collect::<Vec<_>>());
    let skills = StringArray::from(rows.iter().map(|r| Some(r.skill.as_str())).collect::<Vec<_>>());
    let categories = StringArray::from(rows.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(skills), Arc::new(categories)])
        .context("building job_skills record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ExportFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FixedClock, PipelinePolicy, ScrapePipeline};
    use crate::test_support::{assembler, extractor, fixtures_dir};
    use arrow_array::Array;
    use chrono::TimeZone;
    use jobmarket_adapters::ReplayPageSource;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    async fn seeded_store() -> JobStore {
        let store = JobStore::in_memory().await.expect("in-memory store");
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().expect("valid timestamp");
        ScrapePipeline::new(
            Arc::new(ReplayPageSource::new(fixtures_dir())),
            Arc::new(extractor()),
            Arc::new(assembler()),
            store.clone(),
            PipelinePolicy::default(),
        )
        .with_clock(Arc::new(FixedClock(at)))
        .run()
        .await;
        store
    }

    fn read_batches(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).expect("open file");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("parquet reader")
            .build()
            .expect("build reader")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect body")
    }

    #[tokio::test]
    async fn export_writes_both_tables_and_a_manifest() {
        let store = seeded_store().await;
        let out = tempfile::tempdir().expect("tempdir");
        let manifest = export_dataset(&store, out.path(), None).await.expect("export dataset");

        assert_eq!(manifest.postings, 4);
        assert_eq!(
            manifest.skill_rows as i64,
            store.count_skill_associations().await.expect("count skill rows")
        );
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(out.path().join(&file.path)).expect("read file");
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(file.sha256, hex::encode(Sha256::digest(&bytes)));
        }

        let written: ExportManifest =
            serde_json::from_str(&std::fs::read_to_string(out.path().join(MANIFEST_FILE)).expect("read file")).expect("parse json");
        assert_eq!(written, manifest);

        let batches = read_batches(&out.path().join("job_postings.parquet"));
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 4);
        let levels = batches[0]
            .column_by_name("experience_level")
            .expect("named column")
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("string column");
        let mut levels = (0..levels.len()).map(|i| levels.value(i).to_string()).collect::<Vec<_>>();
        levels.sort();
        assert_eq!(levels, vec!["entry", "entry", "mid", "senior"]);
        let descriptions = batches[0].column_by_name("description").expect("description column");
        assert_eq!(descriptions.null_count(), 4);
    }

    #[tokio::test]
    async fn since_filter_limits_the_snapshot() {
        let store = seeded_store().await;
        let out = tempfile::tempdir().expect("tempdir");
        let manifest = export_dataset(&store, out.path(), NaiveDate::from_ymd_opt(2026, 4, 1))
            .await
            .expect("export dataset");
        assert_eq!(manifest.postings, 0);
        assert_eq!(manifest.skill_rows, 0);
        let batches = read_batches(&out.path().join("job_skills.parquet"));
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 0);
    }
}
