//! Parquet snapshots of the stored conditions and the report/conditions join, plus a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use choka_core::{DailyConditions, TideEvent};
use choka_storage::ConditionsStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `daily_conditions.parquet`, `training_rows.parquet` and `manifest.json` into `out_dir`.
pub async fn export_training_snapshot(store: &ConditionsStore, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let conditions = store
        .all_daily_conditions()
        .await
        .context("reading daily conditions")?;
    let training = store.training_rows().await.context("reading training rows")?;

    let conditions_path = out_dir.join("daily_conditions.parquet");
    let training_path = out_dir.join("training_rows.parquet");
    write_conditions_parquet(&conditions_path, &conditions)?;

    let joined: Vec<&DailyConditions> = training.iter().map(|row| &row.conditions).collect();
    let (mut fields, mut columns) = conditions_columns(&joined);
    fields.insert(1, ArrowField::new("prefecture", DataType::Utf8, false));
    fields.insert(2, ArrowField::new("fish_name", DataType::Utf8, false));
    columns.insert(
        1,
        Arc::new(StringArray::from_iter_values(training.iter().map(|r| r.prefecture.as_str()))),
    );
    columns.insert(
        2,
        Arc::new(StringArray::from_iter_values(training.iter().map(|r| r.fish_name.as_str()))),
    );
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building training_rows record batch")?;
    write_parquet(&training_path, batch)?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("daily_conditions", out_dir, &conditions_path, conditions.len())?,
            manifest_entry("training_rows", out_dir, &training_path, training.len())?,
        ],
    };

    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        out_dir = %out_dir.display(),
        conditions = conditions.len(),
        training_rows = training.len(),
        "training snapshot exported"
    );
    Ok(manifest_path)
}

fn write_conditions_parquet(path: &Path, conditions: &[DailyConditions]) -> Result<()> {
    let rows: Vec<&DailyConditions> = conditions.iter().collect();
    let (fields, columns) = conditions_columns(&rows);
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building daily_conditions record batch")?;
    write_parquet(path, batch)
}

/// Flattened conditions columns; `date` first, tide columns nullable.
fn conditions_columns(rows: &[&DailyConditions]) -> (Vec<ArrowField>, Vec<ArrayRef>) {
    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();

    let mut utf8 = |name: &str, nullable: bool, values: Vec<Option<String>>| {
        fields.push(ArrowField::new(name, DataType::Utf8, nullable));
        columns.push(Arc::new(StringArray::from(values)));
    };
    utf8(
        "date",
        false,
        rows.iter().map(|c| Some(c.date.to_string())).collect(),
    );
    utf8(
        "tide_name",
        true,
        rows.iter().map(|c| c.tide.tide_name.clone()).collect(),
    );
    for (slot, name) in EVENT_COLUMNS.iter().enumerate() {
        utf8(
            &format!("{name}_time"),
            true,
            rows.iter().map(|c| tide_event(c, slot).map(|e| e.time.clone())).collect(),
        );
    }
    utf8("sun_rise", true, rows.iter().map(|c| c.tide.sunrise.clone()).collect());
    utf8("sun_set", true, rows.iter().map(|c| c.tide.sunset.clone()).collect());
    utf8("moon_rise", true, rows.iter().map(|c| c.tide.moonrise.clone()).collect());
    utf8("moon_set", true, rows.iter().map(|c| c.tide.moonset.clone()).collect());
    utf8(
        "degraded_sources",
        false,
        rows.iter()
            .map(|c| {
                Some(
                    c.degraded_sources
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })
            .collect(),
    );

    let mut float = |name: &str, nullable: bool, values: Vec<Option<f64>>| {
        fields.push(ArrowField::new(name, DataType::Float64, nullable));
        columns.push(Arc::new(Float64Array::from(values)));
    };
    float("min_temp", false, rows.iter().map(|c| Some(c.weather.min_temp)).collect());
    float("max_temp", false, rows.iter().map(|c| Some(c.weather.max_temp)).collect());
    float(
        "precipitation",
        false,
        rows.iter().map(|c| Some(c.weather.precipitation_probability)).collect(),
    );
    float("wave_height", false, rows.iter().map(|c| Some(c.weather.wave_height)).collect());
    for (slot, name) in EVENT_COLUMNS.iter().enumerate() {
        float(
            &format!("{name}_height"),
            true,
            rows.iter().map(|c| tide_event(c, slot).map(|e| e.height_cm)).collect(),
        );
    }
    float("moon_age", true, rows.iter().map(|c| c.tide.moon_age).collect());

    (fields, columns)
}

const EVENT_COLUMNS: [&str; 4] = ["high_tide_1", "high_tide_2", "low_tide_1", "low_tide_2"];

fn tide_event(conditions: &DailyConditions, slot: usize) -> Option<&TideEvent> {
    let tide = &conditions.tide;
    match slot {
        0 => tide.high_tide_1.as_ref(),
        1 => tide.high_tide_2.as_ref(),
        2 => tide.low_tide_1.as_ref(),
        3 => tide.low_tide_2.as_ref(),
        _ => None,
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
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

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
