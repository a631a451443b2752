//! Result export — JSON, CSV, and Parquet artifact generation.
//!
//! Three formats for a completed run:
//! - **JSON**: full round-trip serialization with schema versioning
//! - **CSV**: the ranked score table for external analysis tools
//! - **Parquet**: columnar snapshot of the same table
//!
//! Persisted JSON carries a `schema_version`; unknown versions are rejected
//! on load.

use std::path::Path;

use anyhow::{bail, Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::scoring::{CompositeScoreRow, RunOutcome};

/// Current schema version for persisted artifacts.
pub const SCHEMA_VERSION: u32 = 1;

/// Versioned wrapper around a run outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub outcome: RunOutcome,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ─── JSON ───────────────────────────────────────────────────────────

pub fn export_json(outcome: &RunOutcome) -> Result<String> {
    let artifact = RunArtifact {
        schema_version: SCHEMA_VERSION,
        outcome: outcome.clone(),
    };
    serde_json::to_string_pretty(&artifact).context("failed to serialize run outcome to JSON")
}

pub fn import_json(json: &str) -> Result<RunOutcome> {
    let artifact: RunArtifact =
        serde_json::from_str(json).context("failed to deserialize run artifact from JSON")?;
    if artifact.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            artifact.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(artifact.outcome)
}

// ─── CSV ────────────────────────────────────────────────────────────

/// Export ranked rows as CSV.
///
/// Columns: rank, entity_id, date, score, then one `contrib:<factor>`
/// column per factor seen across the rows.
pub fn export_scores_csv(rows: &[CompositeScoreRow]) -> Result<String> {
    let mut factor_ids: Vec<String> = rows
        .iter()
        .flat_map(|r| r.contributions.keys().cloned())
        .collect();
    factor_ids.sort();
    factor_ids.dedup();

    let mut wtr = csv::Writer::from_writer(vec![]);

    let mut header = vec![
        "rank".to_string(),
        "entity_id".to_string(),
        "date".to_string(),
        "score".to_string(),
    ];
    header.extend(factor_ids.iter().map(|f| format!("contrib:{f}")));
    wtr.write_record(&header).context("write CSV header")?;

    for row in rows {
        let mut record = vec![
            row.rank.to_string(),
            row.entity_id.clone(),
            row.date.to_string(),
            format!("{:.6}", row.score),
        ];
        for factor in &factor_ids {
            record.push(
                row.contributions
                    .get(factor)
                    .map(|c| format!("{c:.6}"))
                    .unwrap_or_default(),
            );
        }
        wtr.write_record(&record).context("write CSV record")?;
    }

    let bytes = wtr.into_inner().context("flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

// ─── Parquet ────────────────────────────────────────────────────────

/// Write the ranked score table as a Parquet file.
pub fn write_scores_parquet(rows: &[CompositeScoreRow], path: &Path) -> Result<()> {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();

    let ranks: Vec<u32> = rows.iter().map(|r| r.rank as u32).collect();
    let entities: Vec<&str> = rows.iter().map(|r| r.entity_id.as_str()).collect();
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch).num_days() as i32)
        .collect();
    let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();

    let mut df = DataFrame::new(vec![
        Column::new("rank".into(), ranks),
        Column::new("entity_id".into(), entities),
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .context("date cast")?,
        Column::new("score".into(), scores),
    ])
    .context("dataframe creation")?;

    let file = std::fs::File::create(path).context("create parquet file")?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .context("write parquet")?;
    Ok(())
}
