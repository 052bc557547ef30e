//! Index export: CSV and Parquet tables plus JSON summaries.
//!
//! Four tables land under `<run_dir>/indices/`:
//! `{fed,ecb}_{forward_filled,sparse}.{csv,parquet}`. Institutions without
//! any validated speech still get header-only tables so downstream tooling
//! always finds all four.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cbspeech_core::domain::{DailyIndexRow, IndexTables, Institution};
use polars::prelude::{Column, DataFrame, DataType, ParquetWriter};
use serde::Serialize;

use crate::store::{write_bytes_atomic, write_json_atomic};

// ─── CSV ────────────────────────────────────────────────────────────

/// Render index rows as CSV in [`DailyIndexRow::COLUMNS`] order.
pub fn index_rows_csv(rows: &[DailyIndexRow]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(DailyIndexRow::COLUMNS)?;

    for r in rows {
        let mut record = Vec::with_capacity(DailyIndexRow::COLUMNS.len());
        record.push(r.date.to_string());
        record.push(r.institution.as_str().to_string());
        record.extend(r.metrics().iter().map(|v| format!("{v:.4}")));
        record.push(r.speech_count.to_string());
        wtr.write_record(&record)?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Parquet ────────────────────────────────────────────────────────

/// Build a DataFrame with one column per [`DailyIndexRow::COLUMNS`] entry.
pub fn index_rows_dataframe(rows: &[DailyIndexRow]) -> Result<DataFrame> {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).context("epoch date")?;
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch).num_days() as i32)
        .collect();
    let institutions: Vec<&str> = rows.iter().map(|r| r.institution.as_str()).collect();
    let counts: Vec<u64> = rows.iter().map(|r| r.speech_count as u64).collect();

    let mut columns = vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .context("date column cast")?,
        Column::new("institution".into(), institutions),
    ];
    for (i, name) in DailyIndexRow::COLUMNS[2..13].iter().enumerate() {
        let values: Vec<f64> = rows.iter().map(|r| r.metrics()[i]).collect();
        columns.push(Column::new((*name).into(), values));
    }
    columns.push(Column::new("speech_count".into(), counts));

    DataFrame::new(columns).context("index dataframe creation")
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    ParquetWriter::new(&mut file)
        .finish(df)
        .with_context(|| format!("write parquet {}", tmp.display()))?;
    file.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        anyhow::Error::new(e).context(format!("rename into {}", path.display()))
    })?;
    Ok(())
}

// ─── Bundle ─────────────────────────────────────────────────────────

/// Write all four index tables as CSV and Parquet. Returns the written paths.
pub fn write_index_tables(tables: &IndexTables, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::new();

    for institution in Institution::ALL {
        for (view, source) in [
            ("forward_filled", &tables.forward_filled),
            ("sparse", &tables.sparse),
        ] {
            let rows: &[DailyIndexRow] = source.get(&institution).map(Vec::as_slice).unwrap_or(&[]);
            let stem = format!("{}_{view}", institution.slug());

            let csv_path = dir.join(format!("{stem}.csv"));
            write_bytes_atomic(&csv_path, index_rows_csv(rows)?.as_bytes())?;
            written.push(csv_path);

            let parquet_path = dir.join(format!("{stem}.parquet"));
            let mut df = index_rows_dataframe(rows)?;
            write_parquet(&mut df, &parquet_path)?;
            written.push(parquet_path);

            tracing::info!(table = %stem, rows = rows.len(), "index table written");
        }
    }
    Ok(written)
}

/// Pretty JSON summary written atomically.
pub fn write_json_summary<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_json_atomic(path, value).with_context(|| format!("write {}", path.display()))
}
