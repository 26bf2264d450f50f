//! Parquet persistence of coverage tables.
//!
//! Columns: `divide_id` (utf8), `ids` (int64), `coverage` (float64),
//! `global_idx_y` (int64), `global_idx_x` (int64).

use anyhow::{Context, Result, anyhow};
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{CoverageRow, CoverageTable};

/// `{out_dir}/{name}_coverage.parquet`
pub fn coverage_path(out_dir: &Path, name: &str) -> PathBuf {
    out_dir.join(format!("{name}_coverage.parquet"))
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("divide_id", DataType::Utf8, false),
        Field::new("ids", DataType::Int64, false),
        Field::new("coverage", DataType::Float64, false),
        Field::new("global_idx_y", DataType::Int64, false),
        Field::new("global_idx_x", DataType::Int64, false),
    ]))
}

/// Writes `table` to `path`, replacing any previous file.
pub fn write_coverage(path: &Path, table: &CoverageTable) -> Result<()> {
    let rows = table.rows();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.divide_id.as_str()))),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.cell_id))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.coverage))),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.global_idx_y))),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.global_idx_x))),
    ];
    let batch = RecordBatch::try_new(schema(), columns)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    std::fs::rename(&tmp, path).with_context(|| format!("moving cache into {}", path.display()))?;
    Ok(())
}

pub fn read_coverage(path: &Path) -> Result<CoverageTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?
        .build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let ids = column(&batch, "divide_id", &DataType::Utf8)?;
        let ids = ids
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| anyhow!("divide_id is not a string column"))?;
        let cells = int64_column(&batch, "ids")?;
        let coverage = column(&batch, "coverage", &DataType::Float64)?;
        let coverage = coverage
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| anyhow!("coverage is not a float column"))?;
        let ys = int64_column(&batch, "global_idx_y")?;
        let xs = int64_column(&batch, "global_idx_x")?;

        for i in 0..batch.num_rows() {
            rows.push(CoverageRow {
                divide_id: ids.value(i).to_string(),
                cell_id: cells.value(i),
                coverage: coverage.value(i),
                global_idx_y: ys.value(i),
                global_idx_x: xs.value(i),
            });
        }
    }
    Ok(CoverageTable::new(rows))
}

/// Column `name` cast to `data_type`, so caches written with other integer
/// or string widths still load.
fn column(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<ArrayRef> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("coverage cache has no '{name}' column"))?;
    Ok(cast(col, data_type)?)
}

fn int64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array> {
    let col = column(batch, name, &DataType::Int64)?;
    col.as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| anyhow!("{name} is not an integer column"))
}

/// Loads the cached table at `path`, or computes and caches it when the file
/// is missing or `redo` is set.
pub fn load_or_compute<F>(path: &Path, redo: bool, compute: F) -> Result<CoverageTable>
where
    F: FnOnce() -> Result<CoverageTable>,
{
    if path.exists() && !redo {
        info!(path = %path.display(), "Reading coverage from cache");
        return read_coverage(path);
    }
    info!(path = %path.display(), redo, "Computing coverage");
    let table = compute()?;
    write_coverage(path, &table)?;
    Ok(table)
}

/// Removes the cached table at `path` so the next [`load_or_compute`]
/// rebuilds it. A missing file is not an error.
pub fn discard_coverage(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Discarded cached coverage");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
