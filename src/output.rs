//! Output persistence for aggregated forcing.
//!
//! Supports per-catchment and basin-mean CSV series, the ngen NetCDF layout
//! (cargo feature `netcdf`), and CSV append of run records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info};

use crate::pipeline::ForcingTable;
use crate::time::CSV_TIME_FORMAT;

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format(CSV_TIME_FORMAT).to_string()
}

/// Shortest round-trip representation; NaN is written as an empty field.
pub fn format_value(v: f64) -> String {
    if v.is_nan() { String::new() } else { v.to_string() }
}

fn write_series<F>(path: &Path, variables: &[String], times: &[DateTime<Utc>], value: F) -> Result<()>
where
    F: Fn(usize, usize) -> f64,
{
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;

    let mut header = Vec::with_capacity(variables.len() + 1);
    header.push("time".to_string());
    header.extend(variables.iter().cloned());
    writer.write_record(&header)?;

    for (t, time) in times.iter().enumerate() {
        let mut record = Vec::with_capacity(variables.len() + 1);
        record.push(format_time(time));
        record.extend((0..variables.len()).map(|v| format_value(value(v, t))));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes one `{id}{suffix}.csv` per catchment into `dir`, with a `time`
/// column followed by one column per variable.
#[tracing::instrument(skip(table), fields(dir = %dir.display(), catchments = table.divide_ids.len()))]
pub fn write_catchment_csvs(table: &ForcingTable, dir: &Path, suffix: &str) -> Result<usize> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (k, id) in table.divide_ids.iter().enumerate() {
        let series = table.catchment_series(k);
        let path = dir.join(format!("{id}{suffix}.csv"));
        write_series(&path, &table.variables, &table.times, |v, t| series[[v, t]])?;
    }
    debug!(files = table.divide_ids.len(), "Wrote catchment series");
    Ok(table.divide_ids.len())
}

/// Writes the mean over catchments for every time step.
pub fn write_basin_csv(table: &ForcingTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mean = table.basin_mean();
    write_series(path, &table.variables, &table.times, |v, t| mean[[v, t]])?;
    info!(path = %path.display(), steps = table.times.len(), "Wrote basin mean series");
    Ok(())
}

/// Writes `table` in the layout ngen reads: dimensions `catchment-id` x
/// `time`, a string variable `ids`, `Time` as epoch seconds per catchment and
/// one variable per forcing field.
#[cfg(feature = "netcdf")]
pub fn write_netcdf(table: &ForcingTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let n_ids = table.divide_ids.len();
    let n_times = table.times.len();
    let mut file = netcdf::create(path).with_context(|| format!("creating {}", path.display()))?;
    file.add_dimension("catchment-id", n_ids)?;
    file.add_dimension("time", n_times)?;

    let mut ids = file.add_string_variable("ids", &["catchment-id"])?;
    for (i, id) in table.divide_ids.iter().enumerate() {
        ids.put_string(id, [i])?;
    }

    let epoch: Vec<f64> = table.times.iter().map(|t| t.timestamp() as f64).collect();
    let time_values: Vec<f64> = (0..n_ids).flat_map(|_| epoch.iter().copied()).collect();
    let mut time = file.add_variable::<f64>("Time", &["catchment-id", "time"])?;
    time.put_values(&time_values, ..)?;
    time.put_attribute("units", "seconds since 1970-01-01 00:00:00")?;

    for (v, name) in table.variables.iter().enumerate() {
        let values: Vec<f64> = (0..n_ids)
            .flat_map(|k| (0..n_times).map(move |t| (k, t)))
            .map(|(k, t)| table.values[[v, t, k]])
            .collect();
        let mut var = file.add_variable::<f64>(name, &["catchment-id", "time"])?;
        var.put_values(&values, ..)?;
    }
    info!(path = %path.display(), catchments = n_ids, steps = n_times, "Wrote NetCDF forcing");
    Ok(())
}

#[cfg(not(feature = "netcdf"))]
pub fn write_netcdf(_table: &ForcingTable, path: &Path) -> Result<()> {
    anyhow::bail!(
        "cannot write {}: forcing_prep was built without the `netcdf` feature",
        path.display()
    )
}

/// Outcome of processing one basin, appended to the run summary CSV.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunRecord {
    pub timestamp: String,
    pub product: String,
    pub basin: String,
    pub period: String,
    pub catchments: usize,
    pub time_steps: usize,
    pub elapsed_secs: f64,
    pub status: String,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn finished(product: &str, basin: &str, period: &str, table: &ForcingTable, elapsed_secs: f64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            product: product.to_string(),
            basin: basin.to_string(),
            period: period.to_string(),
            catchments: table.divide_ids.len(),
            time_steps: table.times.len(),
            elapsed_secs,
            status: "finished".to_string(),
            error: None,
        }
    }

    pub fn failed(product: &str, basin: &str, period: &str, error: &anyhow::Error, elapsed_secs: f64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            product: product.to_string(),
            basin: basin.to_string(),
            period: period.to_string(),
            catchments: 0,
            time_steps: 0,
            elapsed_secs,
            status: "failed".to_string(),
            error: Some(format!("{error:#}")),
        }
    }
}

/// Appends a record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ndarray::Array3;
    use std::fs;

    fn table() -> ForcingTable {
        let t0 = Utc.with_ymd_and_hms(2000, 10, 1, 0, 0, 0).unwrap();
        // [var, time, divide]
        let values = Array3::from_shape_vec(
            (2, 2, 2),
            vec![1.0, 3.0, 2.0, f64::NAN, 280.5, 281.5, 282.0, 283.0],
        )
        .unwrap();
        ForcingTable::new(
            vec!["APCP_surface".into(), "TMP_2maboveground".into()],
            vec![t0, t0 + Duration::hours(1)],
            vec!["cat-1".into(), "cat-2".into()],
            values,
        )
        .unwrap()
    }

    #[test]
    fn test_write_catchment_csvs() {
        let dir = tempfile::tempdir().unwrap();
        let n = write_catchment_csvs(&table(), dir.path(), "_01022500_2000_to_2001").unwrap();
        assert_eq!(n, 2);

        let content = fs::read_to_string(dir.path().join("cat-2_01022500_2000_to_2001.csv")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "time,APCP_surface,TMP_2maboveground");
        assert_eq!(lines[1], "2000-10-01 00:00:00,3,281.5");
        assert_eq!(lines[2], "2000-10-01 01:00:00,,283");
    }

    #[test]
    fn test_write_basin_csv_skips_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agg.csv");
        write_basin_csv(&table(), &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2000-10-01 00:00:00,2,281");
        assert_eq!(lines[2], "2000-10-01 01:00:00,2,282.5");
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_summary.csv");

        let record = RunRecord::finished("aorc", "01022500", "2000_to_2001", &table(), 1.5);
        append_record(&path, &record).unwrap();
        append_record(&path, &record).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_failed_record_carries_error() {
        let err = anyhow::anyhow!("zarr open failed");
        let record = RunRecord::failed("hrrr", "01022500", "20200101", &err, 0.0);
        assert_eq!(record.status, "failed");
        assert_eq!(record.error.as_deref(), Some("zarr open failed"));
    }

    #[cfg(feature = "netcdf")]
    #[test]
    fn test_write_netcdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basin.nc");
        write_netcdf(&table(), &path).unwrap();
        let file = netcdf::open(&path).unwrap();
        assert_eq!(file.dimension("catchment-id").unwrap().len(), 2);
        assert_eq!(file.dimension("time").unwrap().len(), 2);
        let tmp: Vec<f64> = file.variable("TMP_2maboveground").unwrap().get_values(..).unwrap();
        // catchment-major
        assert_eq!(tmp, vec![280.5, 282.0, 281.5, 283.0]);
    }
}
