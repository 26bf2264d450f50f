//! Post-processing of generated forcing: rounding of AORC basin means with a
//! per-water-year split, and compilation of daily HRRR basin means into one
//! series per basin.

use anyhow::{Context, Result, anyhow, bail};
use chrono::Datelike;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::time::parse_csv_time;

/// Decimal places per variable.
pub type RoundingSpecs = BTreeMap<String, u32>;

pub fn default_specs() -> RoundingSpecs {
    [
        ("APCP_surface", 5),
        ("DLWRF_surface", 4),
        ("DSWRF_surface", 4),
        ("PRES_surface", 3),
        ("SPFH_2maboveground", 7),
        ("TMP_2maboveground", 4),
        ("UGRD_10maboveground", 4),
        ("VGRD_10maboveground", 4),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Reads a YAML map of `variable: decimal places`.
pub fn load_specs(path: &Path) -> Result<RoundingSpecs> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rounding specs {}", path.display()))?;
    serde_yaml::from_str(&text).context("parsing rounding specs")
}

/// October through September; the water year is named after the year it ends in.
pub fn water_year(year: i32, month: u32) -> i32 {
    if month < 10 { year } else { year + 1 }
}

struct CsvTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>, _>>()
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self { headers, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    fn write<'a>(&self, path: &Path, rows: impl Iterator<Item = &'a Vec<String>>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(&self.headers)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn round_field(value: &str, places: u32) -> String {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => {
            let factor = 10f64.powi(places as i32);
            ((v * factor).round() / factor).to_string()
        }
        _ => value.to_string(),
    }
}

/// Basin ids that have a `{id}_{start}_to_{end}_agg.csv` in `dir` or in one
/// of its immediate subdirectories.
pub fn find_basin_ids(dir: &Path, year_start: i32, year_end: i32) -> Result<Vec<String>> {
    let suffix = format!("_{year_start}_to_{year_end}_agg.csv");
    let mut ids = BTreeSet::new();
    let mut scan = |d: &Path| -> Result<()> {
        for entry in std::fs::read_dir(d).with_context(|| format!("reading {}", d.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(&suffix) {
                if let Some(id) = name.split('_').next().filter(|id| !id.is_empty()) {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(())
    };
    scan(dir)?;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.file_name().is_some_and(|n| n != "post_processed") {
            scan(&path)?;
        }
    }
    Ok(ids.into_iter().collect())
}

fn agg_input(dir: &Path, basin: &str, year_str: &str) -> Option<PathBuf> {
    let name = format!("{basin}_{year_str}_agg.csv");
    [dir.join(&name), dir.join(format!("camels_{basin}_{year_str}")).join(&name)]
        .into_iter()
        .find(|p| p.exists())
}

/// Rounds one basin's mean series and splits it by water year.
///
/// Writes `{dir}/post_processed/{basin}_{years}_agg_rounded.csv` and one
/// `..._agg_rounded_WR{wy}.csv` per water year. Returns `false` when the
/// basin has no mean series.
#[tracing::instrument(skip(dir, specs))]
pub fn round_basin(
    dir: &Path,
    basin: &str,
    year_start: i32,
    year_end: i32,
    specs: &RoundingSpecs,
) -> Result<bool> {
    let year_str = format!("{year_start}_to_{year_end}");
    let Some(input) = agg_input(dir, basin, &year_str) else {
        warn!(basin, "No basin mean series found, skipping");
        return Ok(false);
    };
    let out_dir = dir.join("post_processed");
    std::fs::create_dir_all(&out_dir)?;

    let mut table = CsvTable::read(&input)?;
    let rounded: Vec<(usize, u32)> = specs
        .iter()
        .filter_map(|(var, places)| table.column(var).map(|c| (c, *places)))
        .collect();
    for row in &mut table.rows {
        for &(c, places) in &rounded {
            if let Some(field) = row.get_mut(c) {
                *field = round_field(field, places);
            }
        }
    }

    let stem = format!("{basin}_{year_str}_agg_rounded");
    table.write(&out_dir.join(format!("{stem}.csv")), table.rows.iter())?;

    let time_col = table
        .column("time")
        .ok_or_else(|| anyhow!("{} has no time column", input.display()))?;
    let mut by_year: BTreeMap<i32, Vec<&Vec<String>>> = BTreeMap::new();
    for row in &table.rows {
        let t = parse_csv_time(&row[time_col])?;
        by_year
            .entry(water_year(t.year(), t.month()))
            .or_default()
            .push(row);
    }
    for (wy, rows) in &by_year {
        table.write(&out_dir.join(format!("{stem}_WR{wy}.csv")), rows.iter().copied())?;
    }
    debug!(basin, water_years = by_year.len(), "Basin rounded");
    Ok(true)
}

/// Rounds every basin found in `dir`, in parallel. Returns the number of
/// basins written.
#[tracing::instrument(skip(specs))]
pub fn post_process(dir: &Path, year_start: i32, year_end: i32, specs: &RoundingSpecs) -> Result<usize> {
    let basins = find_basin_ids(dir, year_start, year_end)?;
    info!(basins = basins.len(), "Post-processing basin means");
    let written = basins
        .par_iter()
        .map(|b| round_basin(dir, b, year_start, year_end, specs))
        .collect::<Result<Vec<bool>>>()?;
    Ok(written.into_iter().filter(|w| *w).count())
}

fn files_under(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            files_under(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Concatenates the daily HRRR basin means under `out_dir` into
/// `{dir_write}/HRRR_ts_gage_{basin}.csv`, one file per basin with cached
/// coverage weights, sorted by time.
///
/// Days missing a variable leave that column empty.
#[tracing::instrument]
pub fn compile_hrrr(out_dir: &Path, dir_write: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    files_under(out_dir, &mut files)?;
    files.sort();

    let basins: BTreeSet<String> = files
        .iter()
        .filter_map(|f| f.file_name()?.to_str()?.strip_suffix("_coverage.parquet").map(str::to_string))
        .collect();
    std::fs::create_dir_all(dir_write)?;

    let mut written = Vec::new();
    for basin in &basins {
        let agg_name = format!("camels_{basin}_agg.csv");
        let daily: Vec<&PathBuf> = files
            .iter()
            .filter(|f| f.file_name().is_some_and(|n| n == agg_name.as_str()))
            .collect();
        if daily.is_empty() {
            warn!(basin, "No daily means to compile");
            continue;
        }

        let mut headers: Vec<String> = Vec::new();
        let mut rows: Vec<(chrono::DateTime<chrono::Utc>, BTreeMap<String, String>)> = Vec::new();
        for path in daily {
            let table = CsvTable::read(path)?;
            let time_col = table
                .column("time")
                .ok_or_else(|| anyhow!("{} has no time column", path.display()))?;
            for h in &table.headers {
                if !headers.contains(h) {
                    headers.push(h.clone());
                }
            }
            for row in table.rows {
                let time = parse_csv_time(&row[time_col])?;
                let fields = table.headers.iter().cloned().zip(row).collect();
                rows.push((time, fields));
            }
        }
        rows.sort_by_key(|(time, _)| *time);
        if headers.first().map(String::as_str) != Some("time") {
            bail!("daily means for {basin} do not start with a time column");
        }

        let path = dir_write.join(format!("HRRR_ts_gage_{basin}.csv"));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(&headers)?;
        for (_, fields) in &rows {
            writer.write_record(headers.iter().map(|h| fields.get(h).map(String::as_str).unwrap_or("")))?;
        }
        writer.flush()?;
        info!(basin, steps = rows.len(), path = %path.display(), "Compiled HRRR series");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_water_year() {
        assert_eq!(water_year(2000, 9), 2000);
        assert_eq!(water_year(2000, 10), 2001);
        assert_eq!(water_year(2000, 12), 2001);
        assert_eq!(water_year(2001, 1), 2001);
    }

    #[test]
    fn test_round_field() {
        assert_eq!(round_field("280.123456", 4), "280.1235");
        assert_eq!(round_field("0.00012345678", 7), "0.0001235");
        assert_eq!(round_field("", 3), "");
        assert_eq!(round_field("2", 3), "2");
    }

    fn write_agg(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            path,
            "time,APCP_surface,TMP_2maboveground,other\n\
             2000-09-30 23:00:00,0.1234567,280.123456,1.23456789\n\
             2000-10-01 00:00:00,0.5,281.98765,2\n\
             2001-09-30 23:00:00,,282,3\n\
             2001-10-01 00:00:00,1,283,4\n",
        )
        .unwrap();
    }

    #[test]
    fn test_round_basin_splits_water_years() {
        let dir = tempfile::tempdir().unwrap();
        write_agg(&dir.path().join("camels_01022500_2000_to_2002/01022500_2000_to_2002_agg.csv"));

        assert_eq!(find_basin_ids(dir.path(), 2000, 2002).unwrap(), vec!["01022500"]);
        let written = post_process(dir.path(), 2000, 2002, &default_specs()).unwrap();
        assert_eq!(written, 1);

        let out = dir.path().join("post_processed");
        let all = fs::read_to_string(out.join("01022500_2000_to_2002_agg_rounded.csv")).unwrap();
        let lines: Vec<_> = all.lines().collect();
        assert_eq!(lines[1], "2000-09-30 23:00:00,0.12346,280.1235,1.23456789");
        assert_eq!(lines[3], "2001-09-30 23:00:00,,282,3");

        for (wy, rows) in [(2000, 1), (2001, 2), (2002, 1)] {
            let text = fs::read_to_string(out.join(format!("01022500_2000_to_2002_agg_rounded_WR{wy}.csv")))
                .unwrap();
            assert_eq!(text.lines().count(), rows + 1, "water year {wy}");
        }
    }

    #[test]
    fn test_missing_basin_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!round_basin(dir.path(), "0000", 2000, 2001, &default_specs()).unwrap());
    }

    #[test]
    fn test_load_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.yaml");
        fs::write(&path, "TMP: 2\nAPCP_1hr_acc_fcst: 5\n").unwrap();
        let specs = load_specs(&path).unwrap();
        assert_eq!(specs.get("TMP"), Some(&2));
    }

    #[test]
    fn test_compile_hrrr() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hrrr");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("1022500_coverage.parquet"), b"").unwrap();

        let day2 = out.join("camels_1022500_20180814");
        fs::create_dir_all(&day2).unwrap();
        fs::write(day2.join("camels_1022500_agg.csv"), "time,TMP\n2018-08-14 00:00:00,290\n").unwrap();
        let day1 = out.join("camels_1022500_20180813");
        fs::create_dir_all(&day1).unwrap();
        fs::write(
            day1.join("camels_1022500_agg.csv"),
            "time,TMP,APCP_1hr_acc_fcst\n2018-08-13 01:00:00,289,0.5\n2018-08-13 00:00:00,288,0\n",
        )
        .unwrap();
        fs::write(day1.join("cat-1.csv"), "time,TMP\n").unwrap();

        let write_dir = dir.path().join("compiled");
        let written = compile_hrrr(&out, &write_dir).unwrap();
        assert_eq!(written.len(), 1);

        let text = fs::read_to_string(write_dir.join("HRRR_ts_gage_1022500.csv")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "time,TMP,APCP_1hr_acc_fcst");
        assert_eq!(lines[1], "2018-08-13 00:00:00,288,0");
        assert_eq!(lines[3], "2018-08-14 00:00:00,290,");
    }

    #[test]
    fn test_compile_hrrr_keeps_basins_apart() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hrrr");
        for (basin, tmp) in [("1022500", "288"), ("11022500", "300")] {
            let day = out.join(format!("camels_{basin}_20180813"));
            fs::create_dir_all(&day).unwrap();
            fs::write(out.join(format!("{basin}_coverage.parquet")), b"").unwrap();
            fs::write(
                day.join(format!("camels_{basin}_agg.csv")),
                format!("time,TMP\n2018-08-13 00:00:00,{tmp}\n"),
            )
            .unwrap();
        }

        let write_dir = dir.path().join("compiled");
        assert_eq!(compile_hrrr(&out, &write_dir).unwrap().len(), 2);

        let text = fs::read_to_string(write_dir.join("HRRR_ts_gage_1022500.csv")).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["time,TMP", "2018-08-13 00:00:00,288"]);
        let text = fs::read_to_string(write_dir.join("HRRR_ts_gage_11022500.csv")).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["time,TMP", "2018-08-13 00:00:00,300"]);
    }
}
