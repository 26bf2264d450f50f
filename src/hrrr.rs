//! HRRR forcing generation from the `hrrrzarr` archive.
//!
//! The archive holds one zarr store per model run,
//! `{bucket_subf}/YYYYMMDD/YYYYMMDD_HHz_{anl|fcst}.zarr`, and inside each run
//! one group per variable: `{level}/{var}` holds the metadata (`time`, ...)
//! and `{level}/{var}/{level}` the data and projection coordinates.
//!
//! A day is assembled from the 24 analysis runs of the day plus the forecast
//! runs whose `fcst_hr` one-hour accumulation is valid during the day. Every
//! (variable, hour) slice is read on its own so a broken run only costs that
//! hour.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ndarray::{Array2, Array4, s};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregate::AggregateOptions;
use crate::catchments::{Bounds, CatchmentSet};
use crate::config::{HrrrConfig, RetryConfig};
use crate::fetch::retry::{with_retry, with_retry_blocking};
use crate::fetch::s3::{S3Location, anonymous_client, list_prefixes, resolve_region};
use crate::grid::{Axis, GridWindow, RasterGrid};
use crate::output::{RunRecord, append_record, write_basin_csv, write_catchment_csvs};
use crate::pipeline::{CatchmentOptions, ForcingTable, fetch_catchments, process_geo_data};
use crate::projection::Crs;
use crate::weights::cache::{coverage_path, discard_coverage};
use crate::zarr::{DatasetDims, MemoryDataset, ZarrStore, ZarrVariable, read_cf_times, read_coordinate};

const DATE_FORMAT: &str = "%Y%m%d";

/// Every date from `begin` to `end`, both inclusive.
pub fn prep_date_range(begin: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    begin.iter_days().take_while(|d| *d <= end).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunKind {
    Anl,
    Fcst,
}

/// One model run store, e.g. `20200801/20200801_22z_anl.zarr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrrrRun {
    pub init: DateTime<Utc>,
    pub kind: RunKind,
    /// Path relative to the archive root.
    pub path: String,
}

impl HrrrRun {
    /// Parses a listing entry ending in `YYYYMMDD/YYYYMMDD_HHz_{anl|fcst}.zarr`.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut segments = entry.trim_end_matches('/').rsplit('/');
        let name = segments.next()?;
        let day = segments.next()?;

        let stem = name.strip_suffix(".zarr")?;
        let (prefix, kind) = if let Some(p) = stem.strip_suffix("_anl") {
            (p, RunKind::Anl)
        } else if let Some(p) = stem.strip_suffix("_fcst") {
            (p, RunKind::Fcst)
        } else {
            return None;
        };
        let (date, hour) = prefix.split_once('_')?;
        let hour: u32 = hour.strip_suffix('z')?.parse().ok()?;
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;
        let init = date.and_hms_opt(hour, 0, 0)?.and_utc();
        Some(Self {
            init,
            kind,
            path: format!("{day}/{name}"),
        })
    }

    /// Valid time of the slice taken from this run: the analysis time, or the
    /// end of the one-hour accumulation window of forecast hour `fcst_hr`.
    pub fn valid_time(&self, fcst_hr: u32) -> DateTime<Utc> {
        match self.kind {
            RunKind::Anl => self.init,
            RunKind::Fcst => self.init + Duration::hours(i64::from(fcst_hr) + 1),
        }
    }
}

/// One variable of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrrrSlice {
    pub variable: String,
    pub run: HrrrRun,
    /// `{run}/{level}/{var}/{level}`: the data array and x/y coordinates.
    pub data_path: String,
    /// `{run}/{level}/{var}`: metadata such as `time`.
    pub group_path: String,
}

/// Splits `level/var` into its parts.
fn split_level_var(level_var: &str) -> Result<(&str, &str)> {
    match level_var.split_once('/') {
        Some((level, var)) if !level.is_empty() && !var.is_empty() => Ok((level, var)),
        _ => bail!("'{level_var}' is not of the form level/variable"),
    }
}

/// Slices for every `level/var` in every run, grouped by variable.
pub fn build_zarr_urls(runs: &[HrrrRun], level_vars: &[String]) -> Result<Vec<Vec<HrrrSlice>>> {
    level_vars
        .iter()
        .map(|level_var| {
            let (level, var) = split_level_var(level_var)?;
            Ok(runs
                .iter()
                .map(|run| HrrrSlice {
                    variable: var.to_string(),
                    run: run.clone(),
                    data_path: format!("{}/{level}/{var}/{level}", run.path),
                    group_path: format!("{}/{level}/{var}", run.path),
                })
                .collect())
        })
        .collect()
}

/// Forecast runs whose hour-`fcst_hr` accumulation ends at each hour of
/// `date` (00z through 23z), drawn from `available` (this and the previous
/// day's listings). Hours without a matching run are left out.
pub fn fcst_runs_for_date(date: NaiveDate, fcst_hr: u32, available: &[HrrrRun]) -> Result<Vec<HrrrRun>> {
    if fcst_hr > 23 {
        bail!("forecast subsetting supports forecast hours 0 to 23, got {fcst_hr}");
    }
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date {date}"))?
        .and_utc();
    let lead = Duration::hours(i64::from(fcst_hr) + 1);

    let mut runs = Vec::with_capacity(24);
    for hour in 0..24 {
        let init = midnight + Duration::hours(hour) - lead;
        match available
            .iter()
            .find(|r| r.kind == RunKind::Fcst && r.init == init)
        {
            Some(run) => runs.push(run.clone()),
            None => debug!(%init, "No forecast run for hour"),
        }
    }
    Ok(runs)
}

/// Lists the runs of a day, from S3 or from a local mirror of the archive.
pub struct RunLister {
    root: String,
    client: Option<aws_sdk_s3::Client>,
    retry: RetryConfig,
}

impl RunLister {
    pub async fn new(root: &str, region: &str, retry: RetryConfig) -> Self {
        let client = if root.starts_with("s3://") {
            Some(anonymous_client(region).await)
        } else {
            None
        };
        Self {
            root: root.trim_end_matches('/').to_string(),
            client,
            retry,
        }
    }

    /// Runs stored under `{root}/YYYYMMDD/`, sorted by kind and time.
    pub async fn list(&self, date: NaiveDate) -> Result<Vec<HrrrRun>> {
        let day = date.format(DATE_FORMAT).to_string();
        let entries = match &self.client {
            Some(client) => {
                let location = S3Location::parse(&self.root)?;
                let prefix = if location.key.is_empty() {
                    format!("{day}/")
                } else {
                    format!("{}/{day}/", location.key.trim_end_matches('/'))
                };
                let what = format!("listing {}/{day}", self.root);
                with_retry(&what, self.retry, || {
                    list_prefixes(client, &location.bucket, &prefix)
                })
                .await?
            }
            None => {
                let dir = Path::new(&self.root).join(&day);
                if !dir.is_dir() {
                    return Ok(Vec::new());
                }
                let mut names = Vec::new();
                for entry in std::fs::read_dir(&dir)
                    .with_context(|| format!("reading {}", dir.display()))?
                {
                    names.push(format!("{day}/{}", entry?.file_name().to_string_lossy()));
                }
                names
            }
        };
        let mut runs: Vec<HrrrRun> = entries.iter().filter_map(|e| HrrrRun::parse(e)).collect();
        runs.sort_by(|a, b| (a.kind, a.init).cmp(&(b.kind, b.init)));
        Ok(runs)
    }
}

/// Reads single-hour slices of the archive.
pub struct SliceReader {
    store: ZarrStore,
    dims: DatasetDims,
    fcst_hr: u32,
    retry: RetryConfig,
}

impl SliceReader {
    pub fn new(store: ZarrStore, dims: DatasetDims, fcst_hr: u32, retry: RetryConfig) -> Self {
        Self {
            store,
            dims,
            fcst_hr,
            retry,
        }
    }

    /// Projection axes of the first slice that has them.
    fn axes(&self, slices: &[HrrrSlice]) -> Result<(Axis, Axis)> {
        let mut last_error = None;
        for slice in slices {
            let data = self.store.child(&slice.data_path);
            let read = || -> Result<(Axis, Axis)> {
                let x = Axis::new(read_coordinate(&data.array(&self.dims.x)?)?)?;
                let y = Axis::new(read_coordinate(&data.array(&self.dims.y)?)?)?;
                Ok((x, y))
            };
            match read() {
                Ok(axes) => return Ok(axes),
                Err(e) => {
                    debug!(path = %slice.data_path, error = %e, "No coordinates in slice");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow!("no slices"))
            .context("no readable projection coordinates for the day"))
    }

    /// Time of the slice and its values over `window`, decoded.
    fn read(&self, slice: &HrrrSlice, window: &GridWindow) -> Result<(DateTime<Utc>, Vec<f32>)> {
        let data = self.store.child(&slice.data_path);
        let group = self.store.child(&slice.group_path);
        let variable = ZarrVariable::open(&data, &slice.variable, &slice.variable)?;
        let time_array = group
            .array(&self.dims.time)
            .or_else(|_| data.array(&self.dims.time))?;
        let times = read_cf_times(&time_array)?;

        let hr = self.fcst_hr as usize;
        let (time, values) = match variable.shape().len() {
            2 => (times.first(), variable.read(None, window)?),
            3 => (times.get(hr), variable.read(Some(hr..hr + 1), window)?),
            n => bail!("'{}' has {n} dimensions", slice.variable),
        };
        let time = time.copied().ok_or_else(|| {
            anyhow!("'{}' in {} has no time entry {hr}", slice.variable, slice.run.path)
        })?;
        Ok((time, values))
    }

    /// Reads every slice over the window covering `bounds` and stacks them
    /// into one dataset. Returns `None` when nothing usable was read.
    ///
    /// Failed slices and slices whose time disagrees with their run are
    /// skipped; of two slices with the same time the later one wins.
    #[tracing::instrument(skip_all, fields(slices = slices.len()))]
    pub fn assemble_day(
        &self,
        slices: &[HrrrSlice],
        bounds: Bounds,
        pool: &rayon::ThreadPool,
    ) -> Result<Option<MemoryDataset>> {
        if slices.is_empty() {
            return Ok(None);
        }
        let (x, y) = with_retry_blocking("reading HRRR coordinates", self.retry, || {
            self.axes(slices)
        })?;
        let full = RasterGrid {
            x,
            y,
            times: Vec::new(),
            variables: Vec::new(),
        };
        let window = full.window_for_bounds(bounds)?;

        let reads: Vec<Option<(DateTime<Utc>, Vec<f32>)>> = pool.install(|| {
            slices
                .par_iter()
                .map(|slice| {
                    let what = format!("reading {} from {}", slice.variable, slice.run.path);
                    match with_retry_blocking(&what, self.retry, || self.read(slice, &window)) {
                        Ok((time, values)) => {
                            let expected = slice.run.valid_time(self.fcst_hr);
                            if time == expected {
                                Some((time, values))
                            } else {
                                warn!(
                                    variable = %slice.variable,
                                    run = %slice.run.path,
                                    %time,
                                    %expected,
                                    "Slice time disagrees with its run, dropping"
                                );
                                None
                            }
                        }
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "Skipping unreadable slice");
                            None
                        }
                    }
                })
                .collect()
        });

        let mut variables: Vec<String> = Vec::new();
        let mut series: Vec<BTreeMap<DateTime<Utc>, Vec<f32>>> = Vec::new();
        for (slice, read) in slices.iter().zip(reads) {
            let index = match variables.iter().position(|v| v == &slice.variable) {
                Some(i) => i,
                None => {
                    variables.push(slice.variable.clone());
                    series.push(BTreeMap::new());
                    variables.len() - 1
                }
            };
            if let Some((time, values)) = read {
                if series[index].insert(time, values).is_some() {
                    debug!(variable = %slice.variable, %time, "Duplicate timestamp, keeping the last");
                }
            }
        }

        let (mut kept_vars, mut kept_series) = (Vec::new(), Vec::new());
        for (name, data) in variables.into_iter().zip(series) {
            if data.is_empty() {
                warn!(variable = %name, "No data for variable on this day");
            } else {
                kept_vars.push(name);
                kept_series.push(data);
            }
        }
        if kept_vars.is_empty() {
            return Ok(None);
        }

        let mut times: Vec<DateTime<Utc>> = kept_series.iter().flat_map(|s| s.keys().copied()).collect();
        times.sort();
        times.dedup();

        let (ny, nx) = window.shape();
        let mut cube = Array4::<f32>::from_elem((kept_vars.len(), times.len(), ny, nx), f32::NAN);
        for (v, data) in kept_series.into_iter().enumerate() {
            for (time, values) in data {
                let t = times.binary_search(&time).map_err(|_| anyhow!("time {time} missing"))?;
                let plane = Array2::from_shape_vec((ny, nx), values)?;
                cube.slice_mut(s![v, t, .., ..]).assign(&plane);
            }
        }

        let grid = RasterGrid {
            x: full.x.slice(window.x.clone())?,
            y: full.y.slice(window.y.clone())?,
            times,
            variables: kept_vars,
        };
        Ok(Some(MemoryDataset::new(grid, cube)?))
    }
}

/// Output locations of one basin and day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayOutputs {
    pub dir: PathBuf,
    pub basin: String,
}

impl DayOutputs {
    pub fn new(out_dir: &Path, basin: &str, date: NaiveDate) -> Self {
        Self {
            dir: out_dir.join(format!("camels_{basin}_{}", date.format(DATE_FORMAT))),
            basin: basin.to_string(),
        }
    }

    pub fn agg_csv(&self) -> PathBuf {
        self.dir.join(format!("camels_{}_agg.csv", self.basin))
    }

    pub fn write(&self, table: &ForcingTable) -> Result<()> {
        write_catchment_csvs(table, &self.dir, "")?;
        write_basin_csv(table, &self.agg_csv())
    }
}

struct HrrrRunner<'a> {
    config: &'a HrrrConfig,
    out_dir: PathBuf,
    lister: RunLister,
    reader: Arc<SliceReader>,
    pool: Arc<rayon::ThreadPool>,
    options: AggregateOptions,
    catchments: CatchmentOptions,
}

impl HrrrRunner<'_> {
    /// Slices needed for `date`, after dropping `drop_vars`.
    async fn day_slices(&self, date: NaiveDate) -> Result<Vec<HrrrSlice>> {
        let today = self.lister.list(date).await?;
        let mut available = match date.pred_opt() {
            Some(previous) => self.lister.list(previous).await?,
            None => Vec::new(),
        };
        available.extend(today.iter().cloned());

        let anl: Vec<HrrrRun> = today
            .iter()
            .filter(|r| r.kind == RunKind::Anl)
            .cloned()
            .collect();
        let fcst = if self.config.level_vars_fcst.is_empty() {
            Vec::new()
        } else {
            fcst_runs_for_date(date, self.config.fcst_hr, &available)?
        };
        if anl.is_empty() {
            info!(%date, "No analysis runs available");
        }
        if fcst.is_empty() && !self.config.level_vars_fcst.is_empty() {
            info!(%date, "No forecast precipitation runs available");
        }

        let slices = build_zarr_urls(&anl, &self.config.level_vars_anl)?
            .into_iter()
            .chain(build_zarr_urls(&fcst, &self.config.level_vars_fcst)?)
            .flatten()
            .filter(|s| !self.config.drop_vars.contains(&s.variable))
            .collect();
        Ok(slices)
    }

    async fn process_day(
        &self,
        catchments: &Arc<CatchmentSet>,
        basin: &str,
        date: NaiveDate,
    ) -> Result<Option<ForcingTable>> {
        let slices = self.day_slices(date).await?;
        if slices.is_empty() {
            return Ok(None);
        }

        let reader = self.reader.clone();
        let pool = self.pool.clone();
        let catchments = catchments.clone();
        let out_dir = self.out_dir.clone();
        let options = self.options;
        let name = basin.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ForcingTable>> {
            let bounds = catchments.total_bounds()?;
            let Some(day) = reader.assemble_day(&slices, bounds, &pool)? else {
                return Ok(None);
            };
            process_geo_data(&catchments, &day, &name, &out_dir, false, &options).map(Some)
        })
        .await?
    }

    async fn process_basin(&self, basin: &str, dates: &[NaiveDate]) -> Result<()> {
        let url = self.config.basin_url(basin);
        let catchments = Arc::new(
            fetch_catchments(&url, &self.out_dir.join("hydrofabric"), &self.catchments).await?,
        );
        let summary = self.out_dir.join("run_summary.csv");

        // Dropping the cache up front rebuilds the weights on the first day
        // that reaches them and reuses them afterwards, whatever fails.
        if self.config.redo {
            discard_coverage(&coverage_path(&self.out_dir, basin))?;
        }
        for &date in dates {
            let outputs = DayOutputs::new(&self.out_dir, basin, date);
            if !self.config.redo && outputs.agg_csv().exists() {
                debug!(basin, %date, "Day already written, skipping");
                continue;
            }

            let started = Instant::now();
            let period = date.format(DATE_FORMAT).to_string();
            let result = self.process_day(&catchments, basin, date).await;
            let elapsed = started.elapsed().as_secs_f64();
            match result {
                Ok(Some(table)) => {
                    outputs.write(&table)?;
                    info!(basin, %date, steps = table.times.len(), "Day finished");
                    append_record(&summary, &RunRecord::finished("hrrr", basin, &period, &table, elapsed))?;
                }
                Ok(None) => info!(basin, %date, "No data exist for date, skipping"),
                Err(e) => {
                    warn!(basin, %date, error = %format!("{e:#}"), "Day failed, skipping");
                    append_record(&summary, &RunRecord::failed("hrrr", basin, &period, &e, elapsed))?;
                }
            }
        }
        Ok(())
    }
}

/// Runs HRRR generation for every configured basin and date.
#[tracing::instrument(skip(config), fields(begin = %config.time_bgn, end = %config.time_end))]
pub async fn run(config: &HrrrConfig) -> Result<()> {
    let out_dir = PathBuf::from(&config.out_dir);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let region = resolve_region(&config.s3_region);
    let store = ZarrStore::open(&config.bucket_subf, &region)?;
    let dims = DatasetDims::new("time", &config.y_lat_dim, &config.x_lon_dim);
    let fallback_crs = config.catchment_crs.as_deref().map(Crs::parse).transpose()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()?;

    let runner = HrrrRunner {
        config,
        out_dir,
        lister: RunLister::new(&config.bucket_subf, &region, config.retry).await,
        reader: Arc::new(SliceReader::new(store, dims, config.fcst_hr, config.retry)),
        pool: Arc::new(pool),
        options: AggregateOptions {
            chunks: config.chunks(),
            threads: config.threads,
            retry: config.retry,
        },
        catchments: CatchmentOptions {
            layer: config.layer.clone(),
            id_col: config.id_col.clone(),
            fallback_crs,
            raster_crs: Crs::parse(&config.raster_crs)?,
            region,
            retry: config.retry,
        },
    };

    let dates = prep_date_range(config.time_bgn, config.time_end);
    info!(dates = dates.len(), basins = config.basins.len(), "Starting HRRR run");
    for basin in config.basin_ids() {
        let started = Instant::now();
        match runner.process_basin(&basin, &dates).await {
            Ok(()) => info!(basin, elapsed_secs = started.elapsed().as_secs(), "Basin finished"),
            Err(e) => error!(basin, error = %format!("{e:#}"), "Basin failed"),
        }
    }
    Ok(())
}
