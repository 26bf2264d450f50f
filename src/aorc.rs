//! AORC forcing generation for hydrofabric basins.
//!
//! One zarr store per year is opened and stacked along time. Each basin's
//! catchments are weighted against the AORC grid and written as per-catchment
//! CSVs (or NetCDF) plus a basin mean. Completed basins are recorded in the
//! processing log so an interrupted run resumes where it stopped.

use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::aggregate::AggregateOptions;
use crate::catchments::CatchmentSet;
use crate::config::{AorcConfig, UploadConfig};
use crate::fetch::retry::with_retry_blocking;
use crate::fetch::s3::{S3Location, anonymous_client, list_keys, upload_dir};
use crate::output::{RunRecord, append_record, write_basin_csv, write_catchment_csvs, write_netcdf};
use crate::pipeline::{CatchmentOptions, ForcingTable, fetch_catchments, process_geo_data};
use crate::process_log::ProcessLog;
use crate::projection::Crs;
use crate::zarr::{DatasetDims, RasterSource, StackedDataset, ZarrDataset, ZarrStore};

/// Basin ids of the `Gage_{id}.*` objects next to the template's location.
#[tracing::instrument]
pub async fn list_basins(basin_url_template: &str, region: &str) -> Result<Vec<String>> {
    if !basin_url_template.starts_with("s3://") {
        bail!("listing all basins requires an s3:// basin_url_template, got {basin_url_template}");
    }
    let location = S3Location::parse(basin_url_template)?;
    let client = anonymous_client(region).await;
    let keys = list_keys(&client, &location.bucket, &location.parent_prefix()).await?;
    let basins = basin_ids_from_keys(&keys);
    info!(count = basins.len(), "Listed hydrofabric basins");
    Ok(basins)
}

fn basin_ids_from_keys(keys: &[String]) -> Vec<String> {
    let ids: BTreeSet<String> = keys
        .iter()
        .filter(|k| k.contains("/Gage_"))
        .filter_map(|k| {
            let name = Path::new(k).file_name()?.to_str()?;
            let stem = name.split('.').next()?;
            stem.split('_').nth(1).map(str::to_string)
        })
        .collect();
    ids.into_iter().collect()
}

/// Opens every year of the configured range and stacks them along time.
#[tracing::instrument(skip(config), fields(years = %config.year_str()))]
pub async fn open_forcing(config: &AorcConfig) -> Result<Arc<dyn RasterSource>> {
    let urls: Vec<String> = config.year_range().map(|y| config.year_url(y)).collect();
    let variables = config.variables.clone();
    let dims = DatasetDims::new(&config.time_dim, &config.y_lat_dim, &config.x_lon_dim);
    let region = crate::fetch::s3::resolve_region(&config.s3_region);
    let retry = config.retry;

    // Zarr metadata reads block on the runtime handle.
    let stacked = tokio::task::spawn_blocking(move || -> Result<StackedDataset> {
        let mut parts: Vec<Box<dyn RasterSource>> = Vec::with_capacity(urls.len());
        for url in &urls {
            let dataset = with_retry_blocking(url, retry, || {
                let store = ZarrStore::open(url, &region)?;
                ZarrDataset::open(&store, &variables, &dims)
            })?;
            info!(
                url = dataset.location(),
                steps = dataset.grid().times.len(),
                "Opened AORC year"
            );
            parts.push(Box::new(dataset));
        }
        StackedDataset::new(parts)
    })
    .await??;

    let grid = stacked.grid();
    info!(
        variables = ?grid.variables,
        steps = grid.times.len(),
        ny = grid.ny(),
        nx = grid.nx(),
        "AORC forcing ready"
    );
    Ok(Arc::new(stacked))
}

/// Output locations of one basin for a year range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasinOutputs {
    /// `{run_dir}/camels_{name}_{year_str}`
    pub dir: PathBuf,
    /// `{name}_{year_str}`
    pub uniq_name: String,
}

impl BasinOutputs {
    pub fn new(run_dir: &Path, name: &str, year_str: &str) -> Self {
        let uniq_name = format!("{name}_{year_str}");
        Self {
            dir: run_dir.join(format!("camels_{uniq_name}")),
            uniq_name,
        }
    }

    pub fn agg_csv(&self) -> PathBuf {
        self.dir.join(format!("{}_agg.csv", self.uniq_name))
    }

    pub fn netcdf(&self) -> PathBuf {
        self.dir.join(format!("{}.nc", self.uniq_name))
    }

    /// Writes the basin's outputs: per-catchment CSVs or a NetCDF file, and
    /// the basin mean CSV in either case.
    pub fn write(&self, table: &ForcingTable, netcdf: bool) -> Result<()> {
        if netcdf {
            write_netcdf(table, &self.netcdf())?;
        } else {
            write_catchment_csvs(table, &self.dir, &format!("_{}", self.uniq_name))?;
        }
        write_basin_csv(table, &self.agg_csv())
    }
}

/// Shared state of one AORC run.
struct AorcRun<'a> {
    config: &'a AorcConfig,
    source: Arc<dyn RasterSource>,
    run_dir: PathBuf,
    options: AggregateOptions,
    catchments: CatchmentOptions,
    uploader: Option<(aws_sdk_s3::Client, UploadConfig)>,
}

impl AorcRun<'_> {
    async fn generate(&self, catchments: CatchmentSet, name: &str) -> Result<ForcingTable> {
        let source = self.source.clone();
        let run_dir = self.run_dir.clone();
        let redo = self.config.redo;
        let options = self.options;
        let cache_name = name.to_string();
        let table = tokio::task::spawn_blocking(move || {
            process_geo_data(&catchments, source.as_ref(), &cache_name, &run_dir, redo, &options)
        })
        .await??;

        let outputs = BasinOutputs::new(&self.run_dir, name, &self.config.year_str());
        outputs.write(&table, self.config.netcdf)?;
        info!(dir = %outputs.dir.display(), "Basin outputs written");

        if let Some((client, upload)) = &self.uploader {
            upload_dir(client, &upload.bucket, &upload.prefix, &outputs.dir, upload.gzip).await?;
        }
        Ok(table)
    }

    async fn process_basin(&self, basin: &str) -> Result<ForcingTable> {
        let url = self.config.basin_url(basin);
        let catchments =
            fetch_catchments(&url, &self.run_dir.join("hydrofabric"), &self.catchments).await?;
        self.generate(catchments, basin).await
    }

    fn record(&self, basin: &str, result: &Result<ForcingTable>, started: Instant) -> Result<()> {
        let elapsed = started.elapsed().as_secs_f64();
        let period = self.config.year_str();
        let record = match result {
            Ok(table) => RunRecord::finished("aorc", basin, &period, table, elapsed),
            Err(e) => RunRecord::failed("aorc", basin, &period, e, elapsed),
        };
        append_record(&Path::new(&self.config.out_dir).join("run_summary.csv"), &record)
    }
}

/// Runs AORC generation for every configured basin.
#[tracing::instrument(skip(config), fields(years = %config.year_str()))]
pub async fn run(config: &AorcConfig) -> Result<()> {
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    info!(dir = %run_dir.display(), "Writing AORC outputs");

    let region = crate::fetch::s3::resolve_region(&config.s3_region);
    let raster_crs = Crs::parse(&config.raster_crs)?;
    let fallback_crs = config.catchment_crs.as_deref().map(Crs::parse).transpose()?;

    let uploader = match &config.upload {
        Some(upload) => {
            let aws = aws_config::load_from_env().await;
            info!(bucket = %upload.bucket, gzip = upload.gzip, "S3 upload enabled");
            Some((aws_sdk_s3::Client::new(&aws), upload.clone()))
        }
        None => None,
    };

    let source = open_forcing(config).await?;
    let aorc = AorcRun {
        config,
        source,
        run_dir: run_dir.clone(),
        options: AggregateOptions {
            chunks: config.chunks(),
            threads: config.threads,
            retry: config.retry,
        },
        catchments: CatchmentOptions {
            layer: config.layer.clone(),
            id_col: config.id_col.clone(),
            fallback_crs,
            raster_crs,
            region: region.clone(),
            retry: config.retry,
        },
        uploader,
    };

    if let Some(gpkg) = &config.gpkg {
        let name = gpkg.name();
        let started = Instant::now();
        let options = CatchmentOptions {
            layer: gpkg.layer(),
            id_col: gpkg.id_col.clone(),
            ..aorc.catchments.clone()
        };
        let result = match fetch_catchments(&gpkg.path, &run_dir.join("hydrofabric"), &options).await {
            Ok(catchments) => aorc.generate(catchments, &name).await,
            Err(e) => Err(e),
        };
        aorc.record(&name, &result, started)?;
        result?;
        return Ok(());
    }

    let basins = if config.wants_all_basins() {
        list_basins(&config.basin_url_template, &region).await?
    } else {
        config.basin_ids()
    };

    let log = ProcessLog::open(&run_dir)?;
    let (mut finished, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    for basin in &basins {
        if log.finished()?.contains(basin) {
            info!(basin, "Basin already processed, skipping");
            skipped += 1;
            continue;
        }
        log.mark_processing(basin)?;

        let started = Instant::now();
        let result = aorc.process_basin(basin).await;
        aorc.record(basin, &result, started)?;
        match result {
            Ok(table) => {
                log.mark_finished(basin)?;
                finished += 1;
                info!(
                    basin,
                    catchments = table.divide_ids.len(),
                    elapsed_secs = started.elapsed().as_secs(),
                    "Basin finished"
                );
            }
            Err(e) => {
                failed += 1;
                error!(basin, error = %format!("{e:#}"), "Basin failed");
            }
        }
    }

    if failed > 0 {
        warn!(failed, "Some basins failed; rerun to retry them");
    }
    info!(finished, failed, skipped, total = basins.len(), "AORC run complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basin_ids_from_keys() {
        let keys = vec![
            "hydrofabric/v20.1/camels/Gage_1022500.gpkg".to_string(),
            "hydrofabric/v20.1/camels/Gage_1031500.gpkg".to_string(),
            "hydrofabric/v20.1/camels/Gage_1022500.gpkg.bak".to_string(),
            "hydrofabric/v20.1/camels/README.md".to_string(),
        ];
        assert_eq!(basin_ids_from_keys(&keys), vec!["1022500", "1031500"]);
    }

    #[test]
    fn test_basin_outputs_layout() {
        let outputs = BasinOutputs::new(Path::new("/data/1980_to_2024"), "1022500", "1980_to_2024");
        assert_eq!(
            outputs.dir,
            PathBuf::from("/data/1980_to_2024/camels_1022500_1980_to_2024")
        );
        assert_eq!(
            outputs.agg_csv(),
            PathBuf::from("/data/1980_to_2024/camels_1022500_1980_to_2024/1022500_1980_to_2024_agg.csv")
        );
        assert!(outputs.netcdf().ends_with("1022500_1980_to_2024.nc"));
    }

    #[tokio::test]
    async fn test_list_basins_needs_s3_template() {
        assert!(list_basins("/data/Gage_{basin_id}.gpkg", "us-east-1").await.is_err());
    }
}
