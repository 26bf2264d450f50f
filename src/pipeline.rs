//! Catchment forcing extraction: window slicing, coverage weights and the
//! weighted aggregation, producing a [`ForcingTable`].

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use std::path::Path;
use tracing::{info, warn};

use crate::aggregate::{AggregateOptions, aggregate_source};
use crate::catchments::{CatchmentSet, load_catchments};
use crate::config::RetryConfig;
use crate::fetch::resolve_input;
use crate::grid::GridWindow;
use crate::projection::Crs;
use crate::weights::cache::{coverage_path, load_or_compute, write_coverage};
use crate::weights::{CoverageTable, compute_coverage};
use crate::zarr::RasterSource;

/// Aggregated forcing: `values[variable][time][catchment]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcingTable {
    pub variables: Vec<String>,
    pub times: Vec<DateTime<Utc>>,
    pub divide_ids: Vec<String>,
    pub values: Array3<f64>,
}

impl ForcingTable {
    pub fn new(
        variables: Vec<String>,
        times: Vec<DateTime<Utc>>,
        divide_ids: Vec<String>,
        values: Array3<f64>,
    ) -> Result<Self> {
        let expected = (variables.len(), times.len(), divide_ids.len());
        if values.dim() != expected {
            bail!(
                "forcing values have shape {:?}, expected {:?}",
                values.dim(),
                expected
            );
        }
        Ok(Self {
            variables,
            times,
            divide_ids,
            values,
        })
    }

    /// `[variable, time]` series of catchment `k`.
    pub fn catchment_series(&self, k: usize) -> ArrayView2<'_, f64> {
        self.values.slice(s![.., .., k])
    }

    /// Mean over catchments for each variable and time, skipping NaN.
    /// A step where every catchment is NaN stays NaN.
    pub fn basin_mean(&self) -> Array2<f64> {
        self.values.map_axis(Axis(2), |lane| {
            let (sum, n) = lane
                .iter()
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            if n == 0 { f64::NAN } else { sum / n as f64 }
        })
    }
}

/// Where a basin's catchments live and how to read them.
#[derive(Debug, Clone)]
pub struct CatchmentOptions {
    pub layer: String,
    pub id_col: String,
    /// CRS assumed when the file declares none.
    pub fallback_crs: Option<Crs>,
    /// CRS of the raster; catchments are reprojected into it.
    pub raster_crs: Crs,
    pub region: String,
    pub retry: RetryConfig,
}

/// Downloads (if remote) and reads the catchments at `url`, reprojected to
/// the raster CRS.
#[tracing::instrument(skip(cache_dir, options))]
pub async fn fetch_catchments(
    url: &str,
    cache_dir: &Path,
    options: &CatchmentOptions,
) -> Result<CatchmentSet> {
    let path = resolve_input(url, cache_dir, &options.region, options.retry).await?;
    let catchments = load_catchments(
        &path,
        &options.layer,
        &options.id_col,
        options.fallback_crs.as_ref(),
    )?;
    info!(catchments = catchments.len(), crs = ?catchments.crs(), "Catchments loaded");
    Ok(catchments.to_crs(&options.raster_crs))
}

/// Extracts coverage-weighted catchment means from `source`.
///
/// `catchments` must already be in the raster's CRS. Coverage weights are
/// cached as `{out_dir}/{name}_coverage.parquet` and recomputed when `redo`
/// is set or the cache no longer matches the catchments or window.
#[tracing::instrument(skip(catchments, source, out_dir, options), fields(catchments = catchments.len()))]
pub fn process_geo_data(
    catchments: &CatchmentSet,
    source: &dyn RasterSource,
    name: &str,
    out_dir: &Path,
    redo: bool,
    options: &AggregateOptions,
) -> Result<ForcingTable> {
    let grid = source.grid();
    let bounds = catchments.total_bounds()?;
    let window = grid.window_for_bounds(bounds)?;
    info!(
        rows = window.y.len(),
        cols = window.x.len(),
        times = grid.times.len(),
        variables = grid.variables.len(),
        "Sliced raster to catchment domain"
    );

    let ids = catchments.sorted_ids();
    let path = coverage_path(out_dir, name);
    let compute = || compute_coverage(catchments, grid, &window);
    let mut table = load_or_compute(&path, redo, compute)?;
    if let Some(reason) = stale_reason(&table, &window, &ids) {
        warn!(path = %path.display(), reason, "Cached coverage is stale, recomputing");
        table = compute()?;
        write_coverage(&path, &table)?;
    }

    let values = aggregate_source(source, &table, &window, &ids, options)?;
    ForcingTable::new(grid.variables.clone(), grid.times.clone(), ids, values)
}

/// Why a cached table can no longer be used with `window` and `ids`.
fn stale_reason(table: &CoverageTable, window: &GridWindow, ids: &[String]) -> Option<&'static str> {
    if !table.fits(window) {
        Some("cell indices fall outside the raster window")
    } else if table.ids() != ids {
        Some("catchment identifiers differ from the cache")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchments::Catchment;
    use crate::catchments::test_support::rect;
    use crate::grid::{Axis as GridAxis, RasterGrid};
    use crate::projection::Crs;
    use crate::weights::cache::read_coverage;
    use crate::zarr::MemoryDataset;
    use chrono::{Duration, TimeZone};
    use ndarray::Array4;

    fn dataset() -> MemoryDataset {
        let t0 = Utc.with_ymd_and_hms(2010, 6, 1, 0, 0, 0).unwrap();
        let grid = RasterGrid {
            x: GridAxis::new((0..6).map(|i| i as f64 + 0.5).collect()).unwrap(),
            y: GridAxis::new((0..4).rev().map(|i| i as f64 + 0.5).collect()).unwrap(),
            times: (0..3).map(|h| t0 + Duration::hours(h)).collect(),
            variables: vec!["APCP_surface".into(), "TMP_2maboveground".into()],
        };
        // APCP = x center, TMP = 280 + t
        let data = Array4::from_shape_fn((2, 3, 4, 6), |(v, t, _, x)| {
            if v == 0 { x as f32 + 0.5 } else { 280.0 + t as f32 }
        });
        MemoryDataset::new(grid, data).unwrap()
    }

    fn catchments() -> CatchmentSet {
        CatchmentSet::new(
            Crs::Geographic,
            vec![
                Catchment::new("cat-2", rect(3.0, 1.0, 5.0, 2.0)),
                Catchment::new("cat-1", rect(1.0, 1.0, 2.0, 3.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_process_geo_data() {
        let dir = tempfile::tempdir().unwrap();
        let table = process_geo_data(
            &catchments(),
            &dataset(),
            "basin",
            dir.path(),
            false,
            &AggregateOptions::default(),
        )
        .unwrap();

        assert_eq!(table.divide_ids, vec!["cat-1", "cat-2"]);
        assert_eq!(table.values.dim(), (2, 3, 2));
        // cat-1 spans x in [1, 2]: mean x center 1.5
        assert!((table.values[[0, 0, 0]] - 1.5).abs() < 1e-9);
        // cat-2 spans x in [3, 5]: centers 3.5 and 4.5
        assert!((table.values[[0, 2, 1]] - 4.0).abs() < 1e-9);
        assert!((table.values[[1, 2, 1]] - 282.0).abs() < 1e-9);

        let cached = read_coverage(&coverage_path(dir.path(), "basin")).unwrap();
        assert_eq!(cached.ids(), vec!["cat-1", "cat-2"]);
    }

    #[test]
    fn test_stale_cache_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = coverage_path(dir.path(), "basin");
        write_coverage(
            &path,
            &crate::weights::CoverageTable::new(vec![crate::weights::test_support::row(
                "other", 0, 0, 1.0,
            )]),
        )
        .unwrap();

        process_geo_data(
            &catchments(),
            &dataset(),
            "basin",
            dir.path(),
            false,
            &AggregateOptions::default(),
        )
        .unwrap();
        assert_eq!(read_coverage(&path).unwrap().ids(), vec!["cat-1", "cat-2"]);
    }

    #[test]
    fn test_stale_reason() {
        use crate::weights::test_support::row;
        let ids = vec!["a".to_string()];
        let window = GridWindow { y: 0..2, x: 0..2 };
        let fresh = CoverageTable::new(vec![row("a", 1, 1, 1.0)]);
        assert_eq!(stale_reason(&fresh, &window, &ids), None);

        let outside = CoverageTable::new(vec![row("a", 2, 0, 1.0)]);
        assert!(stale_reason(&outside, &window, &ids).unwrap().contains("outside"));

        let renamed = CoverageTable::new(vec![row("b", 0, 0, 1.0)]);
        assert!(stale_reason(&renamed, &window, &ids).unwrap().contains("identifiers"));
    }

    #[test]
    fn test_basin_mean_skips_nan() {
        let values = Array3::from_shape_vec((1, 2, 3), vec![1.0, f64::NAN, 3.0, f64::NAN, f64::NAN, f64::NAN])
            .unwrap();
        let t0 = Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap();
        let table = ForcingTable::new(
            vec!["P".into()],
            vec![t0, t0 + Duration::hours(1)],
            vec!["a".into(), "b".into(), "c".into()],
            values,
        )
        .unwrap();
        let mean = table.basin_mean();
        assert_eq!(mean[[0, 0]], 2.0);
        assert!(mean[[0, 1]].is_nan());
        assert_eq!(table.catchment_series(2)[[0, 0]], 3.0);
    }

    #[tokio::test]
    async fn test_fetch_catchments_reprojects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basin.geojson");
        std::fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "properties":{"divide_id":"cat-1"},
            "geometry":{"type":"Polygon","coordinates":[[[-90,35],[-89.9,35],[-89.9,35.1],[-90,35.1],[-90,35]]]}}]}"#,
        )
        .unwrap();
        let options = CatchmentOptions {
            layer: "divides".into(),
            id_col: "divide_id".into(),
            fallback_crs: None,
            raster_crs: Crs::parse("EPSG:5070").unwrap(),
            region: "us-east-1".into(),
            retry: RetryConfig::default(),
        };
        let set = fetch_catchments(path.to_str().unwrap(), dir.path(), &options)
            .await
            .unwrap();
        assert_eq!(set.crs(), &options.raster_crs);
        let (min_x, _, _, _) = set.total_bounds().unwrap();
        assert!(min_x.abs() > 1_000.0);
    }

    #[test]
    fn test_forcing_table_shape_checked() {
        assert!(ForcingTable::new(vec!["P".into()], vec![], vec!["a".into()], Array3::zeros((1, 1, 1))).is_err());
    }
}
