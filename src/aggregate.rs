//! Coverage-weighted window means over `[variable, time, y, x]` blocks.
//!
//! The raster is split into `cvar x ctime` blocks that always span the whole
//! basin window spatially. Blocks are read and reduced in parallel; within a
//! block, catchments are reduced in groups of `cid`.

use anyhow::{Result, anyhow};
use ndarray::{Array3, ArrayView4, s};
use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info};

use crate::config::{ChunkConfig, RetryConfig};
use crate::fetch::retry::with_retry_blocking;
use crate::grid::GridWindow;
use crate::weights::{CoverageRow, CoverageTable};
use crate::zarr::RasterSource;

#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub chunks: ChunkConfig,
    pub threads: usize,
    pub retry: RetryConfig,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            chunks: ChunkConfig::default(),
            threads: 1,
            retry: RetryConfig::default(),
        }
    }
}

/// Weighted mean `sum(data * w) / sum(w)` of each catchment's cells, for every
/// variable and time step of `block`. Returns `[variable, time, ids]`.
///
/// A missing (NaN) cell makes the catchment's mean NaN for that step.
pub fn window_aggregate(
    block: ArrayView4<f32>,
    table: &CoverageTable,
    ids: &[String],
) -> Result<Array3<f64>> {
    let windows: HashMap<&str, &[CoverageRow]> = table.windows().collect();
    let (nv, nt, _, _) = block.dim();
    let mut out = Array3::<f64>::zeros((nv, nt, ids.len()));

    for (k, id) in ids.iter().enumerate() {
        let rows = windows
            .get(id.as_str())
            .ok_or_else(|| anyhow!("no coverage rows for catchment '{id}'"))?;
        let total: f64 = rows.iter().map(|r| r.coverage).sum();
        let cells: Vec<(usize, usize, f64)> = rows
            .iter()
            .map(|r| (r.global_idx_y as usize, r.global_idx_x as usize, r.coverage))
            .collect();

        for v in 0..nv {
            for t in 0..nt {
                let plane = block.slice(s![v, t, .., ..]);
                let weighted: f64 = cells
                    .iter()
                    .map(|&(y, x, w)| f64::from(plane[[y, x]]) * w)
                    .sum();
                out[[v, t, k]] = weighted / total;
            }
        }
    }
    Ok(out)
}

fn split(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Aggregates every variable and time step of `source` over `window`.
///
/// Returns `[variable, time, ids]` with `ids` in the given order.
#[tracing::instrument(skip_all, fields(catchments = ids.len()))]
pub fn aggregate_source(
    source: &dyn RasterSource,
    table: &CoverageTable,
    window: &GridWindow,
    ids: &[String],
    options: &AggregateOptions,
) -> Result<Array3<f64>> {
    let grid = source.grid();
    let nv = grid.variables.len();
    let nt = grid.times.len();
    let chunks = options.chunks;

    let var_blocks = split(nv, chunks.cvar);
    let time_blocks = split(nt, chunks.ctime(nt));
    let id_groups = split(ids.len(), chunks.catchments_per_task(ids.len()));
    let blocks: Vec<(Range<usize>, Range<usize>)> = var_blocks
        .iter()
        .flat_map(|v| time_blocks.iter().map(move |t| (v.clone(), t.clone())))
        .collect();

    info!(
        blocks = blocks.len(),
        id_groups = id_groups.len(),
        threads = options.threads,
        "Aggregating raster blocks"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .build()?;

    let results: Vec<Array3<f64>> = pool.install(|| {
        blocks
            .par_iter()
            .map(|(vars, times)| {
                let data = with_retry_blocking("reading raster block", options.retry, || {
                    source.read_block(vars.clone(), times.clone(), window)
                })?;
                debug!(vars = ?vars, times = ?times, shape = ?data.dim(), "Block loaded");

                let parts = id_groups
                    .par_iter()
                    .map(|group| window_aggregate(data.view(), table, &ids[group.clone()]))
                    .collect::<Result<Vec<_>>>()?;

                let mut block = Array3::<f64>::zeros((vars.len(), times.len(), ids.len()));
                for (group, part) in id_groups.iter().zip(parts) {
                    block.slice_mut(s![.., .., group.clone()]).assign(&part);
                }
                Ok(block)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut out = Array3::<f64>::zeros((nv, nt, ids.len()));
    for ((vars, times), block) in blocks.iter().zip(results) {
        out.slice_mut(s![vars.clone(), times.clone(), ..]).assign(&block);
    }
    Ok(out)
}
