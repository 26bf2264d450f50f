//! Coverage weights linking catchments to raster cells.
//!
//! A [`CoverageTable`] holds one row per (catchment, cell) pair with the
//! cell's fractional coverage and its `(y, x)` position inside the basin
//! window. Rows are grouped by catchment in ascending identifier order.

pub mod cache;
pub mod exact;

use anyhow::{Result, bail};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::catchments::CatchmentSet;
use crate::grid::{GridWindow, RasterGrid};

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRow {
    pub divide_id: String,
    /// Row-major cell index within the window.
    pub cell_id: i64,
    pub coverage: f64,
    pub global_idx_y: i64,
    pub global_idx_x: i64,
}

/// `(cell_id, coverage)` pairs of one catchment.
pub type CellWeights = Vec<(usize, f64)>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageTable {
    rows: Vec<CoverageRow>,
}

impl CoverageTable {
    pub fn new(mut rows: Vec<CoverageRow>) -> Self {
        rows.sort_by(|a, b| a.divide_id.cmp(&b.divide_id));
        Self { rows }
    }

    pub fn rows(&self) -> &[CoverageRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows of each catchment, in identifier order.
    pub fn windows(&self) -> impl Iterator<Item = (&str, &[CoverageRow])> {
        self.rows
            .chunk_by(|a, b| a.divide_id == b.divide_id)
            .map(|group| (group[0].divide_id.as_str(), group))
    }

    pub fn ids(&self) -> Vec<String> {
        self.windows().map(|(id, _)| id.to_string()).collect()
    }

    pub fn weight_sum(&self, id: &str) -> f64 {
        self.rows
            .iter()
            .filter(|r| r.divide_id == id)
            .map(|r| r.coverage)
            .sum()
    }

    /// True when every row addresses a cell inside a window of this shape.
    pub fn fits(&self, window: &GridWindow) -> bool {
        let (ny, nx) = window.shape();
        self.rows.iter().all(|r| {
            (0..ny as i64).contains(&r.global_idx_y) && (0..nx as i64).contains(&r.global_idx_x)
        })
    }
}

/// Coverage of every catchment over `window`.
///
/// Catchments without coverage receive the weights of the catchment whose
/// centroid is nearest to theirs. Fails when no catchment has coverage, or
/// when an uncovered catchment has no centroid to measure from.
#[tracing::instrument(skip_all, fields(catchments = catchments.len()))]
pub fn get_weights(
    catchments: &CatchmentSet,
    grid: &RasterGrid,
    window: &GridWindow,
) -> Result<BTreeMap<String, CellWeights>> {
    let all: Vec<_> = catchments.iter().collect();
    let mut weights: BTreeMap<String, CellWeights> = all
        .par_iter()
        .map(|c| {
            (
                c.id.clone(),
                exact::coverage_fractions(&c.geometry, grid, window),
            )
        })
        .collect();

    let missing: Vec<String> = weights
        .iter()
        .filter(|(_, cells)| cells.iter().map(|(_, w)| w).sum::<f64>() <= 0.0)
        .map(|(id, _)| id.clone())
        .collect();
    if missing.len() == weights.len() {
        bail!("none of the {} catchments overlap the raster window", weights.len());
    }
    if !missing.is_empty() {
        warn!(
            count = missing.len(),
            ids = ?missing,
            "Catchments have no raster coverage, assigning nearest neighbor weights"
        );
        let skip: HashSet<&str> = missing.iter().map(String::as_str).collect();
        let mut unplaced = Vec::new();
        for id in &missing {
            match nearest_covered(catchments, id, &skip) {
                Some(nearest) => {
                    debug!(id, nearest, "Copying nearest neighbor weights");
                    let copied = weights.get(nearest).cloned().unwrap_or_default();
                    weights.insert(id.clone(), copied);
                }
                None => {
                    warn!(id, "Catchment has no centroid, cannot assign neighbor weights");
                    unplaced.push(id.clone());
                }
            }
        }
        if !unplaced.is_empty() {
            bail!("catchments without coverage or geometry: {}", unplaced.join(", "));
        }
    }
    Ok(weights)
}

/// The covered catchment whose centroid is closest to `id`'s centroid.
fn nearest_covered<'a>(
    catchments: &'a CatchmentSet,
    id: &str,
    uncovered: &HashSet<&str>,
) -> Option<&'a str> {
    let origin = catchments.get(id)?.centroid()?;
    catchments
        .iter()
        .filter(|c| !uncovered.contains(c.id.as_str()))
        .filter_map(|c| {
            let p = c.centroid()?;
            Some((c.id.as_str(), (p.x() - origin.x()).hypot(p.y() - origin.y())))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

/// Attaches window-relative `(y, x)` indices to every weight.
pub fn build_index(weights: &BTreeMap<String, CellWeights>, window: &GridWindow) -> CoverageTable {
    let rows = weights
        .iter()
        .flat_map(|(id, cells)| {
            cells.iter().map(move |&(cell_id, coverage)| {
                let (y, x) = window.unravel(cell_id);
                CoverageRow {
                    divide_id: id.clone(),
                    cell_id: cell_id as i64,
                    coverage,
                    global_idx_y: y as i64,
                    global_idx_x: x as i64,
                }
            })
        })
        .collect();
    CoverageTable::new(rows)
}

pub fn compute_coverage(
    catchments: &CatchmentSet,
    grid: &RasterGrid,
    window: &GridWindow,
) -> Result<CoverageTable> {
    Ok(build_index(&get_weights(catchments, grid, window)?, window))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::catchments::Catchment;
    use crate::catchments::test_support::rect;
    use crate::projection::Crs;

    fn set(items: Vec<(&str, (f64, f64, f64, f64))>) -> CatchmentSet {
        CatchmentSet::new(
            Crs::Geographic,
            items
                .into_iter()
                .map(|(id, (x0, y0, x1, y1))| Catchment::new(id, rect(x0, y0, x1, y1)))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_nearest_neighbor_fallback() {
        let grid = unit_grid(4, 4);
        let window = GridWindow::full(4, 4);
        let catchments = set(vec![
            ("cat-a", (0.0, 0.0, 1.0, 1.0)),
            ("cat-b", (3.0, 3.0, 4.0, 4.0)),
            ("cat-c", (5.0, 5.0, 6.0, 6.0)),
        ]);
        let weights = get_weights(&catchments, &grid, &window).unwrap();
        assert_eq!(weights["cat-c"], weights["cat-b"]);
        assert_ne!(weights["cat-a"], weights["cat-b"]);
    }

    #[test]
    fn test_zero_area_catchment_gets_neighbor_weights() {
        let grid = unit_grid(4, 4);
        let catchments = set(vec![
            ("cat-a", (0.0, 0.0, 1.0, 1.0)),
            ("cat-b", (3.0, 3.0, 4.0, 4.0)),
            // a vertical sliver with no area, nearer to cat-b
            ("cat-z", (2.0, 2.0, 2.0, 3.0)),
        ]);
        let weights = get_weights(&catchments, &grid, &GridWindow::full(4, 4)).unwrap();
        assert!(!weights["cat-z"].is_empty());
        assert_eq!(weights["cat-z"], weights["cat-b"]);
    }

    #[test]
    fn test_empty_geometry_fails_with_its_id() {
        let grid = unit_grid(4, 4);
        let catchments = CatchmentSet::new(
            Crs::Geographic,
            vec![
                Catchment::new("cat-a", rect(0.0, 0.0, 1.0, 1.0)),
                Catchment::new("cat-empty", geo_types::MultiPolygon(vec![])),
            ],
        )
        .unwrap();
        let err = get_weights(&catchments, &grid, &GridWindow::full(4, 4)).unwrap_err();
        assert!(err.to_string().contains("cat-empty"));
    }

    #[test]
    fn test_no_coverage_at_all_fails() {
        let grid = unit_grid(2, 2);
        let catchments = set(vec![("cat-a", (10.0, 10.0, 11.0, 11.0))]);
        assert!(get_weights(&catchments, &grid, &GridWindow::full(2, 2)).is_err());
    }

    #[test]
    fn test_build_index_unravels_cells() {
        let window = GridWindow { y: 0..2, x: 0..3 };
        let mut weights = BTreeMap::new();
        weights.insert("cat-2".to_string(), vec![(5, 0.25)]);
        weights.insert("cat-1".to_string(), vec![(0, 1.0), (4, 0.5)]);
        let table = build_index(&weights, &window);

        assert_eq!(table.ids(), vec!["cat-1", "cat-2"]);
        let rows = table.rows();
        assert_eq!((rows[1].global_idx_y, rows[1].global_idx_x), (1, 1));
        assert_eq!((rows[2].global_idx_y, rows[2].global_idx_x), (1, 2));
        assert_eq!(table.weight_sum("cat-1"), 1.5);
        assert!(table.fits(&window));
        assert!(!table.fits(&GridWindow { y: 0..1, x: 0..3 }));
    }

    #[test]
    fn test_windows_group_rows() {
        let table = CoverageTable::new(vec![
            row("b", 0, 0, 1.0),
            row("a", 0, 1, 0.5),
            row("b", 1, 0, 0.5),
        ]);
        let groups: Vec<(&str, usize)> = table.windows().map(|(id, rows)| (id, rows.len())).collect();
        assert_eq!(groups, vec![("a", 1), ("b", 2)]);
    }
}
