//! Raster grid geometry: cell-center axes, windows and cell extents.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::ops::Range;

use crate::catchments::Bounds;

/// Regularly spaced cell centers along one dimension.
///
/// Values may be ascending or descending; latitude axes are frequently stored
/// north to south.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    values: Vec<f64>,
    spacing: f64,
}

impl Axis {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            bail!("axis has no coordinates");
        }
        if values.len() > 1 {
            let ascending = values[1] > values[0];
            let monotonic = values
                .windows(2)
                .all(|w| if ascending { w[1] > w[0] } else { w[1] < w[0] });
            if !monotonic {
                bail!("axis coordinates are not strictly monotonic");
            }
        }
        // A lone center carries no spacing of its own.
        let spacing = if values.len() < 2 {
            1.0
        } else {
            ((values[values.len() - 1] - values[0]) / (values.len() - 1) as f64).abs()
        };
        Ok(Self { values, spacing })
    }

    /// The cells in `range`, keeping this axis's spacing even when a single
    /// cell remains.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.is_empty() || range.end > self.values.len() {
            bail!(
                "axis slice {}..{} outside 0..{}",
                range.start,
                range.end,
                self.values.len()
            );
        }
        Ok(Self {
            values: self.values[range].to_vec(),
            spacing: self.spacing,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn is_descending(&self) -> bool {
        self.values.len() > 1 && self.values[1] < self.values[0]
    }

    /// Absolute distance between neighbouring centers.
    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    /// Lower and upper edge of cell `i`.
    pub fn cell_edges(&self, i: usize) -> (f64, f64) {
        let half = self.spacing() / 2.0;
        let c = self.values[i];
        (c - half, c + half)
    }

    /// Indices of the cells whose extent overlaps `[min, max]`.
    pub fn overlapping(&self, min: f64, max: f64) -> Range<usize> {
        let hits: Vec<usize> = (0..self.values.len())
            .filter(|&i| {
                let (lo, hi) = self.cell_edges(i);
                lo < max && hi > min
            })
            .collect();
        match (hits.first(), hits.last()) {
            (Some(&a), Some(&b)) => a..b + 1,
            _ => 0..0,
        }
    }
}

/// A rectangular block of the grid, as half-open row (y) and column (x) ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridWindow {
    pub y: Range<usize>,
    pub x: Range<usize>,
}

impl GridWindow {
    pub fn full(ny: usize, nx: usize) -> Self {
        Self { y: 0..ny, x: 0..nx }
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.y.len(), self.x.len())
    }

    pub fn cell_count(&self) -> usize {
        self.y.len() * self.x.len()
    }

    /// Window-relative `(row, col)` of a row-major flat cell index.
    pub fn unravel(&self, cell_id: usize) -> (usize, usize) {
        let cols = self.x.len();
        (cell_id / cols, cell_id % cols)
    }

    pub fn ravel(&self, row: usize, col: usize) -> usize {
        row * self.x.len() + col
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    pub x: Axis,
    pub y: Axis,
    pub times: Vec<DateTime<Utc>>,
    pub variables: Vec<String>,
}

impl RasterGrid {
    pub fn ny(&self) -> usize {
        self.y.len()
    }

    pub fn nx(&self) -> usize {
        self.x.len()
    }

    /// The window of cells overlapping `bounds`.
    pub fn window_for_bounds(&self, bounds: Bounds) -> Result<GridWindow> {
        let (min_x, min_y, max_x, max_y) = bounds;
        let window = GridWindow {
            y: self.y.overlapping(min_y, max_y),
            x: self.x.overlapping(min_x, max_x),
        };
        if window.cell_count() == 0 {
            bail!(
                "bounds ({min_x}, {min_y}, {max_x}, {max_y}) do not overlap the raster domain"
            );
        }
        Ok(window)
    }

    /// Extent `(min_x, min_y, max_x, max_y)` of window cell (`row`, `col`).
    pub fn cell_bounds(&self, window: &GridWindow, row: usize, col: usize) -> Bounds {
        let (x0, x1) = self.x.cell_edges(window.x.start + col);
        let (y0, y1) = self.y.cell_edges(window.y.start + row);
        (x0, y0, x1, y1)
    }

    pub fn cell_area(&self) -> f64 {
        self.x.spacing() * self.y.spacing()
    }
}
