//! Exact cell coverage: the fraction of each raster cell covered by a polygon.

use geo::{Area, BooleanOps, BoundingRect};
use geo_types::{MultiPolygon, Rect, coord};

use crate::grid::{GridWindow, RasterGrid};

/// Coverage below this fraction is treated as a touch, not an overlap.
const MIN_COVERAGE: f64 = 1e-12;

/// `(cell_id, coverage)` for every window cell `geometry` overlaps, where
/// `cell_id` is the row-major index within `window` and coverage is the
/// intersected area over the cell area. Interior rings reduce coverage.
pub fn coverage_fractions(
    geometry: &MultiPolygon<f64>,
    grid: &RasterGrid,
    window: &GridWindow,
) -> Vec<(usize, f64)> {
    let Some(bbox) = geometry.bounding_rect() else {
        return Vec::new();
    };
    let rows = intersect(
        &grid.y.overlapping(bbox.min().y, bbox.max().y),
        &window.y,
    );
    let cols = intersect(
        &grid.x.overlapping(bbox.min().x, bbox.max().x),
        &window.x,
    );

    let mut out = Vec::new();
    for row in rows {
        let (y0, y1) = grid.y.cell_edges(row);
        for col in cols.clone() {
            let (x0, x1) = grid.x.cell_edges(col);
            let cell = Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 });
            let cell_area = cell.unsigned_area();
            if cell_area <= 0.0 {
                continue;
            }
            let covered = geometry.intersection(&cell.to_polygon()).unsigned_area();
            let fraction = (covered / cell_area).min(1.0);
            if fraction > MIN_COVERAGE {
                let local = window.ravel(row - window.y.start, col - window.x.start);
                out.push((local, fraction));
            }
        }
    }
    out.sort_by_key(|(cell_id, _)| *cell_id);
    out
}

fn intersect(a: &std::ops::Range<usize>, b: &std::ops::Range<usize>) -> std::ops::Range<usize> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    start..end.max(start)
}
