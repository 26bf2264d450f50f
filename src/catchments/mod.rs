//! Catchment (divide) polygons for a basin.
//!
//! A [`CatchmentSet`] owns the divides of one hydrofabric basin together with
//! the CRS their coordinates are expressed in. Identifiers are unique within a
//! set.

pub mod json;
pub mod gpkg;

use anyhow::{Context, Result, bail};
use geo::{BoundingRect, Centroid};
use geo_types::{MultiPolygon, Point};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::projection::Crs;

/// Bounding box as `(min_x, min_y, max_x, max_y)`.
pub type Bounds = (f64, f64, f64, f64);

#[derive(Debug, Clone)]
pub struct Catchment {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
}

impl Catchment {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
        }
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.geometry
            .bounding_rect()
            .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
    }

    pub fn centroid(&self) -> Option<Point<f64>> {
        self.geometry.centroid()
    }
}

#[derive(Debug, Clone)]
pub struct CatchmentSet {
    crs: Crs,
    catchments: Vec<Catchment>,
}

impl CatchmentSet {
    /// Builds a set, rejecting empty input and duplicate identifiers.
    pub fn new(crs: Crs, catchments: Vec<Catchment>) -> Result<Self> {
        if catchments.is_empty() {
            bail!("catchment set is empty");
        }
        let mut seen = HashSet::with_capacity(catchments.len());
        for c in &catchments {
            if !seen.insert(c.id.as_str()) {
                bail!("duplicate catchment identifier '{}'", c.id);
            }
        }
        Ok(Self { crs, catchments })
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn len(&self) -> usize {
        self.catchments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catchments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Catchment> {
        self.catchments.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Catchment> {
        self.catchments.iter().find(|c| c.id == id)
    }

    /// Identifiers in ascending order, the order used for every output table.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.catchments.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Union of the bounding boxes of all catchments.
    pub fn total_bounds(&self) -> Result<Bounds> {
        self.catchments
            .iter()
            .filter_map(Catchment::bounds)
            .reduce(|a, b| (a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3)))
            .context("catchments have no coordinates")
    }

    /// Reprojects every geometry into `target`.
    pub fn to_crs(&self, target: &Crs) -> CatchmentSet {
        if &self.crs == target {
            return self.clone();
        }
        let catchments = self
            .catchments
            .iter()
            .map(|c| Catchment::new(c.id.clone(), self.crs.reproject(target, &c.geometry)))
            .collect();
        CatchmentSet {
            crs: target.clone(),
            catchments,
        }
    }
}

/// Loads catchments from a GeoPackage (`.gpkg`) or GeoJSON (`.geojson`/`.json`).
///
/// `fallback_crs` is used when the file does not declare a CRS.
pub fn load_catchments(
    path: &Path,
    layer: &str,
    id_col: &str,
    fallback_crs: Option<&Crs>,
) -> Result<CatchmentSet> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    debug!(path = %path.display(), layer, id_col, "Loading catchments");

    match ext.as_str() {
        "gpkg" => gpkg::read_gpkg(path, layer, id_col),
        "geojson" | "json" => {
            let crs = fallback_crs.cloned().unwrap_or(Crs::Geographic);
            json::read_geojson(path, id_col, crs)
        }
        other => bail!(
            "unsupported catchment file type '{}' for {}",
            other,
            path.display()
        ),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use geo_types::{LineString, Polygon};

    pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![Polygon::new(
            LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)]),
            vec![],
        )])
    }
}
