//! GeoPackage reader for hydrofabric divide layers.
//!
//! A GeoPackage is a SQLite database. Geometries are stored as blobs made of a
//! `GP` header (SRS id, optional envelope) followed by standard WKB, decoded
//! with `geozero`.

use anyhow::{Context, Result, bail};
use geo_types::{Geometry, MultiPolygon};
use geozero::ToGeo;
use geozero::wkb::GpkgWkb;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, params};
use std::path::Path;
use tracing::{debug, warn};

use super::{Catchment, CatchmentSet};
use crate::projection::Crs;

/// Reads every feature of `layer`, keyed on `id_col`.
pub fn read_gpkg(path: &Path, layer: &str, id_col: &str) -> Result<CatchmentSet> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("opening GeoPackage {}", path.display()))?;

    let (geom_col, srs_id): (String, i64) = conn
        .query_row(
            "SELECT column_name, srs_id FROM gpkg_geometry_columns WHERE table_name = ?1",
            params![layer],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .with_context(|| format!("layer '{layer}' not found in {}", path.display()))?;

    let crs = layer_crs(&conn, srs_id)?;
    debug!(layer, geom_col, srs_id, "GeoPackage layer");

    let sql = format!(
        "SELECT \"{}\", \"{}\" FROM \"{}\"",
        id_col.replace('"', "\"\""),
        geom_col.replace('"', "\"\""),
        layer.replace('"', "\"\"")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, Value>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
    })?;

    let mut catchments = Vec::new();
    for row in rows {
        let (id, blob) = row?;
        let id = match id {
            Value::Text(s) => s,
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            other => bail!("unsupported identifier value {other:?} in '{id_col}'"),
        };
        let Some(blob) = blob else {
            warn!(id, "Skipping feature without geometry");
            continue;
        };
        let geometry = decode_gpkg_geometry(&blob).with_context(|| format!("decoding '{id}'"))?;
        catchments.push(Catchment::new(id, geometry));
    }

    CatchmentSet::new(crs, catchments)
}

fn layer_crs(conn: &Connection, srs_id: i64) -> Result<Crs> {
    let found: Option<(String, i64)> = conn
        .query_row(
            "SELECT organization, organization_coordsys_id FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            params![srs_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();
    match found {
        Some((org, code)) if org.eq_ignore_ascii_case("epsg") => Crs::from_epsg(code as u32),
        Some((org, code)) => bail!("unsupported spatial reference {org}:{code}"),
        None => Crs::from_epsg(srs_id as u32),
    }
}

/// Decodes a GeoPackage geometry blob into a multipolygon.
///
/// Polygons are promoted to single-member multipolygons; an empty geometry
/// decodes to an empty multipolygon.
pub fn decode_gpkg_geometry(blob: &[u8]) -> Result<MultiPolygon<f64>> {
    let geometry = GpkgWkb(blob.to_vec())
        .to_geo()
        .context("invalid GeoPackage geometry")?;
    match geometry {
        Geometry::Polygon(polygon) => Ok(MultiPolygon(vec![polygon])),
        Geometry::MultiPolygon(polygons) => Ok(polygons),
        Geometry::GeometryCollection(collection) if collection.0.is_empty() => Ok(MultiPolygon(vec![])),
        other => bail!("unsupported geometry type {}", geometry_kind(&other)),
    }
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}
