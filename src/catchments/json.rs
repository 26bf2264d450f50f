//! GeoJSON catchment reader.

use anyhow::{Context, Result, anyhow, bail};
use geo_types::{Geometry, MultiPolygon};
use geojson::{Feature, GeoJson};
use std::path::Path;

use super::{Catchment, CatchmentSet};
use crate::projection::Crs;

/// Reads a FeatureCollection of Polygon/MultiPolygon features.
///
/// The identifier is taken from the `id_col` property, falling back to the
/// feature id.
pub fn read_geojson(path: &Path, id_col: &str, crs: Crs) -> Result<CatchmentSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading GeoJSON {}", path.display()))?;
    parse_geojson(&text, id_col, crs).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_geojson(text: &str, id_col: &str, crs: Crs) -> Result<CatchmentSet> {
    let geojson: GeoJson = text.parse()?;
    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => bail!("expected a FeatureCollection, found a bare geometry"),
    };

    let catchments = features
        .into_iter()
        .enumerate()
        .map(|(i, feature)| feature_to_catchment(feature, id_col).with_context(|| format!("feature {i}")))
        .collect::<Result<Vec<_>>>()?;

    CatchmentSet::new(crs, catchments)
}

fn feature_to_catchment(feature: Feature, id_col: &str) -> Result<Catchment> {
    let id = match feature.property(id_col) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(other) => bail!("unsupported '{id_col}' value {other}"),
        None => match &feature.id {
            Some(geojson::feature::Id::String(s)) => s.clone(),
            Some(geojson::feature::Id::Number(n)) => n.to_string(),
            None => bail!("feature has no '{id_col}' property"),
        },
    };

    let geometry = feature
        .geometry
        .ok_or_else(|| anyhow!("catchment '{id}' has no geometry"))?;
    let geometry: Geometry<f64> = Geometry::try_from(geometry.value)?;

    let geometry = match geometry {
        Geometry::Polygon(p) => MultiPolygon(vec![p]),
        Geometry::MultiPolygon(mp) => mp,
        _ => bail!("catchment '{id}' is not a polygon"),
    };

    Ok(Catchment::new(id, geometry))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTION: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "properties": {"divide_id": "cat-2"},
          "geometry": {"type": "Polygon", "coordinates": [[[1,0],[2,0],[2,1],[1,1],[1,0]]]}
        },
        {
          "type": "Feature",
          "properties": {"divide_id": 11},
          "geometry": {"type": "MultiPolygon", "coordinates": [[[[0,0],[1,0],[1,1],[0,1],[0,0]]]]}
        }
      ]
    }"#;

    #[test]
    fn test_parse_feature_collection() {
        let set = parse_geojson(COLLECTION, "divide_id", Crs::Geographic).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.sorted_ids(), vec!["11", "cat-2"]);
        assert_eq!(set.total_bounds().unwrap(), (0.0, 0.0, 2.0, 1.0));
    }

    #[test]
    fn test_missing_id_property_fails() {
        assert!(parse_geojson(COLLECTION, "nope", Crs::Geographic).is_err());
    }

    #[test]
    fn test_point_geometry_rejected() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"divide_id": "a"},
             "geometry": {"type": "Point", "coordinates": [0, 0]}}]}"#;
        assert!(parse_geojson(text, "divide_id", Crs::Geographic).is_err());
    }
}
