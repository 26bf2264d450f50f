//! Coordinate reference systems used by the forcing grids and hydrofabric.
//!
//! AORC is on a geographic lon/lat grid, HRRR on a spherical Lambert
//! Conformal Conic grid, and the hydrofabric divides are stored in
//! NAD83 / Conus Albers (EPSG:5070). NAD83 and WGS84 are treated as the
//! same datum.

use anyhow::{Result, bail};
use geo::MapCoords;
use geo_types::{Coord, MultiPolygon};
use std::f64::consts::PI;

const DEG: f64 = PI / 180.0;

/// Albers Equal Area Conic on an ellipsoid.
#[derive(Debug, Clone, PartialEq)]
pub struct AlbersEqualArea {
    a: f64,
    e: f64,
    lon0: f64,
    n: f64,
    c: f64,
    rho0: f64,
    false_easting: f64,
    false_northing: f64,
}

impl AlbersEqualArea {
    /// Creates the projection from parameters given in degrees.
    pub fn new(
        semi_major: f64,
        inverse_flattening: f64,
        lat0_deg: f64,
        lon0_deg: f64,
        lat1_deg: f64,
        lat2_deg: f64,
    ) -> Self {
        let f = 1.0 / inverse_flattening;
        let e = (2.0 * f - f * f).sqrt();
        let (lat0, lat1, lat2) = (lat0_deg * DEG, lat1_deg * DEG, lat2_deg * DEG);

        let m1 = Self::m(e, lat1);
        let m2 = Self::m(e, lat2);
        let q0 = Self::q(e, lat0);
        let q1 = Self::q(e, lat1);
        let q2 = Self::q(e, lat2);

        let n = if (lat1 - lat2).abs() < 1e-12 {
            lat1.sin()
        } else {
            (m1 * m1 - m2 * m2) / (q2 - q1)
        };
        let c = m1 * m1 + n * q1;
        let rho0 = semi_major * (c - n * q0).sqrt() / n;

        Self {
            a: semi_major,
            e,
            lon0: lon0_deg * DEG,
            n,
            c,
            rho0,
            false_easting: 0.0,
            false_northing: 0.0,
        }
    }

    /// NAD83 / Conus Albers (EPSG:5070).
    pub fn conus() -> Self {
        Self::new(6378137.0, 298.257222101, 23.0, -96.0, 29.5, 45.5)
    }

    fn m(e: f64, phi: f64) -> f64 {
        phi.cos() / (1.0 - e * e * phi.sin().powi(2)).sqrt()
    }

    fn q(e: f64, phi: f64) -> f64 {
        let s = phi.sin();
        (1.0 - e * e)
            * (s / (1.0 - e * e * s * s) - (1.0 / (2.0 * e)) * ((1.0 - e * s) / (1.0 + e * s)).ln())
    }

    pub fn forward(&self, lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let q = Self::q(self.e, lat_deg * DEG);
        let rho = self.a * (self.c - self.n * q).max(0.0).sqrt() / self.n;
        let theta = self.n * normalize_lon(lon_deg * DEG - self.lon0);
        (
            self.false_easting + rho * theta.sin(),
            self.false_northing + self.rho0 - rho * theta.cos(),
        )
    }

    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let x = x - self.false_easting;
        let dy = self.rho0 - (y - self.false_northing);
        let rho = (x * x + dy * dy).sqrt();
        let theta = if self.n >= 0.0 {
            x.atan2(dy)
        } else {
            (-x).atan2(-dy)
        };
        let q = (self.c - (rho * self.n / self.a).powi(2)) / self.n;
        let e = self.e;

        let mut phi = (q / 2.0).clamp(-1.0, 1.0).asin();
        for _ in 0..15 {
            let s = phi.sin();
            let one_es2 = 1.0 - e * e * s * s;
            let delta = one_es2 * one_es2 / (2.0 * phi.cos())
                * (q / (1.0 - e * e) - s / one_es2
                    + (1.0 / (2.0 * e)) * ((1.0 - e * s) / (1.0 + e * s)).ln());
            phi += delta;
            if delta.abs() < 1e-12 {
                break;
            }
        }

        let lon = self.lon0 + theta / self.n;
        (normalize_lon(lon) / DEG, phi / DEG)
    }
}

/// Lambert Conformal Conic on a sphere, with the origin at (`lon0`, `lat0`).
#[derive(Debug, Clone, PartialEq)]
pub struct LambertConformal {
    radius: f64,
    lon0: f64,
    n: f64,
    f: f64,
    rho0: f64,
}

impl LambertConformal {
    pub fn new(radius: f64, lat0_deg: f64, lon0_deg: f64, lat1_deg: f64, lat2_deg: f64) -> Self {
        let (lat0, lat1, lat2) = (lat0_deg * DEG, lat1_deg * DEG, lat2_deg * DEG);
        let n = if (lat1 - lat2).abs() < 1e-10 {
            lat1.sin()
        } else {
            (lat1.cos() / lat2.cos()).ln()
                / ((PI / 4.0 + lat2 / 2.0).tan() / (PI / 4.0 + lat1 / 2.0).tan()).ln()
        };
        let f = lat1.cos() * (PI / 4.0 + lat1 / 2.0).tan().powf(n) / n;
        let rho0 = radius * f / (PI / 4.0 + lat0 / 2.0).tan().powf(n);
        Self {
            radius,
            lon0: lon0_deg * DEG,
            n,
            f,
            rho0,
        }
    }

    /// The HRRR CONUS grid projection.
    pub fn hrrr() -> Self {
        Self::new(6371229.0, 38.5, 262.5, 38.5, 38.5)
    }

    pub fn forward(&self, lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let rho = self.radius * self.f / (PI / 4.0 + lat_deg * DEG / 2.0).tan().powf(self.n);
        let theta = self.n * normalize_lon(lon_deg * DEG - self.lon0);
        (rho * theta.sin(), self.rho0 - rho * theta.cos())
    }

    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dy = self.rho0 - y;
        let rho = self.n.signum() * (x * x + dy * dy).sqrt();
        let theta = if self.n >= 0.0 {
            x.atan2(dy)
        } else {
            (-x).atan2(-dy)
        };
        let lat = 2.0 * (self.radius * self.f / rho).powf(1.0 / self.n).atan() - PI / 2.0;
        let lon = self.lon0 + theta / self.n;
        (normalize_lon(lon) / DEG, lat / DEG)
    }
}

fn normalize_lon(mut lon: f64) -> f64 {
    while lon > PI {
        lon -= 2.0 * PI;
    }
    while lon < -PI {
        lon += 2.0 * PI;
    }
    lon
}

#[derive(Debug, Clone, PartialEq)]
pub enum Crs {
    /// Longitude/latitude in degrees.
    Geographic,
    AlbersEqualArea(AlbersEqualArea),
    LambertConformal(LambertConformal),
}

impl Crs {
    /// Parses `EPSG:4326`, `epsg:5070`, `5070` or `hrrr`.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("hrrr") {
            return Ok(Crs::hrrr());
        }
        let code = trimmed
            .rsplit(':')
            .next()
            .unwrap_or(trimmed)
            .parse::<u32>();
        match code {
            Ok(4326) | Ok(4269) | Ok(4258) => Ok(Crs::Geographic),
            Ok(5070) => Ok(Crs::AlbersEqualArea(AlbersEqualArea::conus())),
            Ok(other) => bail!("unsupported EPSG code {other}"),
            Err(_) => bail!("unrecognized CRS '{s}'"),
        }
    }

    pub fn from_epsg(code: u32) -> Result<Self> {
        Self::parse(&format!("EPSG:{code}"))
    }

    pub fn hrrr() -> Self {
        Crs::LambertConformal(LambertConformal::hrrr())
    }

    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (x, y),
            Crs::AlbersEqualArea(p) => p.inverse(x, y),
            Crs::LambertConformal(p) => p.inverse(x, y),
        }
    }

    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (lon, lat),
            Crs::AlbersEqualArea(p) => p.forward(lon, lat),
            Crs::LambertConformal(p) => p.forward(lon, lat),
        }
    }

    /// Transforms a point from `self` into `target`.
    pub fn transform_to(&self, target: &Crs, x: f64, y: f64) -> (f64, f64) {
        if self == target {
            return (x, y);
        }
        let (lon, lat) = self.to_geographic(x, y);
        target.from_geographic(lon, lat)
    }

    pub fn reproject(&self, target: &Crs, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if self == target {
            return geometry.clone();
        }
        geometry.map_coords(|c| {
            let (x, y) = self.transform_to(target, c.x, c.y);
            Coord { x, y }
        })
    }
}
