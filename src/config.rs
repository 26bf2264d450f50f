//! YAML run configuration for the AORC and HRRR generators.
//!
//! Keys follow the processing configs used in production
//! (`aorc_source`, `basin_url_template`, `cvar`, `ctime_max`, ...). Paths may
//! contain a `{home_dir}` placeholder which is expanded on load.

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A basin identifier as written in YAML: either a bare number or a string.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BasinEntry {
    Number(u64),
    Text(String),
}

impl BasinEntry {
    pub fn as_id(&self) -> String {
        match self {
            BasinEntry::Number(n) => n.to_string(),
            BasinEntry::Text(s) => s.clone(),
        }
    }
}

/// Chunking parameters for the aggregation.
///
/// `cvar` variables and at most `ctime_max` time steps are evaluated per block;
/// `cid` catchments are aggregated per task (`-1` keeps all catchments of a
/// block in one task).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ChunkConfig {
    pub cvar: usize,
    pub ctime_max: usize,
    pub cid: i64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            cvar: 8,
            ctime_max: 120,
            cid: -1,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cvar == 0 {
            bail!("cvar must be positive");
        }
        if self.ctime_max == 0 {
            bail!("ctime_max must be positive");
        }
        if self.cid == 0 || self.cid < -1 {
            bail!("cid must be -1 or a positive chunk size, got {}", self.cid);
        }
        Ok(())
    }

    /// Time steps per block for a series of `n_times` steps.
    pub fn ctime(&self, n_times: usize) -> usize {
        self.ctime_max.min(n_times).max(1)
    }

    /// Catchments per aggregation task.
    pub fn catchments_per_task(&self, n_catchments: usize) -> usize {
        if self.cid < 0 {
            n_catchments.max(1)
        } else {
            self.cid as usize
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: usize,
    pub wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            wait_secs: 30,
        }
    }
}

/// A single local GeoPackage processed instead of the basin list.
///
/// `layer` defaults to the file stem; `id_col` names the column holding the
/// catchment identifier.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GpkgInput {
    pub path: String,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default = "default_gpkg_id_col")]
    pub id_col: String,
}

impl GpkgInput {
    /// Basin name used for the coverage cache and output files.
    pub fn name(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "gpkg".to_string())
    }

    pub fn layer(&self) -> String {
        self.layer.clone().unwrap_or_else(|| self.name())
    }
}

fn default_gpkg_id_col() -> String {
    "GAGE_ID".to_string()
}

/// Optional upload of finished basin outputs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub gzip: bool,
}

fn default_layer() -> String {
    "divides".to_string()
}

fn default_id_col() -> String {
    "divide_id".to_string()
}

fn default_threads() -> usize {
    12
}

fn default_aorc_crs() -> String {
    "EPSG:4326".to_string()
}

fn default_hrrr_crs() -> String {
    "hrrr".to_string()
}

fn default_aorc_region() -> String {
    "us-east-1".to_string()
}

fn default_hrrr_region() -> String {
    "us-west-1".to_string()
}

fn default_lon_dim() -> String {
    "longitude".to_string()
}

fn default_lat_dim() -> String {
    "latitude".to_string()
}

fn default_hrrr_x_dim() -> String {
    "projection_x_coordinate".to_string()
}

fn default_hrrr_y_dim() -> String {
    "projection_y_coordinate".to_string()
}

fn default_bucket_subf() -> String {
    "s3://hrrrzarr/sfc".to_string()
}

fn default_drop_vars() -> Vec<String> {
    ["forecast_period", "forecast_reference_time", "height", "pressure"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AorcConfig {
    pub aorc_source: String,
    pub aorc_year_url_template: String,
    pub basin_url_template: String,
    #[serde(default)]
    pub basins: Vec<BasinEntry>,
    pub years: Vec<i32>,
    #[serde(default = "ChunkConfig::default_cvar")]
    pub cvar: usize,
    #[serde(default = "ChunkConfig::default_ctime_max")]
    pub ctime_max: usize,
    #[serde(default = "ChunkConfig::default_cid")]
    pub cid: i64,
    #[serde(default)]
    pub redo: bool,
    #[serde(default = "default_lon_dim")]
    pub x_lon_dim: String,
    #[serde(default = "default_lat_dim")]
    pub y_lat_dim: String,
    #[serde(default = "default_time_dim")]
    pub time_dim: String,
    pub out_dir: String,

    /// Raster variables to aggregate; empty means every gridded variable.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(default = "default_id_col")]
    pub id_col: String,
    /// CRS of the catchment file when it does not declare one (GeoJSON).
    #[serde(default)]
    pub catchment_crs: Option<String>,
    #[serde(default = "default_aorc_crs")]
    pub raster_crs: String,
    #[serde(default)]
    pub netcdf: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub upload: Option<UploadConfig>,
    #[serde(default)]
    pub gpkg: Option<GpkgInput>,
    /// Region of the forcing and hydrofabric buckets; `AWS_REGION` overrides it.
    #[serde(default = "default_aorc_region")]
    pub s3_region: String,
}

fn default_time_dim() -> String {
    "time".to_string()
}

impl ChunkConfig {
    fn default_cvar() -> usize {
        ChunkConfig::default().cvar
    }

    fn default_ctime_max() -> usize {
        ChunkConfig::default().ctime_max
    }

    fn default_cid() -> i64 {
        ChunkConfig::default().cid
    }
}

impl AorcConfig {
    /// Reads and validates an AORC run configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: AorcConfig = serde_yaml::from_str(text).context("parsing AORC config")?;
        config.out_dir = expand_home(&config.out_dir);
        config.basin_url_template = expand_home(&config.basin_url_template);
        config.aorc_year_url_template = expand_home(&config.aorc_year_url_template);
        if let Some(gpkg) = config.gpkg.as_mut() {
            gpkg.path = expand_home(&gpkg.path);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.years.len() != 2 {
            bail!("years must be [start, end], got {:?}", self.years);
        }
        if self.years[0] >= self.years[1] {
            bail!(
                "years must be increasing, got {} to {}",
                self.years[0],
                self.years[1]
            );
        }
        if self.basins.is_empty() && self.gpkg.is_none() {
            bail!("no basins configured");
        }
        self.chunks().validate()
    }

    pub fn chunks(&self) -> ChunkConfig {
        ChunkConfig {
            cvar: self.cvar,
            ctime_max: self.ctime_max,
            cid: self.cid,
        }
    }

    /// `"{start}_to_{end}"`, e.g. `1980_to_2024`.
    pub fn year_str(&self) -> String {
        self.years
            .iter()
            .map(|y| y.to_string())
            .collect::<Vec<_>>()
            .join("_to_")
    }

    /// Years to open; the end year is exclusive.
    pub fn year_range(&self) -> std::ops::Range<i32> {
        self.years[0]..self.years[1]
    }

    pub fn year_url(&self, year: i32) -> String {
        render_template(
            &self.aorc_year_url_template,
            &[("source", &self.aorc_source), ("year", &year.to_string())],
        )
    }

    pub fn basin_url(&self, basin_id: &str) -> String {
        render_template(&self.basin_url_template, &[("basin_id", basin_id)])
    }

    /// True when the basin list asks for every basin under the template's prefix.
    pub fn wants_all_basins(&self) -> bool {
        self.basins
            .iter()
            .any(|b| matches!(b, BasinEntry::Text(s) if s == "all"))
    }

    pub fn basin_ids(&self) -> Vec<String> {
        self.basins.iter().map(BasinEntry::as_id).collect()
    }

    /// Output directory for this year range: `{out_dir}/{year_str}`.
    pub fn run_dir(&self) -> PathBuf {
        Path::new(&self.out_dir).join(self.year_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HrrrConfig {
    pub time_bgn: NaiveDate,
    pub time_end: NaiveDate,
    pub level_vars_anl: Vec<String>,
    #[serde(default)]
    pub level_vars_fcst: Vec<String>,
    #[serde(default)]
    pub fcst_hr: u32,
    #[serde(default = "default_bucket_subf")]
    pub bucket_subf: String,
    #[serde(default = "default_drop_vars")]
    pub drop_vars: Vec<String>,
    pub basin_url_template: String,
    pub basins: Vec<BasinEntry>,
    #[serde(default = "default_hrrr_x_dim")]
    pub x_lon_dim: String,
    #[serde(default = "default_hrrr_y_dim")]
    pub y_lat_dim: String,
    pub out_dir: String,
    #[serde(default = "ChunkConfig::default_cvar")]
    pub cvar: usize,
    #[serde(default = "ChunkConfig::default_ctime_max")]
    pub ctime_max: usize,
    #[serde(default = "ChunkConfig::default_cid")]
    pub cid: i64,
    #[serde(default)]
    pub redo: bool,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(default = "default_id_col")]
    pub id_col: String,
    #[serde(default)]
    pub catchment_crs: Option<String>,
    #[serde(default = "default_hrrr_crs")]
    pub raster_crs: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_hrrr_region")]
    pub s3_region: String,
}

impl HrrrConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: HrrrConfig = serde_yaml::from_str(text).context("parsing HRRR config")?;
        config.out_dir = expand_home(&config.out_dir);
        config.basin_url_template = expand_home(&config.basin_url_template);
        if config.time_end < config.time_bgn {
            bail!(
                "time_end {} is before time_bgn {}",
                config.time_end,
                config.time_bgn
            );
        }
        if config.fcst_hr > 23 {
            bail!(
                "forecast subsetting supports forecast hours 0 to 23, got {}",
                config.fcst_hr
            );
        }
        if config.basins.is_empty() {
            bail!("no basins configured");
        }
        config.chunks().validate()?;
        Ok(config)
    }

    pub fn chunks(&self) -> ChunkConfig {
        ChunkConfig {
            cvar: self.cvar,
            ctime_max: self.ctime_max,
            cid: self.cid,
        }
    }

    pub fn basin_url(&self, basin_id: &str) -> String {
        render_template(&self.basin_url_template, &[("basin_id", basin_id)])
    }

    pub fn basin_ids(&self) -> Vec<String> {
        self.basins.iter().map(BasinEntry::as_id).collect()
    }
}

/// Replaces every `{key}` in `template` with its value.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Expands `{home_dir}` to the current user's home directory.
pub fn expand_home(path: &str) -> String {
    if !path.contains("{home_dir}") {
        return path.to_string();
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    render_template(path, &[("home_dir", &home)])
}

#[cfg(test)]
mod tests {
    use super::*;

    const AORC_YAML: &str = r#"
aorc_source: noaa-nws-aorc-v1-1-1km
aorc_year_url_template: 's3://{source}/{year}.zarr'
basin_url_template: 's3://lynker-spatial/hydrofabric/v20.1/camels/Gage_{basin_id}.gpkg'
basins: [1022500, '01031500']
years: [1980, 2024]
cvar: 8
ctime_max: 120
cid: -1
redo: False
x_lon_dim: longitude
y_lat_dim: latitude
out_dir: '/data/aorc'
"#;

    #[test]
    fn test_parse_aorc_config() {
        let config = AorcConfig::from_yaml(AORC_YAML).unwrap();
        assert_eq!(config.basin_ids(), vec!["1022500", "01031500"]);
        assert_eq!(config.year_str(), "1980_to_2024");
        assert_eq!(config.year_range(), 1980..2024);
        assert_eq!(
            config.year_url(1999),
            "s3://noaa-nws-aorc-v1-1-1km/1999.zarr"
        );
        assert_eq!(
            config.basin_url("1022500"),
            "s3://lynker-spatial/hydrofabric/v20.1/camels/Gage_1022500.gpkg"
        );
        assert_eq!(config.layer, "divides");
        assert_eq!(config.id_col, "divide_id");
        assert_eq!(config.retry, RetryConfig::default());
        assert!(!config.wants_all_basins());
        assert_eq!(config.run_dir(), PathBuf::from("/data/aorc/1980_to_2024"));
        assert_eq!(config.s3_region, "us-east-1");
        assert!(config.gpkg.is_none());
    }

    #[test]
    fn test_single_gpkg_input() {
        let yaml = AORC_YAML.replace("basins: [1022500, '01031500']", "basins: []")
            + "gpkg:\n  path: '/data/Gage_01013500.gpkg'\n";
        let config = AorcConfig::from_yaml(&yaml).unwrap();
        let gpkg = config.gpkg.unwrap();
        assert_eq!(gpkg.name(), "Gage_01013500");
        assert_eq!(gpkg.layer(), "Gage_01013500");
        assert_eq!(gpkg.id_col, "GAGE_ID");
    }

    #[test]
    fn test_empty_basins_without_gpkg_rejected() {
        let yaml = AORC_YAML.replace("[1022500, '01031500']", "[]");
        assert!(AorcConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_aorc_config_rejects_reversed_years() {
        let yaml = AORC_YAML.replace("[1980, 2024]", "[2024, 1980]");
        assert!(AorcConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_aorc_config_rejects_zero_cid() {
        let yaml = AORC_YAML.replace("cid: -1", "cid: 0");
        assert!(AorcConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_all_basins() {
        let yaml = AORC_YAML.replace("[1022500, '01031500']", "['all']");
        let config = AorcConfig::from_yaml(&yaml).unwrap();
        assert!(config.wants_all_basins());
    }

    #[test]
    fn test_parse_hrrr_config() {
        let yaml = r#"
time_bgn: 2018-08-13
time_end: 2018-08-15
level_vars_anl: ['2m_above_ground/TMP', 'surface/PRES']
level_vars_fcst: ['surface/APCP_1hr_acc_fcst']
basin_url_template: '/data/Gage_{basin_id}.gpkg'
basins: [1022500]
out_dir: '/data/hrrr'
"#;
        let config = HrrrConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.fcst_hr, 0);
        assert_eq!(config.bucket_subf, "s3://hrrrzarr/sfc");
        assert_eq!(config.raster_crs, "hrrr");
        assert_eq!(config.y_lat_dim, "projection_y_coordinate");
        assert!(config.drop_vars.contains(&"forecast_period".to_string()));
        assert_eq!(config.chunks(), ChunkConfig::default());
        assert_eq!(config.s3_region, "us-west-1");
    }

    #[test]
    fn test_hrrr_config_rejects_large_forecast_hour() {
        let yaml = r#"
time_bgn: 2018-08-13
time_end: 2018-08-15
level_vars_anl: ['2m_above_ground/TMP']
fcst_hr: 24
basin_url_template: '/data/Gage_{basin_id}.gpkg'
basins: [1022500]
out_dir: '/data/hrrr'
"#;
        assert!(HrrrConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            render_template("{a}/{b}/{a}", &[("a", "x"), ("b", "y")]),
            "x/y/x"
        );
    }

    #[test]
    fn test_chunk_sizes() {
        let chunks = ChunkConfig::default();
        assert_eq!(chunks.ctime(24), 24);
        assert_eq!(chunks.ctime(1000), 120);
        assert_eq!(chunks.catchments_per_task(42), 42);
        let chunks = ChunkConfig { cid: 10, ..chunks };
        assert_eq!(chunks.catchments_per_task(42), 10);
    }
}
