//! Gridded forcing access backed by zarr stores.
//!
//! A [`ZarrStore`] is a read-only storage root, either a local directory or an
//! `s3://bucket/prefix` location read anonymously. [`ZarrDataset`] exposes the
//! `(time, y, x)` variables of one store through [`RasterSource`], the trait the
//! aggregation reads blocks from.
//!
//! Reads are synchronous. S3 stores drive their async client with a captured
//! tokio runtime handle, so reads must happen off the async worker threads
//! (`spawn_blocking` or rayon).

use anyhow::{Context, Result, anyhow, bail};
use ndarray::{Array3, Array4, s};
use object_store::aws::AmazonS3Builder;
use serde_json::{Map, Value};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;
use zarrs_object_store::AsyncObjectStore;
use zarrs_storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};
use zarrs_storage::{ReadableStorage, ReadableStorageTraits, StoreKey};

use crate::fetch::s3::S3Location;
use crate::grid::{Axis, GridWindow, RasterGrid};
use crate::time::decode_cf_times;

pub type ZarrArray = Array<dyn ReadableStorageTraits>;

/// A source of `[variable, time, y, x]` blocks over a fixed grid.
pub trait RasterSource: Send + Sync {
    fn grid(&self) -> &RasterGrid;

    /// Reads variables `vars` and time steps `times` over `window`.
    fn read_block(
        &self,
        vars: Range<usize>,
        times: Range<usize>,
        window: &GridWindow,
    ) -> Result<Array4<f32>>;
}

/// Drives async object-store requests from synchronous zarr reads.
#[derive(Clone)]
pub struct HandleBlockOn(Handle);

impl AsyncToSyncBlockOn for HandleBlockOn {
    fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
        self.0.block_on(future)
    }
}

#[derive(Clone)]
pub struct ZarrStore {
    storage: ReadableStorage,
    root: String,
    location: String,
}

impl std::fmt::Debug for ZarrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrStore")
            .field("location", &self.location)
            .finish()
    }
}

impl ZarrStore {
    /// Opens `url`: a local directory or an `s3://bucket/prefix` location.
    ///
    /// S3 access is unsigned; `region` selects the bucket's endpoint. Must be
    /// called from within a tokio runtime when `url` is remote.
    pub fn open(url: &str, region: &str) -> Result<Self> {
        if url.starts_with("s3://") {
            let location = S3Location::parse(url)?;
            let handle = Handle::try_current()
                .map_err(|_| anyhow!("opening {url} requires a tokio runtime"))?;
            Self::s3(&location, region, handle)
        } else {
            Self::local(Path::new(url))
        }
    }

    pub fn local(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            bail!("zarr store {} does not exist", path.display());
        }
        let store = FilesystemStore::new(path)
            .with_context(|| format!("opening zarr store {}", path.display()))?;
        Ok(Self {
            storage: Arc::new(store),
            root: String::new(),
            location: path.display().to_string(),
        })
    }

    pub fn s3(location: &S3Location, region: &str, handle: Handle) -> Result<Self> {
        let s3 = AmazonS3Builder::new()
            .with_bucket_name(&location.bucket)
            .with_region(region)
            .with_skip_signature(true)
            .build()
            .with_context(|| format!("building S3 client for {}", location))?;
        let async_store = Arc::new(AsyncObjectStore::new(s3));
        let storage = AsyncToSyncStorageAdapter::new(async_store, HandleBlockOn(handle));
        Ok(Self {
            storage: Arc::new(storage),
            root: node_path("", &location.key),
            location: location.to_string(),
        })
    }

    /// A store rooted at `sub` below this one, sharing the same connection.
    pub fn child(&self, sub: &str) -> ZarrStore {
        ZarrStore {
            storage: self.storage.clone(),
            root: node_path(&self.root, sub),
            location: format!("{}/{}", self.location.trim_end_matches('/'), sub.trim_matches('/')),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn array(&self, name: &str) -> Result<ZarrArray> {
        let path = node_path(&self.root, name);
        Array::open(self.storage.clone(), &path)
            .with_context(|| format!("opening array '{name}' in {}", self.location))
    }

    /// Raw bytes of a metadata object such as `.zmetadata`, if present.
    pub fn get(&self, name: &str) -> Result<Option<bytes::Bytes>> {
        let key = node_path(&self.root, name);
        let key = StoreKey::new(key.trim_start_matches('/'))
            .map_err(|e| anyhow!("invalid store key '{name}': {e}"))?;
        self.storage
            .get(&key)
            .with_context(|| format!("reading {name} from {}", self.location))
    }

    /// Names of the arrays listed in consolidated metadata (`.zmetadata`).
    ///
    /// Each entry carries the array shape and its `_ARRAY_DIMENSIONS`, if any.
    pub fn consolidated_arrays(&self) -> Result<Option<Vec<ArrayListing>>> {
        let Some(raw) = self.get(".zmetadata")? else {
            return Ok(None);
        };
        let doc: Value = serde_json::from_slice(&raw).context("parsing .zmetadata")?;
        let metadata = doc
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!(".zmetadata has no 'metadata' object"))?;

        let mut listings = Vec::new();
        for (key, value) in metadata {
            let Some(name) = key.strip_suffix("/.zarray") else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            let shape = value
                .get("shape")
                .and_then(Value::as_array)
                .map(|dims| dims.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            let dims = metadata
                .get(&format!("{name}/.zattrs"))
                .and_then(Value::as_object)
                .and_then(array_dimensions);
            listings.push(ArrayListing {
                name: name.to_string(),
                shape,
                dims,
            });
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(listings))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayListing {
    pub name: String,
    pub shape: Vec<u64>,
    pub dims: Option<Vec<String>>,
}

fn node_path(root: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    let root = root.trim_end_matches('/');
    match (root.is_empty(), name.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{name}"),
        (false, true) => root.to_string(),
        (false, false) => format!("{root}/{name}"),
    }
}

fn array_dimensions(attrs: &Map<String, Value>) -> Option<Vec<String>> {
    attrs.get("_ARRAY_DIMENSIONS").and_then(Value::as_array).map(|dims| {
        dims.iter()
            .filter_map(|d| d.as_str().map(str::to_string))
            .collect()
    })
}

/// Reads `subset` of a numeric array as `f64`.
pub fn read_f64(array: &ZarrArray, subset: &ArraySubset) -> Result<Vec<f64>> {
    Ok(match array.data_type() {
        DataType::Float32 => array
            .retrieve_array_subset_elements::<f32>(subset)?
            .into_iter()
            .map(f64::from)
            .collect(),
        DataType::Float64 => array.retrieve_array_subset_elements::<f64>(subset)?,
        DataType::Int16 => array
            .retrieve_array_subset_elements::<i16>(subset)?
            .into_iter()
            .map(f64::from)
            .collect(),
        DataType::Int32 => array
            .retrieve_array_subset_elements::<i32>(subset)?
            .into_iter()
            .map(f64::from)
            .collect(),
        DataType::Int64 => array
            .retrieve_array_subset_elements::<i64>(subset)?
            .into_iter()
            .map(|v| v as f64)
            .collect(),
        other => bail!("unsupported zarr data type {other:?}"),
    })
}

/// Reads a whole 1-D (or scalar) coordinate array.
pub fn read_coordinate(array: &ZarrArray) -> Result<Vec<f64>> {
    read_f64(array, &array.subset_all())
}

/// Reads a time coordinate and decodes it with its CF `units` attribute.
pub fn read_cf_times(array: &ZarrArray) -> Result<Vec<chrono::DateTime<chrono::Utc>>> {
    let units = array
        .attributes()
        .get("units")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("time coordinate has no 'units' attribute"))?;
    decode_cf_times(&read_coordinate(array)?, units)
}

/// CF packing and missing-value attributes of a variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfDecode {
    pub scale_factor: f64,
    pub add_offset: f64,
    pub missing: [Option<f64>; 2],
}

impl Default for CfDecode {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            add_offset: 0.0,
            missing: [None, None],
        }
    }
}

impl CfDecode {
    pub fn from_array(array: &ZarrArray) -> Self {
        let attrs = array.attributes();
        let number = |key: &str| attrs.get(key).and_then(Value::as_f64);
        let scale_factor = number("scale_factor");
        let add_offset = number("add_offset");
        let mut fill = number("_FillValue");
        // Packed integers keep their sentinel in the array's own fill value.
        if fill.is_none() && (scale_factor.is_some() || add_offset.is_some()) {
            fill = integer_fill_value(array);
        }
        Self {
            scale_factor: scale_factor.unwrap_or(1.0),
            add_offset: add_offset.unwrap_or(0.0),
            missing: [fill, number("missing_value")],
        }
    }

    pub fn apply(&self, raw: f64) -> f32 {
        if raw.is_nan() || self.missing.iter().flatten().any(|m| *m == raw) {
            return f32::NAN;
        }
        (raw * self.scale_factor + self.add_offset) as f32
    }
}

fn integer_fill_value(array: &ZarrArray) -> Option<f64> {
    let bytes = array.fill_value().as_ne_bytes();
    match array.data_type() {
        DataType::Int16 => bytes.try_into().ok().map(|b| f64::from(i16::from_ne_bytes(b))),
        DataType::Int32 => bytes.try_into().ok().map(|b| f64::from(i32::from_ne_bytes(b))),
        _ => None,
    }
}

/// A single gridded variable with its decoding attributes.
pub struct ZarrVariable {
    pub name: String,
    array: ZarrArray,
    decode: CfDecode,
}

impl ZarrVariable {
    pub fn open(store: &ZarrStore, path: &str, name: &str) -> Result<Self> {
        let array = store.array(path)?;
        let decode = CfDecode::from_array(&array);
        Ok(Self {
            name: name.to_string(),
            array,
            decode,
        })
    }

    pub fn shape(&self) -> &[u64] {
        self.array.shape()
    }

    pub fn dims(&self) -> Option<Vec<String>> {
        array_dimensions(self.array.attributes())
    }

    /// Reads `window` of a `(y, x)` array, or of time steps `times` of a
    /// `(time, y, x)` array. Values come back decoded, in row-major order.
    pub fn read(&self, times: Option<Range<usize>>, window: &GridWindow) -> Result<Vec<f32>> {
        let yx = [to_u64(&window.y), to_u64(&window.x)];
        let ranges: Vec<Range<u64>> = match (self.array.shape().len(), times) {
            (2, None) => yx.to_vec(),
            (3, Some(t)) => vec![to_u64(&t), yx[0].clone(), yx[1].clone()],
            (3, None) => bail!("variable '{}' has a time dimension", self.name),
            (n, _) => bail!("variable '{}' has {n} dimensions", self.name),
        };
        let subset = ArraySubset::new_with_ranges(&ranges);
        let raw = read_f64(&self.array, &subset)
            .with_context(|| format!("reading '{}'", self.name))?;
        Ok(raw.into_iter().map(|v| self.decode.apply(v)).collect())
    }
}

fn to_u64(r: &Range<usize>) -> Range<u64> {
    r.start as u64..r.end as u64
}

/// Coordinate names of a `(time, y, x)` dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDims {
    pub time: String,
    pub y: String,
    pub x: String,
}

impl DatasetDims {
    pub fn new(time: &str, y: &str, x: &str) -> Self {
        Self {
            time: time.to_string(),
            y: y.to_string(),
            x: x.to_string(),
        }
    }

    fn names(&self) -> [&str; 3] {
        [&self.time, &self.y, &self.x]
    }
}

/// The `(time, y, x)` variables of one zarr store.
pub struct ZarrDataset {
    grid: RasterGrid,
    variables: Vec<ZarrVariable>,
    location: String,
}

impl ZarrDataset {
    /// Opens `variables` from `store`; an empty list selects every array of
    /// the store's consolidated metadata that is laid out as `(time, y, x)`.
    pub fn open(store: &ZarrStore, variables: &[String], dims: &DatasetDims) -> Result<Self> {
        let x = Axis::new(read_coordinate(&store.array(&dims.x)?)?)
            .with_context(|| format!("x coordinate '{}'", dims.x))?;
        let y = Axis::new(read_coordinate(&store.array(&dims.y)?)?)
            .with_context(|| format!("y coordinate '{}'", dims.y))?;
        let times = read_cf_times(&store.array(&dims.time)?)
            .with_context(|| format!("time coordinate in {}", store.location()))?;

        let names = if variables.is_empty() {
            discover_variables(store, dims)?
        } else {
            variables.to_vec()
        };

        let expected = [times.len() as u64, y.len() as u64, x.len() as u64];
        let mut opened = Vec::with_capacity(names.len());
        for name in &names {
            let var = ZarrVariable::open(store, name, name)?;
            if var.shape() != expected {
                bail!(
                    "variable '{name}' has shape {:?}, expected {:?}",
                    var.shape(),
                    expected
                );
            }
            if let Some(var_dims) = var.dims() {
                if var_dims != dims.names() {
                    bail!("variable '{name}' has dimensions {var_dims:?}, expected {:?}", dims.names());
                }
            }
            opened.push(var);
        }

        debug!(
            store = store.location(),
            variables = names.len(),
            times = times.len(),
            ny = y.len(),
            nx = x.len(),
            "Opened zarr dataset"
        );

        Ok(Self {
            grid: RasterGrid {
                x,
                y,
                times,
                variables: names,
            },
            variables: opened,
            location: store.location().to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

fn discover_variables(store: &ZarrStore, dims: &DatasetDims) -> Result<Vec<String>> {
    let listings = store.consolidated_arrays()?.ok_or_else(|| {
        anyhow!(
            "{} has no consolidated metadata; list the variables explicitly",
            store.location()
        )
    })?;
    let names: Vec<String> = listings
        .into_iter()
        .filter(|l| l.shape.len() == 3 && !dims.names().contains(&l.name.as_str()))
        .filter(|l| l.dims.as_ref().is_none_or(|d| d == &dims.names()))
        .map(|l| l.name)
        .collect();
    if names.is_empty() {
        bail!("no (time, y, x) variables found in {}", store.location());
    }
    Ok(names)
}

impl RasterSource for ZarrDataset {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_block(
        &self,
        vars: Range<usize>,
        times: Range<usize>,
        window: &GridWindow,
    ) -> Result<Array4<f32>> {
        let (ny, nx) = window.shape();
        let mut block = Array4::<f32>::zeros((vars.len(), times.len(), ny, nx));
        for (i, var) in self.variables[vars].iter().enumerate() {
            let values = var.read(Some(times.clone()), window)?;
            let cube = Array3::from_shape_vec((times.len(), ny, nx), values)?;
            block.slice_mut(s![i, .., .., ..]).assign(&cube);
        }
        Ok(block)
    }
}

/// Several datasets concatenated along time, e.g. one AORC store per year.
pub struct StackedDataset {
    grid: RasterGrid,
    parts: Vec<Box<dyn RasterSource>>,
    offsets: Vec<usize>,
}

impl StackedDataset {
    pub fn new(parts: Vec<Box<dyn RasterSource>>) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| anyhow!("no datasets to stack"))?
            .grid()
            .clone();
        let mut times = Vec::new();
        let mut offsets = Vec::with_capacity(parts.len());
        for part in &parts {
            let grid = part.grid();
            if grid.x != first.x || grid.y != first.y {
                bail!("stacked datasets do not share a grid");
            }
            if grid.variables != first.variables {
                bail!(
                    "stacked datasets have different variables: {:?} vs {:?}",
                    grid.variables,
                    first.variables
                );
            }
            if let (Some(last), Some(next)) = (times.last(), grid.times.first()) {
                if next <= last {
                    bail!("stacked datasets overlap or are out of order at {next}");
                }
            }
            offsets.push(times.len());
            times.extend_from_slice(&grid.times);
        }
        Ok(Self {
            grid: RasterGrid { times, ..first },
            parts,
            offsets,
        })
    }
}

impl RasterSource for StackedDataset {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_block(
        &self,
        vars: Range<usize>,
        times: Range<usize>,
        window: &GridWindow,
    ) -> Result<Array4<f32>> {
        let (ny, nx) = window.shape();
        let mut block = Array4::<f32>::zeros((vars.len(), times.len(), ny, nx));
        for (part, &offset) in self.parts.iter().zip(&self.offsets) {
            let len = part.grid().times.len();
            let start = times.start.max(offset);
            let end = times.end.min(offset + len);
            if start >= end {
                continue;
            }
            let piece = part.read_block(vars.clone(), start - offset..end - offset, window)?;
            block
                .slice_mut(s![.., start - times.start..end - times.start, .., ..])
                .assign(&piece);
        }
        Ok(block)
    }
}

/// A fully loaded `[variable, time, y, x]` cube.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    grid: RasterGrid,
    data: Array4<f32>,
}

impl MemoryDataset {
    pub fn new(grid: RasterGrid, data: Array4<f32>) -> Result<Self> {
        let expected = (grid.variables.len(), grid.times.len(), grid.ny(), grid.nx());
        if data.dim() != expected {
            bail!("data shape {:?} does not match grid {:?}", data.dim(), expected);
        }
        Ok(Self { grid, data })
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }
}

impl RasterSource for MemoryDataset {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_block(
        &self,
        vars: Range<usize>,
        times: Range<usize>,
        window: &GridWindow,
    ) -> Result<Array4<f32>> {
        if vars.end > self.data.dim().0 || times.end > self.data.dim().1 {
            bail!("block {vars:?} x {times:?} is outside the dataset");
        }
        Ok(self
            .data
            .slice(s![vars, times, window.y.clone(), window.x.clone()])
            .to_owned())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use zarrs::array::{ArrayBuilder, Element, FillValue};

    pub fn write_array<T: Element>(
        root: &Path,
        name: &str,
        shape: Vec<u64>,
        data_type: DataType,
        fill: FillValue,
        attrs: Map<String, Value>,
        data: &[T],
    ) {
        let store = Arc::new(FilesystemStore::new(root).unwrap());
        let array = ArrayBuilder::new(shape.clone(), data_type, shape.clone().try_into().unwrap(), fill)
            .attributes(attrs)
            .build(store, &format!("/{name}"))
            .unwrap();
        array.store_metadata().unwrap();
        let subset = ArraySubset::new_with_shape(shape);
        array.store_array_subset_elements(&subset, data).unwrap();
    }

    pub fn attrs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Writes a `(time, y, x)` store with coordinates `longitude`/`latitude`/`time`
    /// (hours since `epoch`) and one float32 array per entry of `vars`.
    pub fn write_dataset(
        root: &Path,
        xs: &[f64],
        ys: &[f64],
        hours: &[i64],
        epoch: &str,
        vars: &[(&str, Vec<f32>)],
    ) {
        std::fs::create_dir_all(root).unwrap();
        write_array(
            root,
            "longitude",
            vec![xs.len() as u64],
            DataType::Float64,
            FillValue::from(f64::NAN),
            attrs(&[("_ARRAY_DIMENSIONS", serde_json::json!(["longitude"]))]),
            xs,
        );
        write_array(
            root,
            "latitude",
            vec![ys.len() as u64],
            DataType::Float64,
            FillValue::from(f64::NAN),
            attrs(&[("_ARRAY_DIMENSIONS", serde_json::json!(["latitude"]))]),
            ys,
        );
        write_array(
            root,
            "time",
            vec![hours.len() as u64],
            DataType::Int64,
            FillValue::from(0i64),
            attrs(&[("units", serde_json::json!(format!("hours since {epoch}")))]),
            hours,
        );
        for (name, values) in vars {
            write_array(
                root,
                name,
                vec![hours.len() as u64, ys.len() as u64, xs.len() as u64],
                DataType::Float32,
                FillValue::from(f32::NAN),
                attrs(&[(
                    "_ARRAY_DIMENSIONS",
                    serde_json::json!(["time", "latitude", "longitude"]),
                )]),
                values,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::{TimeZone, Utc};
    use zarrs::array::FillValue;

    fn dims() -> DatasetDims {
        DatasetDims::new("time", "latitude", "longitude")
    }

    /// value = 100 * t + 10 * row + col
    fn ramp(nt: usize, ny: usize, nx: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(nt * ny * nx);
        for t in 0..nt {
            for r in 0..ny {
                for c in 0..nx {
                    out.push((100 * t + 10 * r + c) as f32);
                }
            }
        }
        out
    }

    #[test]
    fn test_node_path() {
        assert_eq!(node_path("", "time"), "/time");
        assert_eq!(node_path("/sfc/run.zarr", "/surface/TMP/"), "/sfc/run.zarr/surface/TMP");
        assert_eq!(node_path("", ""), "/");
    }

    #[test]
    fn test_open_and_read_window() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(
            dir.path(),
            &[0.5, 1.5, 2.5],
            &[1.5, 0.5],
            &[0, 1],
            "2000-01-01 00:00:00",
            &[("TMP", ramp(2, 2, 3))],
        );
        let store = ZarrStore::local(dir.path()).unwrap();
        let ds = ZarrDataset::open(&store, &["TMP".to_string()], &dims()).unwrap();
        let grid = ds.grid();
        assert_eq!(grid.times[1], Utc.with_ymd_and_hms(2000, 1, 1, 1, 0, 0).unwrap());
        assert!(grid.y.is_descending());

        let window = GridWindow { y: 1..2, x: 1..3 };
        let block = ds.read_block(0..1, 0..2, &window).unwrap();
        assert_eq!(block.dim(), (1, 2, 1, 2));
        assert_eq!(block[[0, 0, 0, 0]], 11.0);
        assert_eq!(block[[0, 1, 0, 1]], 112.0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(
            dir.path(),
            &[0.5, 1.5],
            &[0.5],
            &[0],
            "2000-01-01",
            &[],
        );
        write_array(
            dir.path(),
            "BAD",
            vec![1, 2, 3],
            DataType::Float32,
            FillValue::from(f32::NAN),
            Map::new(),
            &[0f32; 6],
        );
        let store = ZarrStore::local(dir.path()).unwrap();
        assert!(ZarrDataset::open(&store, &["BAD".to_string()], &dims()).is_err());
    }

    #[test]
    fn test_cf_decode_packed_values() {
        let decode = CfDecode {
            scale_factor: 0.1,
            add_offset: 273.15,
            missing: [Some(-9999.0), None],
        };
        assert!((decode.apply(10.0) - 274.15).abs() < 1e-4);
        assert!(decode.apply(-9999.0).is_nan());
        assert!(decode.apply(f64::NAN).is_nan());
    }

    #[test]
    fn test_stacked_dataset_spans_parts() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_dataset(a.path(), &[0.5, 1.5], &[0.5], &[0, 1], "2000-01-01", &[("P", vec![1.0, 1.0, 2.0, 2.0])]);
        write_dataset(b.path(), &[0.5, 1.5], &[0.5], &[2, 3], "2000-01-01", &[("P", vec![3.0, 3.0, 4.0, 4.0])]);
        let parts: Vec<Box<dyn RasterSource>> = vec![
            Box::new(ZarrDataset::open(&ZarrStore::local(a.path()).unwrap(), &["P".into()], &dims()).unwrap()),
            Box::new(ZarrDataset::open(&ZarrStore::local(b.path()).unwrap(), &["P".into()], &dims()).unwrap()),
        ];
        let stacked = StackedDataset::new(parts).unwrap();
        assert_eq!(stacked.grid().times.len(), 4);

        let block = stacked
            .read_block(0..1, 1..3, &GridWindow::full(1, 2))
            .unwrap();
        assert_eq!(block[[0, 0, 0, 0]], 2.0);
        assert_eq!(block[[0, 1, 0, 1]], 3.0);
    }

    #[test]
    fn test_stacked_dataset_rejects_overlap() {
        let grid = RasterGrid {
            x: Axis::new(vec![0.5]).unwrap(),
            y: Axis::new(vec![0.5]).unwrap(),
            times: vec![Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()],
            variables: vec!["P".into()],
        };
        let part = || -> Box<dyn RasterSource> {
            Box::new(MemoryDataset::new(grid.clone(), Array4::zeros((1, 1, 1, 1))).unwrap())
        };
        assert!(StackedDataset::new(vec![part(), part()]).is_err());
    }

    #[test]
    fn test_memory_dataset_shape_checked() {
        let grid = RasterGrid {
            x: Axis::new(vec![0.5, 1.5]).unwrap(),
            y: Axis::new(vec![0.5]).unwrap(),
            times: vec![],
            variables: vec!["P".into()],
        };
        assert!(MemoryDataset::new(grid, Array4::zeros((1, 1, 1, 2))).is_err());
    }
}
