//! # Spatial Subsetting Module
//!
//! Cuts a raw NetCDF file down to one bounding box and writes the result as a
//! new file. Every variable that spans a horizontal dimension is reduced along
//! that dimension; everything else (time axis, bounds, scalars) is copied
//! as-is together with all variable and global attributes. Numeric, `char` and
//! `string` variables are copied; compound, enum, opaque and vlen variables are
//! skipped with a warning.
//!
//! ## Grid kinds
//!
//! - **Rectilinear**: `lat` and `lon` are 1-D coordinate variables. Each axis is
//!   selected independently. When both share a single dimension (unstructured
//!   point lists) a point is kept only if both coordinates fall inside.
//! - **Curvilinear**: `lat` and `lon` are 2-D over `(y, x)`. The output is the
//!   smallest index rectangle containing every cell inside the box; cells of
//!   that rectangle outside the box are kept unmasked.
//!
//! All bounds are inclusive. Longitudes also match when shifted by ±360°.

use indexmap::IndexMap;
use log::{debug, info, warn};
use ndarray::{ArrayD, Axis, Dimension, Ix2, IxDyn};
use netcdf::types::{FloatType, IntType, NcVariableType};
use netcdf::{Extents, NcTypeDescriptor};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::BoundingBox;
use crate::error::{Classify, ErrorKind};
use crate::fetch::PART_SUFFIX;

pub const DEFAULT_LAT_NAME: &str = "lat";
pub const DEFAULT_LON_NAME: &str = "lon";

#[derive(Error, Debug)]
pub enum SubsetError {
    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Coordinate '{0}' not found in file")]
    MissingCoordinate(String),

    #[error("Variable '{0}' not found in file")]
    MissingVariable(String),

    #[error("Coordinate '{name}' has {ndim} dimensions; expected 1 or 2")]
    UnsupportedGrid { name: String, ndim: usize },

    #[error("No grid cells fall inside lat [{}, {}] lon [{}, {}]", .0.min_lat, .0.max_lat, .0.min_lon, .0.max_lon)]
    EmptySelection(BoundingBox),

    #[error("NetCDF error while {context}: {source}")]
    Netcdf {
        context: String,
        #[source]
        source: netcdf::Error,
    },

    #[error("Unexpected array shape for '{name}': {reason}")]
    Shape { name: String, reason: String },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for SubsetError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Format
    }
}

pub type SubsetResult<T> = Result<T, SubsetError>;

trait NetcdfContext<T> {
    fn context<F: FnOnce() -> String>(self, f: F) -> SubsetResult<T>;
}

impl<T> NetcdfContext<T> for Result<T, netcdf::Error> {
    fn context<F: FnOnce() -> String>(self, f: F) -> SubsetResult<T> {
        self.map_err(|source| SubsetError::Netcdf {
            context: f(),
            source,
        })
    }
}

/// Indices to keep, per dimension name. Dimensions not listed are kept whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection(pub IndexMap<String, Vec<usize>>);

impl Selection {
    pub fn indices(&self, dim: &str) -> Option<&[usize]> {
        self.0.get(dim).map(Vec::as_slice)
    }

    /// Number of selected horizontal cells.
    pub fn cell_count(&self) -> usize {
        self.0.values().map(Vec::len).product()
    }
}

/// Horizontal coordinate geometry of one file.
#[derive(Debug, Clone)]
pub enum SpatialSelector {
    Rectilinear {
        lat_dim: String,
        lon_dim: String,
        lat: Vec<f64>,
        lon: Vec<f64>,
    },
    Curvilinear {
        y_dim: String,
        x_dim: String,
        lat: ndarray::Array2<f64>,
        lon: ndarray::Array2<f64>,
    },
}

impl SpatialSelector {
    /// Inspects the coordinate variables and picks the matching grid kind.
    pub fn detect(file: &netcdf::File, lat_name: &str, lon_name: &str) -> SubsetResult<Self> {
        let lat_var = file
            .variable(lat_name)
            .ok_or_else(|| SubsetError::MissingCoordinate(lat_name.to_string()))?;
        let lon_var = file
            .variable(lon_name)
            .ok_or_else(|| SubsetError::MissingCoordinate(lon_name.to_string()))?;

        let lat_dims = dimension_names(&lat_var);
        let lon_dims = dimension_names(&lon_var);

        match (lat_dims.len(), lon_dims.len()) {
            (1, 1) => Ok(SpatialSelector::Rectilinear {
                lat: lat_var.get_values::<f64, _>(..).context(|| format!("reading '{lat_name}'"))?,
                lon: lon_var.get_values::<f64, _>(..).context(|| format!("reading '{lon_name}'"))?,
                lat_dim: lat_dims[0].clone(),
                lon_dim: lon_dims[0].clone(),
            }),
            (2, 2) if lat_dims == lon_dims => Ok(SpatialSelector::Curvilinear {
                lat: read_2d(&lat_var, lat_name)?,
                lon: read_2d(&lon_var, lon_name)?,
                y_dim: lat_dims[0].clone(),
                x_dim: lat_dims[1].clone(),
            }),
            (1 | 2, 1 | 2) => Err(SubsetError::Shape {
                name: lon_name.to_string(),
                reason: format!("dimensions {lon_dims:?} do not match '{lat_name}' dimensions {lat_dims:?}"),
            }),
            (1 | 2, n) => Err(SubsetError::UnsupportedGrid {
                name: lon_name.to_string(),
                ndim: n,
            }),
            (n, _) => Err(SubsetError::UnsupportedGrid {
                name: lat_name.to_string(),
                ndim: n,
            }),
        }
    }

    /// Computes the indices inside `bbox`. An empty result is an error since a
    /// zero-length dimension cannot be written as a fixed dimension.
    pub fn select(&self, bbox: &BoundingBox) -> SubsetResult<Selection> {
        let mut selection = IndexMap::new();
        match self {
            SpatialSelector::Rectilinear {
                lat_dim,
                lon_dim,
                lat,
                lon,
            } if lat_dim == lon_dim => {
                let points: Vec<usize> = lat
                    .iter()
                    .zip(lon)
                    .enumerate()
                    .filter(|(_, (la, lo))| bbox.contains_lat(**la) && bbox.contains_lon(**lo))
                    .map(|(i, _)| i)
                    .collect();
                selection.insert(lat_dim.clone(), points);
            }
            SpatialSelector::Rectilinear {
                lat_dim,
                lon_dim,
                lat,
                lon,
            } => {
                selection.insert(lat_dim.clone(), matching(lat, |v| bbox.contains_lat(v)));
                selection.insert(lon_dim.clone(), matching(lon, |v| bbox.contains_lon(v)));
            }
            SpatialSelector::Curvilinear {
                y_dim,
                x_dim,
                lat,
                lon,
            } => {
                let mut rows: Option<(usize, usize)> = None;
                let mut cols: Option<(usize, usize)> = None;
                for ((j, i), la) in lat.indexed_iter() {
                    if bbox.contains_lat(*la) && bbox.contains_lon(lon[[j, i]]) {
                        rows = Some(rows.map_or((j, j), |(a, b)| (a.min(j), b.max(j))));
                        cols = Some(cols.map_or((i, i), |(a, b)| (a.min(i), b.max(i))));
                    }
                }
                let span = |r: Option<(usize, usize)>| -> Vec<usize> { r.map(|(a, b)| (a..=b).collect()).unwrap_or_default() };
                selection.insert(y_dim.clone(), span(rows));
                selection.insert(x_dim.clone(), span(cols));
            }
        }

        if selection.values().any(Vec::is_empty) {
            return Err(SubsetError::EmptySelection(*bbox));
        }
        Ok(Selection(selection))
    }
}

fn matching(values: &[f64], keep: impl Fn(f64) -> bool) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| keep(**v))
        .map(|(i, _)| i)
        .collect()
}

fn dimension_names(var: &netcdf::Variable) -> Vec<String> {
    var.dimensions().iter().map(|d| d.name()).collect()
}

fn read_2d(var: &netcdf::Variable, name: &str) -> SubsetResult<ndarray::Array2<f64>> {
    var.get::<f64, _>(Extents::All)
        .context(|| format!("reading '{name}'"))?
        .into_dimensionality::<Ix2>()
        .map_err(|e| SubsetError::Shape {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

/// Reads a variable and reduces every selected dimension to its indices.
pub fn read_selected<T>(var: &netcdf::Variable, selection: &Selection) -> SubsetResult<ArrayD<T>>
where
    T: NcTypeDescriptor + Copy,
{
    let name = var.name();
    let mut data = var
        .get::<T, _>(Extents::All)
        .context(|| format!("reading '{name}'"))?;
    for (axis, dim) in dimension_names(var).iter().enumerate() {
        if let Some(indices) = selection.indices(dim) {
            data = data.select(Axis(axis), indices);
        }
    }
    Ok(data)
}

/// Outcome of one subset call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsetOutcome {
    Written { cells: usize },
    AlreadyExists,
}

/// Subset stage as seen by the orchestrator.
pub trait Subset: Send + Sync {
    fn subset(&self, raw: &Path, processed: &Path, bbox: &BoundingBox) -> SubsetResult<SubsetOutcome>;
}

/// NetCDF subsetter keyed on configurable coordinate names.
#[derive(Debug, Clone)]
pub struct NetcdfSubsetter {
    pub lat_name: String,
    pub lon_name: String,
}

impl Default for NetcdfSubsetter {
    fn default() -> Self {
        Self {
            lat_name: DEFAULT_LAT_NAME.to_string(),
            lon_name: DEFAULT_LON_NAME.to_string(),
        }
    }
}

impl NetcdfSubsetter {
    /// Opens `raw` and computes the selection for `bbox` without writing.
    pub fn selection_for(&self, raw: &Path, bbox: &BoundingBox) -> SubsetResult<(netcdf::File, Selection)> {
        let file = netcdf::open(raw).context(|| format!("opening {}", raw.display()))?;
        let selection = SpatialSelector::detect(&file, &self.lat_name, &self.lon_name)?.select(bbox)?;
        Ok((file, selection))
    }

    fn write(&self, raw: &Path, part: &Path, bbox: &BoundingBox) -> SubsetResult<usize> {
        let (src, selection) = self.selection_for(raw, bbox)?;
        debug!("Selection for {}: {:?}", raw.display(), selection.0);

        let mut dst = netcdf::create(part).context(|| format!("creating {}", part.display()))?;

        for attr in src.attributes() {
            let value = attr.value().context(|| format!("reading global attribute '{}'", attr.name()))?;
            dst.add_attribute(attr.name(), value)
                .context(|| format!("writing global attribute '{}'", attr.name()))?;
        }

        for dim in src.dimensions() {
            let name = dim.name();
            let len = selection.indices(&name).map_or(dim.len(), <[usize]>::len);
            dst.add_dimension(&name, len)
                .context(|| format!("adding dimension '{name}'"))?;
        }

        for var in src.variables() {
            match var.vartype() {
                NcVariableType::Int(IntType::U8) => copy_variable::<u8>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::I8) => copy_variable::<i8>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::U16) => copy_variable::<u16>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::I16) => copy_variable::<i16>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::U32) => copy_variable::<u32>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::I32) => copy_variable::<i32>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::U64) => copy_variable::<u64>(&var, &mut dst, &selection)?,
                NcVariableType::Int(IntType::I64) => copy_variable::<i64>(&var, &mut dst, &selection)?,
                NcVariableType::Float(FloatType::F32) => copy_variable::<f32>(&var, &mut dst, &selection)?,
                NcVariableType::Float(FloatType::F64) => copy_variable::<f64>(&var, &mut dst, &selection)?,
                NcVariableType::Char => copy_variable::<NcChar>(&var, &mut dst, &selection)?,
                NcVariableType::String => copy_string_variable(&var, &mut dst, &selection)?,
                other => warn!("Skipping variable '{}' of unsupported type {:?}", var.name(), other),
            }
        }

        Ok(selection.cell_count())
    }
}

/// One element of an NC_CHAR variable.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcChar(pub u8);

// SAFETY: NcChar is a transparent single byte, the storage of NC_CHAR.
unsafe impl NcTypeDescriptor for NcChar {
    fn type_descriptor() -> NcVariableType {
        NcVariableType::Char
    }
}

fn copy_variable<T>(var: &netcdf::Variable, dst: &mut netcdf::FileMut, selection: &Selection) -> SubsetResult<()>
where
    T: NcTypeDescriptor + Copy,
{
    let name = var.name();
    let data = read_selected::<T>(var, selection)?;
    let dims = dimension_names(var);
    let dims: Vec<&str> = dims.iter().map(String::as_str).collect();

    let mut out = dst
        .add_variable::<T>(&name, &dims)
        .context(|| format!("creating variable '{name}'"))?;
    // attributes first: _FillValue cannot be set once data is written
    copy_attributes(var, &mut out)?;
    out.put(data.view(), Extents::All)
        .context(|| format!("writing variable '{name}'"))?;
    Ok(())
}

/// Copies a variable-length string variable element by element.
fn copy_string_variable(var: &netcdf::Variable, dst: &mut netcdf::FileMut, selection: &Selection) -> SubsetResult<()> {
    let name = var.name();
    let dims = dimension_names(var);
    // source indices kept along each axis
    let axes: Vec<Vec<usize>> = var
        .dimensions()
        .iter()
        .zip(&dims)
        .map(|(dim, dim_name)| {
            selection
                .indices(dim_name)
                .map_or_else(|| (0..dim.len()).collect(), <[usize]>::to_vec)
        })
        .collect();
    let dims: Vec<&str> = dims.iter().map(String::as_str).collect();

    let mut out = dst
        .add_string_variable(&name, &dims)
        .context(|| format!("creating variable '{name}'"))?;
    copy_attributes(var, &mut out)?;

    if axes.is_empty() {
        let value = var.get_string(Extents::All).context(|| format!("reading '{name}'"))?;
        out.put_string(&value, Extents::All)
            .context(|| format!("writing variable '{name}'"))?;
        return Ok(());
    }

    let shape: Vec<usize> = axes.iter().map(Vec::len).collect();
    for index in ndarray::indices(IxDyn(&shape)) {
        let target = index.slice();
        let source: Vec<usize> = target.iter().zip(&axes).map(|(&k, axis)| axis[k]).collect();
        let value = var
            .get_string(source.as_slice())
            .context(|| format!("reading '{name}' at {source:?}"))?;
        out.put_string(&value, target)
            .context(|| format!("writing variable '{name}' at {target:?}"))?;
    }
    Ok(())
}

fn copy_attributes(var: &netcdf::Variable, out: &mut netcdf::VariableMut) -> SubsetResult<()> {
    let name = var.name();
    for attr in var.attributes() {
        let value = attr
            .value()
            .context(|| format!("reading attribute '{}' of '{name}'", attr.name()))?;
        out.put_attribute(attr.name(), value)
            .context(|| format!("writing attribute '{}' of '{name}'", attr.name()))?;
    }
    Ok(())
}

impl Subset for NetcdfSubsetter {
    fn subset(&self, raw: &Path, processed: &Path, bbox: &BoundingBox) -> SubsetResult<SubsetOutcome> {
        let display = processed.display();
        if processed.exists() {
            info!("Processed file already exists, skipping: {display}");
            return Ok(SubsetOutcome::AlreadyExists);
        }
        if !raw.exists() {
            return Err(SubsetError::SourceMissing(raw.to_path_buf()));
        }
        if let Some(parent) = processed.parent() {
            fs::create_dir_all(parent).map_err(|source| SubsetError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut part = processed.as_os_str().to_owned();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        info!("Subsetting {} -> {display}", raw.display());
        let result = self.write(raw, &part, bbox).and_then(|cells| {
            fs::rename(&part, processed)
                .map(|()| cells)
                .map_err(|source| SubsetError::Io {
                    path: processed.to_path_buf(),
                    source,
                })
        });

        match result {
            Ok(cells) => {
                info!("Successfully created subset: {display} ({cells} cells)");
                Ok(SubsetOutcome::Written { cells })
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&part) {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Could not remove partial file {}: {rm}", part.display());
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;

    pub const FILL: f32 = 1.0e20;

    /// Value stored at (t, j, i) in fixture files.
    pub fn cell_value(t: usize, j: usize, i: usize) -> f32 {
        250.0 + t as f32 + j as f32 * 2.0 + i as f32 * 0.5
    }

    /// Writes a rectilinear `tas(time, lat, lon)` file. The cell at (0, 0, 0)
    /// holds the fill value.
    pub fn write_rectilinear(
        path: &Path,
        lats: &[f64],
        lons: &[f64],
        times: &[f64],
        time_units: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut file = netcdf::create(path)?;
        file.add_attribute("source_id", "TEST-MODEL")?;
        file.add_dimension("time", times.len())?;
        file.add_dimension("lat", lats.len())?;
        file.add_dimension("lon", lons.len())?;
        file.add_dimension("bnds", 2)?;

        let mut time = file.add_variable::<f64>("time", &["time"])?;
        time.put_attribute("units", time_units)?;
        time.put_attribute("calendar", "standard")?;
        time.put_values(times, ..)?;

        let mut time_bnds = file.add_variable::<f64>("time_bnds", &["time", "bnds"])?;
        let bounds: Vec<f64> = times.iter().flat_map(|t| [t - 0.5, t + 0.5]).collect();
        time_bnds.put_values(&bounds, ..)?;

        let mut lat = file.add_variable::<f64>("lat", &["lat"])?;
        lat.put_attribute("units", "degrees_north")?;
        lat.put_values(lats, ..)?;

        let mut lon = file.add_variable::<f64>("lon", &["lon"])?;
        lon.put_attribute("units", "degrees_east")?;
        lon.put_values(lons, ..)?;

        let mut tas = file.add_variable::<f32>("tas", &["time", "lat", "lon"])?;
        tas.put_attribute("_FillValue", FILL)?;
        tas.put_attribute("units", "K")?;
        let mut values = Vec::with_capacity(times.len() * lats.len() * lons.len());
        for t in 0..times.len() {
            for j in 0..lats.len() {
                for i in 0..lons.len() {
                    values.push(if (t, j, i) == (0, 0, 0) { FILL } else { cell_value(t, j, i) });
                }
            }
        }
        tas.put_values(&values, ..)?;
        Ok(())
    }

    /// A 5 x 36 grid: lat -20..=20 step 10, lon 0..=350 step 10, three monthly steps.
    pub fn write_standard(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let lats: Vec<f64> = (0..5).map(|j| -20.0 + 10.0 * j as f64).collect();
        let lons: Vec<f64> = (0..36).map(|i| 10.0 * i as f64).collect();
        write_rectilinear(path, &lats, &lons, &[15.5, 45.0, 74.5], "days since 1850-01-01 00:00:00")
    }

    /// The standard grid plus a char `crs` grid mapping referenced by `tas`
    /// and a `lon_label(lon)` string variable holding "L0".."L35".
    pub fn write_with_grid_mapping(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        write_standard(path)?;
        let mut file = netcdf::append(path)?;

        let mut crs = file.add_variable::<super::NcChar>("crs", &[])?;
        crs.put_attribute("grid_mapping_name", "rotated_latitude_longitude")?;
        crs.put_attribute("grid_north_pole_latitude", 39.25)?;
        crs.put_value(super::NcChar(b'c'), ..)?;

        let mut labels = file.add_string_variable("lon_label", &["lon"])?;
        for i in 0..36usize {
            labels.put_string(&format!("L{i}"), [i])?;
        }

        let mut tas = file.variable_mut("tas").ok_or("tas")?;
        tas.put_attribute("grid_mapping", "crs")?;
        Ok(())
    }

    /// Writes a curvilinear `tos(time, y, x)` file with 2-D lat/lon.
    pub fn write_curvilinear(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let (ny, nx) = (4usize, 6usize);
        let mut file = netcdf::create(path)?;
        file.add_dimension("time", 1)?;
        file.add_dimension("y", ny)?;
        file.add_dimension("x", nx)?;

        let mut time = file.add_variable::<f64>("time", &["time"])?;
        time.put_attribute("units", "days since 2000-01-01")?;
        time.put_values(&[0.0], ..)?;

        // rotated grid: latitude grows with both y and x
        let mut lat_values = Vec::new();
        let mut lon_values = Vec::new();
        for j in 0..ny {
            for i in 0..nx {
                lat_values.push(-30.0 + 10.0 * j as f64 + 2.0 * i as f64);
                lon_values.push(10.0 * i as f64 - 5.0 * j as f64);
            }
        }
        let mut lat = file.add_variable::<f64>("lat", &["y", "x"])?;
        lat.put_values(&lat_values, ..)?;
        let mut lon = file.add_variable::<f64>("lon", &["y", "x"])?;
        lon.put_values(&lon_values, ..)?;

        let mut tos = file.add_variable::<f32>("tos", &["time", "y", "x"])?;
        let values: Vec<f32> = (0..ny * nx).map(|k| k as f32).collect();
        tos.put_values(&values, ..)?;
        Ok(())
    }
}
