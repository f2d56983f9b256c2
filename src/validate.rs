//! # Validation Module
//!
//! Read-only audit of an existing mirror. For every raw file the configuration
//! would produce (and that exists locally) the validator runs:
//!
//! - **Format**: the file opens as NetCDF
//! - **Time coverage**: decoded time axis brackets the expected years
//! - **Data range**: the first ten time steps lie within the configured range
//! - **Consistency**: each region's processed mean matches the mean of the
//!   same subset recomputed from the raw file
//!
//! Every check is independent and logged as `[PASS]` or `[FAIL]` with the
//! measured values. Nothing here modifies files.

use float_cmp::approx_eq;
use log::{error, info, warn};
use ndarray::{ArrayD, Axis, Slice};
use netcdf::{AttributeValue, Extents};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::calendar::{CalendarError, TimeAxis};
use crate::catalog::{enumerate, TEMPLATE_ORDER};
use crate::config::{years_from_period_label, BoundingBox, MirrorConfig, RegionSpec, UrlSource};
use crate::error::{Classify, ErrorKind};
use crate::resolve::{expand_template, url_filename};
use crate::storage::StorageLayout;
use crate::subset::{read_selected, NetcdfSubsetter, SubsetError};

/// Time steps sampled by the data range check.
pub const SAMPLE_TIME_STEPS: usize = 10;

const TIME_NAME: &str = "time";
const ABS_TOLERANCE: f64 = 1e-8;
const REL_TOLERANCE: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("NetCDF error while {context}: {source}")]
    Netcdf {
        context: String,
        #[source]
        source: netcdf::Error,
    },

    #[error("Variable '{0}' not found")]
    MissingVariable(String),

    #[error("Attribute '{attribute}' missing on '{variable}'")]
    MissingAttribute { variable: String, attribute: String },

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Subset(#[from] SubsetError),

    #[error("'{0}' holds no valid values")]
    NoData(String),

    #[error("Found {found_start}-{found_end}, expected {expected_start}-{expected_end}")]
    IncompleteCoverage {
        found_start: i32,
        found_end: i32,
        expected_start: i32,
        expected_end: i32,
    },

    #[error("Found min={min:.2}, max={max:.2}. Expected range [{valid_min}, {valid_max}]")]
    OutOfRange {
        min: f64,
        max: f64,
        valid_min: f64,
        valid_max: f64,
    },

    #[error("Raw mean={raw:.4}, Processed mean={processed:.4}")]
    MeanMismatch { raw: f64, processed: f64 },
}

impl Classify for ValidationError {
    fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::Subset(e) => e.kind(),
            ValidationError::IncompleteCoverage { .. }
            | ValidationError::OutOfRange { .. }
            | ValidationError::MeanMismatch { .. } => ErrorKind::Consistency,
            _ => ErrorKind::Format,
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

fn nc<T>(result: Result<T, netcdf::Error>, context: impl FnOnce() -> String) -> ValidationResult<T> {
    result.map_err(|source| ValidationError::Netcdf {
        context: context(),
        source,
    })
}

fn open(path: &Path) -> ValidationResult<netcdf::File> {
    nc(netcdf::open(path), || format!("opening {}", path.display()))
}

fn attribute_f64(var: &netcdf::Variable, name: &str) -> Option<f64> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Double(v) => Some(v),
        AttributeValue::Float(v) => Some(f64::from(v)),
        AttributeValue::Int(v) => Some(f64::from(v)),
        AttributeValue::Short(v) => Some(f64::from(v)),
        AttributeValue::Schar(v) => Some(f64::from(v)),
        AttributeValue::Uchar(v) => Some(f64::from(v)),
        AttributeValue::Ushort(v) => Some(f64::from(v)),
        AttributeValue::Uint(v) => Some(f64::from(v)),
        AttributeValue::Longlong(v) => Some(v as f64),
        AttributeValue::Ulonglong(v) => Some(v as f64),
        AttributeValue::Doubles(v) => v.first().copied(),
        AttributeValue::Floats(v) => v.first().map(|x| f64::from(*x)),
        _ => None,
    }
}

fn attribute_string(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// `_FillValue` and `missing_value` of a variable, when declared.
fn fill_values(var: &netcdf::Variable) -> Vec<f64> {
    ["_FillValue", "missing_value"]
        .iter()
        .filter_map(|name| attribute_f64(var, name))
        .collect()
}

fn is_valid(value: f64, fills: &[f64]) -> bool {
    !value.is_nan() && !fills.contains(&value)
}

/// Mean over values that are neither NaN nor a fill value.
pub fn masked_mean<'a>(values: impl IntoIterator<Item = &'a f64>, fills: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter(|v| is_valid(**v, fills))
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Approximate equality with `isclose` semantics: `|a - b| <= atol + rtol * |b|`.
pub fn means_match(raw: f64, processed: f64) -> bool {
    let tolerance = ABS_TOLERANCE + REL_TOLERANCE * processed.abs();
    approx_eq!(f64, raw, processed, epsilon = tolerance)
}

pub fn check_format(path: &Path) -> ValidationResult<()> {
    open(path).map(|_| ())
}

/// Min and max calendar year of the `time` coordinate.
pub fn measure_time_range(path: &Path) -> ValidationResult<(i32, i32)> {
    let file = open(path)?;
    let time = file
        .variable(TIME_NAME)
        .ok_or_else(|| ValidationError::MissingVariable(TIME_NAME.to_string()))?;
    let units = attribute_string(&time, "units").ok_or_else(|| ValidationError::MissingAttribute {
        variable: TIME_NAME.to_string(),
        attribute: "units".to_string(),
    })?;
    let calendar = attribute_string(&time, "calendar");
    let axis = TimeAxis::parse(&units, calendar.as_deref())?;

    let values = nc(time.get_values::<f64, _>(..), || "reading time values".to_string())?;
    axis.year_range(&values)
        .ok_or_else(|| ValidationError::NoData(TIME_NAME.to_string()))
}

pub fn check_time_coverage(path: &Path, expected: (i32, i32)) -> ValidationResult<(i32, i32)> {
    let (start, end) = measure_time_range(path)?;
    if start <= expected.0 && end >= expected.1 {
        Ok((start, end))
    } else {
        Err(ValidationError::IncompleteCoverage {
            found_start: start,
            found_end: end,
            expected_start: expected.0,
            expected_end: expected.1,
        })
    }
}

fn time_sample(var: &netcdf::Variable, data: ArrayD<f64>) -> ArrayD<f64> {
    match var.dimensions().iter().position(|d| d.name() == TIME_NAME) {
        Some(axis) => {
            let steps = data.len_of(Axis(axis)).min(SAMPLE_TIME_STEPS);
            data.slice_axis(Axis(axis), Slice::from(0..steps)).to_owned()
        }
        None => data,
    }
}

/// Min and max of the valid values in the first time steps of `variable`.
pub fn measure_data_range(path: &Path, variable: &str) -> ValidationResult<(f64, f64)> {
    let file = open(path)?;
    let var = file
        .variable(variable)
        .ok_or_else(|| ValidationError::MissingVariable(variable.to_string()))?;
    let fills = fill_values(&var);
    let data = nc(var.get::<f64, _>(Extents::All), || format!("reading '{variable}'"))?;
    let sample = time_sample(&var, data);

    sample
        .iter()
        .copied()
        .filter(|v| is_valid(*v, &fills))
        .fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .ok_or_else(|| ValidationError::NoData(variable.to_string()))
}

pub fn check_data_range(path: &Path, variable: &str, valid_min: f64, valid_max: f64) -> ValidationResult<(f64, f64)> {
    let (min, max) = measure_data_range(path, variable)?;
    if min >= valid_min && max <= valid_max {
        Ok((min, max))
    } else {
        Err(ValidationError::OutOfRange {
            min,
            max,
            valid_min,
            valid_max,
        })
    }
}

/// Mean of `variable` over `bbox` recomputed from the raw file, and the mean of
/// the processed file.
pub fn measure_means(
    subsetter: &NetcdfSubsetter,
    raw: &Path,
    processed: &Path,
    variable: &str,
    bbox: &BoundingBox,
) -> ValidationResult<(f64, f64)> {
    let (raw_file, selection) = subsetter.selection_for(raw, bbox)?;
    let raw_var = raw_file
        .variable(variable)
        .ok_or_else(|| ValidationError::MissingVariable(variable.to_string()))?;
    let raw_data = read_selected::<f64>(&raw_var, &selection)?;
    let raw_mean = masked_mean(raw_data.iter(), &fill_values(&raw_var))
        .ok_or_else(|| ValidationError::NoData(format!("{variable} (raw subset)")))?;

    let processed_file = open(processed)?;
    let processed_var = processed_file
        .variable(variable)
        .ok_or_else(|| ValidationError::MissingVariable(variable.to_string()))?;
    let processed_data = nc(processed_var.get::<f64, _>(Extents::All), || {
        format!("reading '{variable}' from {}", processed.display())
    })?;
    let processed_mean = masked_mean(processed_data.iter(), &fill_values(&processed_var))
        .ok_or_else(|| ValidationError::NoData(format!("{variable} (processed)")))?;

    Ok((raw_mean, processed_mean))
}

pub fn check_consistency(
    subsetter: &NetcdfSubsetter,
    raw: &Path,
    processed: &Path,
    variable: &str,
    bbox: &BoundingBox,
) -> ValidationResult<f64> {
    let (raw_mean, processed_mean) = measure_means(subsetter, raw, processed, variable, bbox)?;
    if means_match(raw_mean, processed_mean) {
        Ok(raw_mean)
    } else {
        Err(ValidationError::MeanMismatch {
            raw: raw_mean,
            processed: processed_mean,
        })
    }
}

/// One raw file the configuration expects, with what is known about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedFile {
    pub dataset: String,
    pub model: String,
    pub experiment: String,
    pub variable: String,
    pub filename: String,
    pub expected_years: Option<(i32, i32)>,
}

/// Tallies of one validation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub files_expected: usize,
    pub files_checked: usize,
    pub processed_missing: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.processed_missing == 0
    }

    fn record<T>(&mut self, label: &str, result: ValidationResult<T>, detail: impl FnOnce(&T) -> String) -> bool {
        match result {
            Ok(value) => {
                self.passed += 1;
                info!("  [PASS] {label} OK: {}", detail(&value));
                true
            }
            Err(e) => {
                self.failed += 1;
                error!("  [FAIL] {label}: {e}");
                false
            }
        }
    }
}

/// Audits a mirror described by a configuration.
pub struct Validator<'a> {
    config: &'a MirrorConfig,
    layout: StorageLayout,
    regions: Vec<RegionSpec>,
    subsetter: NetcdfSubsetter,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a MirrorConfig) -> Self {
        Self {
            config,
            layout: StorageLayout::from_config(config),
            regions: config.regions(),
            subsetter: NetcdfSubsetter::default(),
        }
    }

    /// Raw files the configuration would produce, in enumeration order.
    pub fn expected_files(&self) -> Vec<ExpectedFile> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        match self.config.url_source {
            UrlSource::Template => {
                for candidate in enumerate(&self.config.datasets, TEMPLATE_ORDER) {
                    let Some(dataset) = self.config.datasets.iter().find(|d| d.name == candidate.dataset) else {
                        continue;
                    };
                    let url = match expand_template(&dataset.url_template, &candidate) {
                        Ok(url) => url,
                        Err(e) => {
                            warn!("Cannot reconstruct file name for {candidate}: {e}");
                            continue;
                        }
                    };
                    let Some(filename) = url_filename(&url) else { continue };
                    if seen.insert(filename.to_string()) {
                        files.push(ExpectedFile {
                            dataset: candidate.dataset.clone(),
                            model: candidate.model.clone(),
                            experiment: candidate.experiment.clone(),
                            variable: candidate.variable.clone(),
                            filename: filename.to_string(),
                            expected_years: candidate.time_period.as_ref().and_then(|p| p.expected_years()),
                        });
                    }
                }
            }
            UrlSource::Search => {
                let extension = self.config.search_settings().file_extension;
                let entries = self.raw_listing();
                for dataset in &self.config.datasets {
                    for variable in dataset.all_variables() {
                        let prefix = format!("{variable}_");
                        for name in &entries {
                            let Some(stem) = name.strip_suffix(extension.as_str()) else { continue };
                            let tokens: Vec<&str> = stem.split('_').collect();
                            let matches = name.starts_with(&prefix)
                                && tokens.contains(&dataset.model.as_str())
                                && tokens.contains(&dataset.experiment.as_str());
                            if matches && seen.insert(name.clone()) {
                                files.push(ExpectedFile {
                                    dataset: dataset.name.clone(),
                                    model: dataset.model.clone(),
                                    experiment: dataset.experiment.clone(),
                                    variable: variable.to_string(),
                                    filename: name.clone(),
                                    expected_years: tokens.last().and_then(|t| years_from_period_label(t)),
                                });
                            }
                        }
                    }
                }
            }
        }
        files
    }

    fn raw_listing(&self) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(self.layout.raw_dir()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) => {
                warn!("Cannot list {}: {e}", self.layout.raw_dir().display());
                Vec::new()
            }
        };
        names.sort();
        names
    }

    /// Runs every check on every expected file that exists locally.
    pub fn run(&self) -> ValidationReport {
        info!("--- Dataset Validation Started ---");
        let mut report = ValidationReport::default();
        let expected = self.expected_files();
        report.files_expected = expected.len();

        let mut current_dataset: Option<&str> = None;
        for file in &expected {
            if current_dataset != Some(file.dataset.as_str()) {
                info!("===== Validating Dataset: {} =====", file.dataset);
                current_dataset = Some(file.dataset.as_str());
            }
            let raw = self.layout.raw_path(&file.filename);
            if !raw.exists() {
                continue;
            }
            report.files_checked += 1;
            self.validate_file(file, &raw, &mut report);
        }

        info!(
            "--- Dataset Validation Finished: {} files checked, {} passed, {} failed, {} skipped, {} processed missing ---",
            report.files_checked, report.passed, report.failed, report.skipped, report.processed_missing
        );
        report
    }

    fn validate_file(&self, file: &ExpectedFile, raw: &Path, report: &mut ValidationReport) {
        info!("--- Checking: {} ---", file.filename);
        info!("-> Validating Raw File...");

        let raw_ok = report.record("Format", check_format(raw), |_| file.filename.clone());
        if raw_ok {
            match file.expected_years {
                Some(expected) => {
                    report.record("Time Coverage", check_time_coverage(raw, expected), |(s, e)| {
                        format!("Found {s}-{e}.")
                    });
                }
                None => {
                    report.skipped += 1;
                    info!("  [SKIP] Time Coverage: no expected years for {}", file.filename);
                }
            }

            let range = self
                .config
                .validation_rules
                .as_ref()
                .and_then(|rules| rules.range_for(&file.variable));
            match range {
                Some(range) => {
                    report.record(
                        "Data Range",
                        check_data_range(raw, &file.variable, range.min, range.max),
                        |(min, max)| format!("Found min={min:.2}, max={max:.2}."),
                    );
                }
                None => report.skipped += 1,
            }
        }

        for region in &self.regions {
            let category = self.config.variable_categories.category_for(&file.variable);
            let processed = self.processed_path(region, file, category);
            if !processed.exists() {
                report.processed_missing += 1;
                warn!(
                    "  [WARN] Processed file is missing for existing raw file: {} (region {})",
                    file.filename, region.name
                );
                continue;
            }

            info!("-> Validating Processed File ({})...", region.name);
            if report.record("Format", check_format(&processed), |_| processed.display().to_string()) {
                if !raw_ok {
                    report.skipped += 1;
                    continue;
                }
                report.record(
                    "Processing Consistency",
                    check_consistency(&self.subsetter, raw, &processed, &file.variable, &region.bounding_box),
                    |mean| format!("Means match ({mean:.4})."),
                );
            }
        }
    }

    fn processed_path(&self, region: &RegionSpec, file: &ExpectedFile, category: &str) -> PathBuf {
        self.layout
            .processed_path(&region.name, &file.model, &file.experiment, category, &file.filename)
    }
}
