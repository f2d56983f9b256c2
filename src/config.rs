//! # Mirror Configuration Module
//!
//! This module provides configuration parsing and validation for ncmirror runs.
//! A configuration document describes where mirrored files live, which regions
//! are cut out of every downloaded file, how variables are sorted into category
//! directories and which datasets are enumerated.
//!
//! ## Configuration Structure
//!
//! - **base_data_path**: Root of everything the pipeline writes
//! - **log_file** / **raw_data_dir**: Relative to `base_data_path`
//! - **variable_categories**: Category name to list of variable ids (order matters)
//! - **processing_regions**: Named bounding boxes, one processed copy per region
//! - **geographical_scope**: Legacy single bounding box using the flat layout
//! - **datasets**: The parameter space to enumerate for each model/experiment
//! - **validation_rules**: Plausible value ranges used by the validator
//!
//! Both YAML and JSON documents are accepted.
//!
//! ## Example Usage
//!
//! ```rust
//! use ncmirror::config::MirrorConfig;
//!
//! let yaml = r#"
//! base_data_path: /data/mirror
//! log_file: pipeline.log
//! raw_data_dir: raw
//! variable_categories:
//!   temperature: [tas]
//! processing_regions:
//!   - name: TestRegion
//!     bounding_box: { min_lat: -10, max_lat: 10, min_lon: 20, max_lon: 40 }
//! datasets:
//!   - name: demo
//!     model: X
//!     experiment: hist
//!     url_template: "http://example/{variable}_{experiment}_X.nc"
//!     variables_to_download: [tas]
//! "#;
//! let config = MirrorConfig::from_yaml(yaml)?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::resolve::{template_placeholders, Placeholder};

/// Category assigned to variables that appear in no configured category.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Region name used for the legacy `geographical_scope` layout.
pub const DEFAULT_REGION_NAME: &str = "default";

/// Errors raised while loading or validating a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("No processing regions configured; there is nothing to subset to")]
    NoRegions,

    #[error("The flat output layout supports exactly one region, found {0}")]
    FlatLayoutWithManyRegions(usize),

    #[error("Region name '{0}' is declared more than once")]
    DuplicateRegion(String),

    #[error("Region '{region}' has an invalid bounding box: {reason}")]
    InvalidBoundingBox { region: String, reason: String },

    #[error("Dataset '{0}' does not declare any variables")]
    NoVariables(String),

    #[error("Dataset '{dataset}': {reason}")]
    InvalidTemplate { dataset: String, reason: String },

    #[error("url_source is 'search' but no search endpoint is configured")]
    MissingSearchEndpoint,
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Complete configuration for one mirror run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    /// Root directory for raw files, processed files and logs
    pub base_data_path: PathBuf,
    /// Log file name, relative to `base_data_path`
    pub log_file: String,
    /// Raw download directory, relative to `base_data_path`
    pub raw_data_dir: String,
    /// Category name to variable ids, in declaration order
    #[serde(default)]
    pub variable_categories: VariableCategoryMap,
    /// Regions every downloaded file is cut to
    #[serde(default)]
    pub processing_regions: Vec<RegionSpec>,
    /// Single bounding box of the older flat layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographical_scope: Option<BoundingBox>,
    /// Explicit layout; derived from the region keys when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_layout: Option<OutputLayout>,
    /// Datasets to enumerate
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub url_source: UrlSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchSettings>,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_rules: Option<ValidationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default = "default_validation_log")]
    pub validation_log_file: String,
}

fn default_validation_log() -> String {
    "validation.log".to_string()
}

/// How candidate URLs are produced. Selected per run, never mixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlSource {
    #[default]
    Template,
    Search,
}

/// Directory convention for processed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// `{base}/{region}/{model}/{experiment}/{category}/{file}`
    Regional,
    /// `{base}/{model}/{experiment}/{category}/{file}`
    Flat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchSettings {
    pub endpoint: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_extension")]
    pub file_extension: String,
}

fn default_search_limit() -> u32 {
    50
}

fn default_search_timeout() -> u64 {
    30
}

fn default_extension() -> String {
    ".nc".to_string()
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            endpoint: crate::search::DEFAULT_SEARCH_ENDPOINT.to_string(),
            limit: default_search_limit(),
            timeout_secs: default_search_timeout(),
            file_extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSettings {
    /// Connect timeout and longest wait for more body bytes, in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Skip TLS certificate verification (legacy archive servers only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Upper bound on overlapping downloads; 1 keeps the run sequential
    #[serde(default = "default_concurrency")]
    pub max_concurrent_downloads: usize,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_concurrency() -> usize {
    1
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout(),
            accept_invalid_certs: false,
            max_concurrent_downloads: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Free space below which the storage guard warns
    #[serde(default = "default_required_gb")]
    pub required_free_gb: f64,
}

fn default_required_gb() -> f64 {
    50.0
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            required_free_gb: default_required_gb(),
        }
    }
}

/// One logical dataset to mirror.
///
/// The parameter lists are enumerated as a Cartesian product in a fixed order:
/// variable, mip_table, member, grid, version, time_period. When
/// `configuration_groups` is non-empty every group scopes its own variables,
/// mip tables and time periods; unset group lists fall back to the
/// dataset-level ones.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetSpec {
    pub name: String,
    pub model: String,
    pub experiment: String,
    /// Format string with `{placeholder}` fields, see [`crate::resolve`]
    #[serde(default)]
    pub url_template: String,
    #[serde(default)]
    pub ensemble_members: Vec<String>,
    #[serde(default)]
    pub grids_to_try: Vec<String>,
    /// Absent means the version dimension is not enumerated at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<String>>,
    #[serde(default)]
    pub variables_to_download: Vec<String>,
    #[serde(default)]
    pub mip_tables_to_try: Vec<String>,
    #[serde(default)]
    pub time_periods: Vec<TimePeriod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configuration_groups: Vec<ConfigurationGroup>,
}

/// A scoped slice of a dataset's parameter space. Groups keep incompatible
/// variable / frequency pairs from being multiplied together.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigurationGroup {
    pub name: String,
    pub variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mip_tables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_periods: Option<Vec<TimePeriod>>,
}

impl DatasetSpec {
    /// Whether the dataset declares at least one variable, flat or grouped.
    pub fn has_variables(&self) -> bool {
        if self.configuration_groups.is_empty() {
            !self.variables_to_download.is_empty()
        } else {
            self.configuration_groups.iter().any(|g| !g.variables.is_empty())
        }
    }

    /// All variables of the dataset in enumeration order, without duplicates.
    pub fn all_variables(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let groups: Box<dyn Iterator<Item = &String>> = if self.configuration_groups.is_empty() {
            Box::new(self.variables_to_download.iter())
        } else {
            Box::new(self.configuration_groups.iter().flat_map(|g| g.variables.iter()))
        };
        for var in groups {
            if !seen.contains(&var.as_str()) {
                seen.push(var);
            }
        }
        seen
    }
}

/// A time period as it appears in a file name, optionally annotated with the
/// years it is expected to cover.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TimePeriod {
    Label(String),
    Span {
        period_string: String,
        start_year: i32,
        end_year: i32,
    },
}

impl TimePeriod {
    /// The textual token used in URLs and file names, whichever form is configured.
    pub fn period_string(&self) -> &str {
        match self {
            TimePeriod::Label(s) => s,
            TimePeriod::Span { period_string, .. } => period_string,
        }
    }

    /// Expected (start, end) years. Structured periods carry them explicitly;
    /// bare labels such as `18500101-18691231` are parsed.
    pub fn expected_years(&self) -> Option<(i32, i32)> {
        match self {
            TimePeriod::Span {
                start_year,
                end_year,
                ..
            } => Some((*start_year, *end_year)),
            TimePeriod::Label(s) => years_from_period_label(s),
        }
    }
}

/// Extracts the leading years of a `YYYY[MM[DD[HH]]]-YYYY[MM[DD[HH]]]` token.
pub fn years_from_period_label(label: &str) -> Option<(i32, i32)> {
    let (start, end) = label.split_once('-')?;
    let year_of = |part: &str| -> Option<i32> {
        if part.len() < 4 || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        part[..4].parse().ok()
    };
    let (start, end) = (year_of(start)?, year_of(end)?);
    (start <= end).then_some((start, end))
}

/// A named rectangular region.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegionSpec {
    pub name: String,
    pub bounding_box: BoundingBox,
}

/// Inclusive latitude / longitude bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains_lat(&self, lat: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat
    }

    /// Inclusive longitude test that also accepts the value shifted by ±360°,
    /// so 0..360 grids match -180..180 boxes and vice versa.
    pub fn contains_lon(&self, lon: f64) -> bool {
        [lon, lon - 360.0, lon + 360.0]
            .iter()
            .any(|l| *l >= self.min_lon && *l <= self.max_lon)
    }

    fn check(&self) -> Result<(), String> {
        let values = [self.min_lat, self.max_lat, self.min_lon, self.max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err("bounds must be finite numbers".to_string());
        }
        if self.min_lat > self.max_lat {
            return Err(format!("min_lat {} > max_lat {}", self.min_lat, self.max_lat));
        }
        if self.min_lon > self.max_lon {
            return Err(format!("min_lon {} > max_lon {}", self.min_lon, self.max_lon));
        }
        if self.min_lat < -90.0 || self.max_lat > 90.0 {
            return Err("latitudes must lie within [-90, 90]".to_string());
        }
        Ok(())
    }
}

/// Category name to variable ids. Iteration follows declaration order so a
/// variable listed under two categories always resolves to the first one.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct VariableCategoryMap(pub IndexMap<String, Vec<String>>);

impl VariableCategoryMap {
    /// Category directory for `variable`, or [`UNCATEGORIZED`].
    pub fn category_for(&self, variable: &str) -> &str {
        self.0
            .iter()
            .find(|(_, vars)| vars.iter().any(|v| v == variable))
            .map(|(category, _)| category.as_str())
            .unwrap_or(UNCATEGORIZED)
    }
}

/// Free-function form of [`VariableCategoryMap::category_for`].
pub fn get_variable_category<'a>(variable: &str, categories: &'a VariableCategoryMap) -> &'a str {
    categories.category_for(variable)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidationRules {
    /// Variable id (or `default`) to plausible range
    #[serde(default)]
    pub variable_ranges: IndexMap<String, VariableRange>,
}

impl ValidationRules {
    /// Range for `variable`, falling back to the `default` entry.
    pub fn range_for(&self, variable: &str) -> Option<&VariableRange> {
        self.variable_ranges
            .get(variable)
            .or_else(|| self.variable_ranges.get("default"))
    }
}

/// Plausible value range. Bounds may be written as numbers or numeric strings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct VariableRange {
    #[serde(deserialize_with = "number_or_string")]
    pub min: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub max: f64,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("'{s}' is not a number"))),
    }
}

impl MirrorConfig {
    /// Loads a configuration file, choosing JSON for `.json` files and YAML otherwise.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use ncmirror::config::MirrorConfig;
    ///
    /// let config = MirrorConfig::from_file("config.yaml")?;
    /// println!("Mirroring {} datasets", config.datasets.len());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json_str)?)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    /// Layout in effect: explicit setting, else regional when named regions exist.
    pub fn layout(&self) -> OutputLayout {
        match self.output_layout {
            Some(layout) => layout,
            None if self.processing_regions.is_empty() && self.geographical_scope.is_some() => {
                OutputLayout::Flat
            }
            None => OutputLayout::Regional,
        }
    }

    /// Regions in effect. The legacy `geographical_scope` becomes a single
    /// region named [`DEFAULT_REGION_NAME`] when no named regions are given.
    pub fn regions(&self) -> Vec<RegionSpec> {
        if !self.processing_regions.is_empty() {
            return self.processing_regions.clone();
        }
        self.geographical_scope
            .map(|bounding_box| {
                vec![RegionSpec {
                    name: DEFAULT_REGION_NAME.to_string(),
                    bounding_box,
                }]
            })
            .unwrap_or_default()
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.base_data_path.join(&self.raw_data_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.base_data_path.join(&self.log_file)
    }

    pub fn validation_log_path(&self) -> PathBuf {
        self.base_data_path.join(&self.validation_log_file)
    }

    /// Search settings in effect (defaults when the section is absent).
    pub fn search_settings(&self) -> SearchSettings {
        self.search.clone().unwrap_or_default()
    }

    /// Checks everything that must hold before any network or filesystem work.
    ///
    /// Returns non-fatal warnings on success.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        let regions = self.regions();
        if regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        if self.layout() == OutputLayout::Flat && regions.len() > 1 {
            return Err(ConfigError::FlatLayoutWithManyRegions(regions.len()));
        }
        if !self.processing_regions.is_empty() && self.geographical_scope.is_some() {
            warnings.push("geographical_scope is ignored because processing_regions is set".to_string());
        }
        let mut names: Vec<&str> = Vec::new();
        for region in &regions {
            if names.contains(&region.name.as_str()) {
                return Err(ConfigError::DuplicateRegion(region.name.clone()));
            }
            names.push(&region.name);
            region
                .bounding_box
                .check()
                .map_err(|reason| ConfigError::InvalidBoundingBox {
                    region: region.name.clone(),
                    reason,
                })?;
        }

        if self.url_source == UrlSource::Search
            && self.search.as_ref().is_none_or(|s| s.endpoint.trim().is_empty())
        {
            return Err(ConfigError::MissingSearchEndpoint);
        }

        if self.datasets.is_empty() {
            warnings.push("no datasets configured".to_string());
        }
        for dataset in &self.datasets {
            if !dataset.has_variables() {
                return Err(ConfigError::NoVariables(dataset.name.clone()));
            }
            if self.url_source == UrlSource::Template {
                check_template(dataset)?;
            }
            warnings.extend(empty_list_warnings(dataset, self.url_source));
        }

        Ok(warnings)
    }
}

fn check_template(dataset: &DatasetSpec) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTemplate {
        dataset: dataset.name.clone(),
        reason,
    };
    if dataset.url_template.trim().is_empty() {
        return Err(invalid("url_template is empty".to_string()));
    }
    let placeholders = template_placeholders(&dataset.url_template).map_err(|e| invalid(e.to_string()))?;
    if placeholders.contains(&Placeholder::Version) && dataset.versions.is_none() {
        return Err(invalid(
            "url_template uses {version} but the dataset declares no versions".to_string(),
        ));
    }
    Ok(())
}

fn empty_list_warnings(dataset: &DatasetSpec, source: UrlSource) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut warn_if_empty = |empty: bool, what: &str| {
        if empty {
            warnings.push(format!(
                "dataset '{}' has no {what}; it will produce no candidates",
                dataset.name
            ));
        }
    };
    warn_if_empty(dataset.ensemble_members.is_empty(), "ensemble_members");
    if source == UrlSource::Template {
        warn_if_empty(dataset.grids_to_try.is_empty(), "grids_to_try");
        if let Some(versions) = &dataset.versions {
            warn_if_empty(versions.is_empty(), "versions");
        }
        if dataset.configuration_groups.is_empty() {
            warn_if_empty(dataset.mip_tables_to_try.is_empty(), "mip_tables_to_try");
            warn_if_empty(dataset.time_periods.is_empty(), "time_periods");
        } else {
            for group in &dataset.configuration_groups {
                let mip_tables = group.mip_tables.as_ref().unwrap_or(&dataset.mip_tables_to_try);
                let periods = group.time_periods.as_ref().unwrap_or(&dataset.time_periods);
                warn_if_empty(mip_tables.is_empty(), &format!("mip tables in group '{}'", group.name));
                warn_if_empty(periods.is_empty(), &format!("time periods in group '{}'", group.name));
            }
        }
    }
    warnings
}
