//! # CLI Module
//!
//! This module provides the command-line interface for ncmirror, including:
//! - Argument parsing with clap
//! - Environment variable support with the NCMIRROR_ prefix
//! - Command-line overrides for a few configuration keys
//! - Configuration templates (JSON/YAML)

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use indexmap::IndexMap;
use std::path::PathBuf;

use crate::config::{
    BoundingBox, ConfigError, ConfigurationGroup, DatasetSpec, MirrorConfig, RegionSpec, SearchSettings,
    StorageSettings, TimePeriod, TransportSettings, UrlSource, ValidationRules, VariableCategoryMap,
    VariableRange,
};

/// Mirror climate model NetCDF archives and cut regional subsets
#[derive(Parser, Debug)]
#[command(name = "ncmirror")]
#[command(about = "Mirror climate model NetCDF files and subset them to regions")]
#[command(version)]
#[command(long_about = "
ncmirror downloads climate model output from a remote archive and writes a
spatial subset of every file for each configured region.

FEATURES:
  • Candidate discovery from URL templates or from a search service
  • Idempotent downloads: files already on disk are never fetched again
  • One download feeds every configured region
  • Validation of format, time coverage and raw/processed consistency
  • Shell completions: Auto-completion for bash, zsh, fish, and PowerShell

EXAMPLES:
  # Mirror everything described by config.yaml
  ncmirror run

  # List the candidate URLs without downloading
  ncmirror run --dry-run

  # Audit the mirror
  ncmirror --config cmip6.yaml validate

  # Generate a configuration template
  ncmirror template grouped --format yaml -o config.yaml

  # Generate completions
  ncmirror completions bash > ~/.bash_completion.d/ncmirror
")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode - suppress all log output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, global = true, env = "NCMIRROR_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the mirror pipeline
    #[command(long_about = "
Enumerate every configured candidate, download the raw file once and write one
subset per region.

Files that already exist are skipped, so an interrupted run can simply be
started again.

EXAMPLES:
  # Full run
  ncmirror run

  # Show what would be fetched
  ncmirror run --dry-run

  # Overlap four downloads and show a spinner
  ncmirror run --concurrency 4 --progress
")]
    Run {
        /// List candidates and their URLs without touching disk or network
        #[arg(long, env = "NCMIRROR_DRY_RUN")]
        dry_run: bool,

        /// Accept invalid TLS certificates from the archive
        #[arg(long, env = "NCMIRROR_INSECURE")]
        insecure: bool,

        /// Number of candidates processed at once
        #[arg(long, env = "NCMIRROR_CONCURRENCY", value_parser = clap::value_parser!(u16).range(1..))]
        concurrency: Option<u16>,

        /// Show a progress spinner
        #[arg(long)]
        progress: bool,

        /// Override base_data_path from the configuration
        #[arg(long, env = "NCMIRROR_BASE_PATH")]
        base_path: Option<PathBuf>,
    },

    /// Validate raw and processed files of an existing mirror
    #[command(long_about = "
Re-open every expected raw file and its regional subsets and check:
• the file opens as NetCDF and has a time axis
• the time axis covers the expected years
• a sample of values lies inside the configured plausible range
• the subset mean agrees with the mean of the same cells in the raw file

Results go to the console and to validation_log_file under the base path.
")]
    Validate {
        /// Override base_data_path from the configuration
        #[arg(long, env = "NCMIRROR_BASE_PATH")]
        base_path: Option<PathBuf>,
    },

    /// Check the configuration and print the size of each dataset's enumeration
    Check,

    /// Query the search service for one (model, experiment, variable, member)
    #[command(long_about = "
Send one query to the search service and print the download URLs it offers,
direct HTTP links first.

EXAMPLES:
  ncmirror search -m MPI-ESM1-2-HR -e historical -n tas --member r1i1p1f1
")]
    Search {
        /// Source model id
        #[arg(short, long)]
        model: String,

        /// Experiment id
        #[arg(short, long)]
        experiment: String,

        /// Variable id
        #[arg(short = 'n', long)]
        variable: String,

        /// Ensemble member (variant label)
        #[arg(long)]
        member: Option<String>,
    },

    /// Generate configuration templates
    #[command(long_about = "
Generate configuration file templates for common use cases.

Available templates:
• basic: one dataset expanded from a URL template
• grouped: variables split into configuration groups with their own tables and periods
• search: candidates discovered through the search service

EXAMPLES:
  # Generate basic YAML template
  ncmirror template basic

  # Generate JSON template to file
  ncmirror template grouped --format json -o config.json
")]
    Template {
        /// Template type to generate
        #[arg(value_enum)]
        template_type: TemplateType,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts for various shells.

INSTALLATION:
  # Bash
  ncmirror completions bash > ~/.bash_completion.d/ncmirror

  # Zsh
  ncmirror completions zsh > ~/.zsh/completions/_ncmirror

  # Fish
  ncmirror completions fish > ~/.config/fish/completions/ncmirror.fish
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateType {
    /// Single dataset, template URLs
    Basic,
    /// Dataset with configuration groups
    Grouped,
    /// Search-service discovery
    Search,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// YAML configuration format
    Yaml,
}

/// Configuration keys that can be overridden from the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub base_path: Option<PathBuf>,
    pub insecure: bool,
    pub concurrency: Option<u16>,
}

impl Overrides {
    /// Command-line values win over the configuration document.
    pub fn apply(&self, config: &mut MirrorConfig) {
        if let Some(base) = &self.base_path {
            config.base_data_path = base.clone();
        }
        if self.insecure {
            config.transport.accept_invalid_certs = true;
        }
        if let Some(n) = self.concurrency {
            config.transport.max_concurrent_downloads = usize::from(n);
        }
    }
}

/// Builds the configuration a template type stands for.
pub fn generate_template(template_type: TemplateType) -> MirrorConfig {
    let mut categories = IndexMap::new();
    categories.insert("temperature".to_string(), vec!["tas".to_string(), "tasmax".to_string(), "tasmin".to_string()]);
    categories.insert("precipitation".to_string(), vec!["pr".to_string()]);
    categories.insert("ocean".to_string(), vec!["tos".to_string()]);

    let mut ranges = IndexMap::new();
    ranges.insert("tas".to_string(), VariableRange { min: 180.0, max: 340.0 });
    ranges.insert("pr".to_string(), VariableRange { min: 0.0, max: 0.1 });
    ranges.insert("default".to_string(), VariableRange { min: -1e10, max: 1e10 });

    let dataset = DatasetSpec {
        name: "MPI-ESM1-2-HR historical".to_string(),
        model: "MPI-ESM1-2-HR".to_string(),
        experiment: "historical".to_string(),
        url_template: "https://esgf.example.org/thredds/fileServer/CMIP6/CMIP/MPI-M/MPI-ESM1-2-HR/{experiment}/{ensemble_member}/{mip_table}/{variable}/{grid}/{version}/{variable}_{mip_table}_MPI-ESM1-2-HR_{experiment}_{ensemble_member}_{grid}_{time_period}.nc".to_string(),
        ensemble_members: vec!["r1i1p1f1".to_string()],
        grids_to_try: vec!["gn".to_string()],
        versions: Some(vec!["v20190710".to_string()]),
        variables_to_download: vec!["tas".to_string(), "pr".to_string()],
        mip_tables_to_try: vec!["Amon".to_string()],
        time_periods: vec![TimePeriod::Span {
            period_string: "185001-201412".to_string(),
            start_year: 1850,
            end_year: 2014,
        }],
        configuration_groups: Vec::new(),
    };

    let mut config = MirrorConfig {
        base_data_path: PathBuf::from("./climate_data"),
        log_file: "pipeline.log".to_string(),
        raw_data_dir: "raw".to_string(),
        variable_categories: VariableCategoryMap(categories),
        processing_regions: vec![
            RegionSpec {
                name: "Amazon".to_string(),
                bounding_box: BoundingBox {
                    min_lat: -20.0,
                    max_lat: 5.0,
                    min_lon: -80.0,
                    max_lon: -45.0,
                },
            },
            RegionSpec {
                name: "Sahel".to_string(),
                bounding_box: BoundingBox {
                    min_lat: 10.0,
                    max_lat: 20.0,
                    min_lon: -20.0,
                    max_lon: 40.0,
                },
            },
        ],
        geographical_scope: None,
        output_layout: None,
        datasets: vec![dataset],
        url_source: UrlSource::Template,
        search: None,
        transport: TransportSettings::default(),
        storage: StorageSettings::default(),
        validation_rules: Some(ValidationRules { variable_ranges: ranges }),
        log_level: Some("info".to_string()),
        validation_log_file: "validation.log".to_string(),
    };

    match template_type {
        TemplateType::Basic => {}
        TemplateType::Grouped => {
            let dataset = &mut config.datasets[0];
            dataset.variables_to_download.clear();
            dataset.configuration_groups = vec![
                ConfigurationGroup {
                    name: "monthly atmosphere".to_string(),
                    variables: vec!["tas".to_string(), "pr".to_string()],
                    mip_tables: Some(vec!["Amon".to_string()]),
                    time_periods: None,
                },
                ConfigurationGroup {
                    name: "daily extremes".to_string(),
                    variables: vec!["tasmax".to_string(), "tasmin".to_string()],
                    mip_tables: Some(vec!["day".to_string()]),
                    time_periods: Some(vec![
                        TimePeriod::Label("19500101-19991231".to_string()),
                        TimePeriod::Label("20000101-20141231".to_string()),
                    ]),
                },
            ];
        }
        TemplateType::Search => {
            config.url_source = UrlSource::Search;
            config.search = Some(SearchSettings::default());
            let dataset = &mut config.datasets[0];
            dataset.url_template.clear();
            dataset.grids_to_try.clear();
            dataset.versions = None;
            dataset.mip_tables_to_try.clear();
            dataset.time_periods.clear();
        }
    }
    config
}

/// Serialises a configuration in the requested format.
pub fn render_config(config: &MirrorConfig, format: ConfigFormat) -> Result<String, ConfigError> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}
