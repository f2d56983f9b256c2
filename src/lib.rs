//! # ncmirror
//!
//! A Rust library for mirroring climate model NetCDF archives and cutting
//! regional subsets out of every mirrored file.
//!
//! ## Features
//!
//! - **Candidate enumeration**: the cross product of variables, MIP tables,
//!   ensemble members, grids, versions and time periods, optionally scoped by
//!   configuration groups
//! - **Two URL sources**: URL templates with named placeholders, or a search
//!   service returning prioritised download links
//! - **Idempotent fetch-then-subset**: a file on disk is never fetched or written
//!   again, and partial files never survive a failure
//! - **Validation**: format, time coverage, value range and raw/processed mean
//!   agreement
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ncmirror::config::MirrorConfig;
//! use ncmirror::fetch::{Fetcher, HttpTransport};
//! use ncmirror::pipeline::Orchestrator;
//! use ncmirror::resolve::TemplateResolver;
//! use ncmirror::subset::NetcdfSubsetter;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MirrorConfig::from_file("config.yaml")?;
//! let fetcher = Fetcher::new(HttpTransport::new(&config.transport)?);
//! let orchestrator = Orchestrator::new(&config, fetcher, NetcdfSubsetter::default(), TemplateResolver)?;
//! let summary = orchestrator.run().await?;
//! println!("{} subsets written", summary.subsets_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! base_data_path: ./climate_data
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
//!     url_template: "http://example/{variable}_{experiment}_{model}.nc"
//!     ensemble_members: [r1i1p1f1]
//!     grids_to_try: [gn]
//!     variables_to_download: [tas]
//!     mip_tables_to_try: [Amon]
//!     time_periods: ["185001-201412"]
//! ```

pub mod calendar;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod log;
pub mod pipeline;
pub mod resolve;
pub mod search;
pub mod storage;
pub mod subset;
pub mod validate;

#[cfg(test)]
mod cli_tests;
#[cfg(test)]
mod tests;
