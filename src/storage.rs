//! # Storage Layout Module
//!
//! This module owns the on-disk conventions of a mirror: where raw downloads
//! land, where each region's processed copy goes, and whether the target volume
//! has room for a run.
//!
//! ## Layouts
//!
//! - **Raw files**: `{base}/{raw_data_dir}/{filename}`
//! - **Regional** (default): `{base}/{region}/{model}/{experiment}/{category}/{filename}`
//! - **Flat** (legacy single region): `{base}/{model}/{experiment}/{category}/{filename}`
//!
//! The filesystem itself is the idempotency ledger: a path that exists is a
//! finished file, since every writer materialises through a `.part` file first.
//!
//! ## Usage Example
//!
//! ```rust
//! use ncmirror::config::OutputLayout;
//! use ncmirror::storage::StorageLayout;
//!
//! let layout = StorageLayout::new("/data", "raw", OutputLayout::Regional);
//! let path = layout.processed_path("TestRegion", "X", "hist", "temperature", "tas_hist_X.nc");
//! assert_eq!(path.to_str(), Some("/data/TestRegion/X/hist/temperature/tas_hist_X.nc"));
//! ```

use log::{info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{MirrorConfig, OutputLayout};
use crate::error::{Classify, ErrorKind};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Errors that can occur while preparing the mirror directories
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot query free space of {path}: {source}")]
    Statvfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Free space query is not supported on this platform")]
    Unsupported,
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            // nothing can be written without the base directories
            StorageError::CreateDir { .. } => ErrorKind::Configuration,
            StorageError::Statvfs { .. } | StorageError::Unsupported => ErrorKind::Transport,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Path conventions for one mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base: PathBuf,
    raw_dir: PathBuf,
    layout: OutputLayout,
}

impl StorageLayout {
    pub fn new<P: AsRef<Path>>(base: P, raw_data_dir: &str, layout: OutputLayout) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            raw_dir: base.join(raw_data_dir),
            base,
            layout,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(&config.base_data_path, &config.raw_data_dir, config.layout())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn raw_path(&self, filename: &str) -> PathBuf {
        self.raw_dir.join(filename)
    }

    /// Destination of one region's processed copy
    ///
    /// # Arguments
    /// * `region` - Region name; ignored by the flat layout
    /// * `model` / `experiment` - Dataset identity
    /// * `category` - Category directory of the variable
    /// * `filename` - File name shared with the raw file
    pub fn processed_path(
        &self,
        region: &str,
        model: &str,
        experiment: &str,
        category: &str,
        filename: &str,
    ) -> PathBuf {
        let root = match self.layout {
            OutputLayout::Regional => self.base.join(region),
            OutputLayout::Flat => self.base.clone(),
        };
        root.join(model).join(experiment).join(category).join(filename)
    }

    /// Creates the base and raw directories.
    pub fn ensure_dirs(&self) -> StorageResult<()> {
        for dir in [&self.base, &self.raw_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Result of a free space check
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceCheck {
    Sufficient { available_gb: f64 },
    Low { available_gb: f64, required_gb: f64 },
    Unknown(String),
}

/// Advisory free space check run before a mirror starts downloading.
#[derive(Debug, Clone)]
pub struct StorageGuard {
    required_gb: f64,
}

impl StorageGuard {
    pub fn new(required_gb: f64) -> Self {
        Self { required_gb }
    }

    /// Checks the volume holding `path` and logs the outcome
    ///
    /// # Returns
    /// The check result; a low or unknown result never stops a run
    pub fn check(&self, path: &Path) -> SpaceCheck {
        let result = match available_bytes(path) {
            Ok(bytes) => {
                let available_gb = bytes as f64 / BYTES_PER_GB;
                if available_gb < self.required_gb {
                    SpaceCheck::Low {
                        available_gb,
                        required_gb: self.required_gb,
                    }
                } else {
                    SpaceCheck::Sufficient { available_gb }
                }
            }
            Err(e) => SpaceCheck::Unknown(e.to_string()),
        };

        match &result {
            SpaceCheck::Sufficient { available_gb } => {
                info!("Storage check passed: {available_gb:.1} GB available at {}", path.display());
            }
            SpaceCheck::Low {
                available_gb,
                required_gb,
            } => {
                warn!(
                    "Low disk space at {}: {available_gb:.1} GB available, {required_gb:.1} GB recommended",
                    path.display()
                );
            }
            SpaceCheck::Unknown(reason) => {
                warn!("Storage check skipped: {reason}");
            }
        }
        result
    }
}

/// Bytes available to unprivileged users on the volume holding `path`.
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> StorageResult<u64> {
    let stat = rustix::fs::statvfs(path).map_err(|errno| StorageError::Statvfs {
        path: path.to_path_buf(),
        source: errno.into(),
    })?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> StorageResult<u64> {
    Err(StorageError::Unsupported)
}
