//! Logging setup and the human-facing lines printed around a run.
//!
//! Records go through the `log` facade to an `env_logger` backend that writes
//! every line to stderr and, once attached, to a log file as well. The file is
//! attached only after the configuration has been validated so a rejected
//! configuration leaves nothing on disk.

use chrono::Local;
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::MirrorConfig;
use crate::pipeline::RunSummary;
use crate::validate::ValidationReport;

/// Environment variable holding an `env_logger` filter that overrides the flags.
pub const LOG_ENV: &str = "NCMIRROR_LOG";

type SharedFile = Arc<Mutex<Option<File>>>;

/// Writes each record to stderr and to the attached file, if any.
struct TeeWriter {
    file: SharedFile,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                file.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// Handle returned by [`init`] to adjust the running logger.
#[derive(Clone)]
pub struct LogHandle {
    file: SharedFile,
    env_override: bool,
}

impl LogHandle {
    /// Starts appending every subsequent record to `path`.
    pub fn attach_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut guard) = self.file.lock() {
            *guard = Some(file);
        }
        Ok(())
    }

    /// Changes the level unless `NCMIRROR_LOG` pinned it.
    pub fn set_level(&self, level: LevelFilter) {
        if !self.env_override {
            log::set_max_level(level);
        }
    }
}

/// Installs the global logger. Call once, before anything logs.
pub fn init(level: LevelFilter) -> LogHandle {
    let env_override = std::env::var_os(LOG_ENV).is_some();
    let file: SharedFile = Arc::new(Mutex::new(None));

    let mut builder = Builder::new();
    // dependencies stay quiet unless asked for through NCMIRROR_LOG
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module("ncmirror", LevelFilter::Trace)
        .parse_env(Env::new().filter(LOG_ENV))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(TeeWriter { file: file.clone() })));

    if builder.try_init().is_err() {
        eprintln!("Logger already initialised; keeping the existing one");
    }

    let handle = LogHandle { file, env_override };
    handle.set_level(level);
    handle
}

/// Level from `-v` / `-q`, else the configured name, else `info`.
pub fn level_from_flags(verbose: u8, quiet: bool, configured: Option<&str>) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => configured
            .and_then(|name| LevelFilter::from_str(name.trim()).ok())
            .unwrap_or(LevelFilter::Info),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn show_greeting(config_path: &str) {
    println!("=== ncmirror: climate archive mirror ===");
    println!("Loading configuration from: {}", config_path);
}

pub fn config_echo(config: &MirrorConfig) {
    println!("\nConfiguration:");
    println!("  Base path: {}", config.base_data_path.display());
    println!("  Raw directory: {}", config.raw_dir().display());
    println!("  URL source: {:?}", config.url_source);
    println!("  Layout: {:?}", config.layout());
    let regions = config.regions();
    println!("  Regions: {}", regions.len());
    for region in &regions {
        let b = &region.bounding_box;
        println!(
            "    {}: lat [{}, {}] lon [{}, {}]",
            region.name, b.min_lat, b.max_lat, b.min_lon, b.max_lon
        );
    }
    println!("  Datasets: {}", config.datasets.len());
    for dataset in &config.datasets {
        println!(
            "    {} ({} / {}): {} variables",
            dataset.name,
            dataset.model,
            dataset.experiment,
            dataset.all_variables().len()
        );
    }
}

pub fn show_summary(summary: &RunSummary) {
    println!("\nRun summary:");
    println!("  Candidates: {}", summary.candidates);
    println!("  Duplicate URLs skipped: {}", summary.duplicates);
    println!("  Unresolved: {}", summary.unresolved);
    println!(
        "  Downloads: {} new, {} already present, {} failed",
        summary.fetched, summary.fetch_skipped, summary.fetch_failed
    );
    println!(
        "  Subsets: {} written, {} already present, {} failed",
        summary.subsets_written, summary.subsets_skipped, summary.subsets_failed
    );
}

pub fn show_validation_report(report: &ValidationReport) {
    println!("\nValidation report:");
    println!("  Files expected: {}", report.files_expected);
    println!("  Files present: {}", report.files_checked);
    println!("  Checks passed: {}", report.passed);
    println!("  Checks failed: {}", report.failed);
    println!("  Checks skipped: {}", report.skipped);
    println!("  Processed files missing: {}", report.processed_missing);
}

pub fn show_farewell(elapsed: Duration) {
    println!("\n=== Finished in {:.1}s ===", elapsed.as_secs_f64());
}
