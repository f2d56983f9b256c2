//! # Pipeline Orchestration Module
//!
//! Drives one mirror run:
//!
//! ```text
//! ValidateConfig -> PrepareStorage -> for each dataset:
//!     for each candidate: Resolve -> Fetch -> for each region: Subset
//! -> Finish
//! ```
//!
//! A configuration error aborts before anything touches the network or the
//! filesystem. Every other failure is logged against its candidate and the
//! enumeration moves on. Each raw file is fetched once no matter how many
//! regions are configured, and URLs already handled in this run are skipped.
//!
//! Candidates are processed through a bounded `buffer_unordered` window; the
//! default window of one keeps the run strictly sequential.

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

use crate::catalog::{enumerate, CandidateRequest};
use crate::config::{ConfigError, DatasetSpec, MirrorConfig, RegionSpec};
use crate::error::{Classify, ErrorKind};
use crate::fetch::{Fetch, FetchStatus, RawFile};
use crate::resolve::UrlResolver;
use crate::storage::{StorageError, StorageGuard, StorageLayout};
use crate::subset::{Subset, SubsetOutcome};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(e) => e.kind(),
            PipelineError::Storage(e) => e.kind(),
        }
    }
}

/// Counters of one run (or one candidate, before they are added up).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    /// Candidates for which no URL could be produced
    pub unresolved: usize,
    /// URLs already handled earlier in this run
    pub duplicates: usize,
    pub fetched: usize,
    pub fetch_skipped: usize,
    pub fetch_failed: usize,
    pub subsets_written: usize,
    pub subsets_skipped: usize,
    pub subsets_failed: usize,
}

impl RunSummary {
    fn absorb(&mut self, other: RunSummary) {
        self.candidates += other.candidates;
        self.unresolved += other.unresolved;
        self.duplicates += other.duplicates;
        self.fetched += other.fetched;
        self.fetch_skipped += other.fetch_skipped;
        self.fetch_failed += other.fetch_failed;
        self.subsets_written += other.subsets_written;
        self.subsets_skipped += other.subsets_skipped;
        self.subsets_failed += other.subsets_failed;
    }

    pub fn failures(&self) -> usize {
        self.fetch_failed + self.subsets_failed
    }
}

/// Runs the fetch-then-subset pipeline over every configured candidate.
pub struct Orchestrator<'a, F, S, R> {
    config: &'a MirrorConfig,
    layout: StorageLayout,
    regions: Vec<RegionSpec>,
    fetcher: F,
    subsetter: S,
    resolver: R,
    seen_urls: Mutex<HashSet<String>>,
    progress: Option<ProgressBar>,
}

impl<'a, F, S, R> Orchestrator<'a, F, S, R>
where
    F: Fetch,
    S: Subset,
    R: UrlResolver,
{
    /// Validates `config` and builds an orchestrator. Nothing is touched on disk.
    pub fn new(config: &'a MirrorConfig, fetcher: F, subsetter: S, resolver: R) -> Result<Self, PipelineError> {
        for warning in config.validate()? {
            warn!("{warning}");
        }
        Ok(Self {
            config,
            layout: StorageLayout::from_config(config),
            regions: config.regions(),
            fetcher,
            subsetter,
            resolver,
            seen_urls: Mutex::new(HashSet::new()),
            progress: None,
        })
    }

    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn subsetter(&self) -> &S {
        &self.subsetter
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Every (dataset, candidate) pair in enumeration order, lazily.
    pub fn candidates(&self) -> impl Iterator<Item = (&'a DatasetSpec, CandidateRequest)> + '_ {
        let order = self.resolver.order();
        self.config.datasets.iter().flat_map(move |dataset| {
            info!("===== Processing Dataset: {} =====", dataset.name);
            enumerate(std::slice::from_ref(dataset), order).map(move |candidate| (dataset, candidate))
        })
    }

    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        info!("--- Pipeline Started ---");
        self.layout.ensure_dirs()?;
        StorageGuard::new(self.config.storage.required_free_gb).check(self.layout.base());

        let window = self.config.transport.max_concurrent_downloads.max(1);
        let summary = stream::iter(self.candidates())
            .map(|(dataset, candidate)| self.process_candidate(dataset, candidate))
            .buffer_unordered(window)
            .fold(RunSummary::default(), |mut total, job| async move {
                total.absorb(job);
                total
            })
            .await;

        if let Some(bar) = &self.progress {
            bar.finish_with_message("done");
        }
        info!(
            "--- Pipeline Finished: {} candidates, {} downloaded, {} subsets written, {} failures ---",
            summary.candidates,
            summary.fetched,
            summary.subsets_written,
            summary.failures()
        );
        Ok(summary)
    }

    async fn process_candidate(&self, dataset: &DatasetSpec, candidate: CandidateRequest) -> RunSummary {
        let mut job = RunSummary {
            candidates: 1,
            ..RunSummary::default()
        };
        if let Some(bar) = &self.progress {
            bar.set_message(candidate.to_string());
            bar.inc(1);
        }

        let urls = match self.resolver.resolve(&candidate, dataset).await {
            Ok(urls) => urls,
            Err(e) => {
                error!("[{}] Could not resolve {candidate}: {e}", e.kind());
                job.unresolved += 1;
                return job;
            }
        };
        if urls.is_empty() {
            job.unresolved += 1;
            return job;
        }

        for url in urls {
            if !self.claim(&url) {
                job.duplicates += 1;
                continue;
            }
            match self.fetcher.fetch(&url, self.layout.raw_dir()).await {
                Ok(raw) => {
                    match raw.status {
                        FetchStatus::Downloaded { .. } => job.fetched += 1,
                        FetchStatus::AlreadyPresent => job.fetch_skipped += 1,
                    }
                    self.subset_regions(&candidate, &raw, &mut job);
                }
                Err(e) => {
                    error!("[{}] Fetch failed for {candidate}: {e}", e.kind());
                    job.fetch_failed += 1;
                }
            }
        }
        job
    }

    /// Marks `url` as handled; false when it already was.
    fn claim(&self, url: &str) -> bool {
        match self.seen_urls.lock() {
            Ok(mut seen) => seen.insert(url.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(url.to_string()),
        }
    }

    fn subset_regions(&self, candidate: &CandidateRequest, raw: &RawFile, job: &mut RunSummary) {
        let category = self.config.variable_categories.category_for(&candidate.variable);
        for region in &self.regions {
            let processed = self.layout.processed_path(
                &region.name,
                &candidate.model,
                &candidate.experiment,
                category,
                &raw.filename,
            );
            match self.subsetter.subset(&raw.path, &processed, &region.bounding_box) {
                Ok(SubsetOutcome::Written { .. }) => job.subsets_written += 1,
                Ok(SubsetOutcome::AlreadyExists) => job.subsets_skipped += 1,
                Err(e) => {
                    error!(
                        "[{}] Subset to region '{}' failed for {}: {e}",
                        e.kind(),
                        region.name,
                        raw.filename
                    );
                    job.subsets_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::config::BoundingBox;
    use crate::fetch::{FetchError, FetchResult};
    use crate::subset::SubsetResult;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    /// Records calls and pretends every URL downloads. URLs containing
    /// `fail` report a transport error.
    #[derive(Default)]
    pub struct CountingFetch {
        pub calls: Mutex<Vec<String>>,
    }

    impl CountingFetch {
        pub fn count(&self) -> usize {
            self.calls.lock().map(|c| c.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetch for CountingFetch {
        async fn fetch(&self, url: &str, target_dir: &Path) -> FetchResult<RawFile> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(url.to_string());
            }
            if url.contains("fail") {
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    source: crate::fetch::TransportError::Status(reqwest::StatusCode::NOT_FOUND),
                });
            }
            let filename = crate::resolve::url_filename(url).unwrap_or("unnamed.nc").to_string();
            Ok(RawFile {
                path: target_dir.join(&filename),
                filename,
                status: FetchStatus::Downloaded { bytes: 1 },
            })
        }
    }

    #[derive(Default)]
    pub struct CountingSubset {
        pub outputs: Mutex<Vec<PathBuf>>,
    }

    impl CountingSubset {
        pub fn count(&self) -> usize {
            self.outputs.lock().map(|o| o.len()).unwrap_or(0)
        }
    }

    impl Subset for CountingSubset {
        fn subset(&self, _raw: &Path, processed: &Path, _bbox: &BoundingBox) -> SubsetResult<SubsetOutcome> {
            if let Ok(mut outputs) = self.outputs.lock() {
                outputs.push(processed.to_path_buf());
            }
            Ok(SubsetOutcome::Written { cells: 1 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{CountingFetch, CountingSubset};
    use super::*;
    use crate::resolve::TemplateResolver;
    use tempfile::TempDir;

    fn config(base: &std::path::Path, regions: usize, extra: &str) -> MirrorConfig {
        let mut yaml = format!(
            "base_data_path: {}\nlog_file: pipeline.log\nraw_data_dir: raw\n\
             variable_categories:\n  temperature: [tas]\nprocessing_regions:\n",
            base.display()
        );
        for i in 0..regions {
            yaml.push_str(&format!(
                "  - name: R{i}\n    bounding_box: {{ min_lat: -10, max_lat: 10, min_lon: 20, max_lon: 40 }}\n"
            ));
        }
        if regions == 0 {
            yaml.push_str("  []\n");
        }
        yaml.push_str(extra);
        MirrorConfig::from_yaml(&yaml).unwrap()
    }

    const ONE_DATASET: &str = "datasets:
  - name: demo
    model: X
    experiment: hist
    url_template: 'http://example/{variable}_{experiment}_{model}.nc'
    ensemble_members: [r1]
    grids_to_try: [gn]
    variables_to_download: [tas]
    mip_tables_to_try: [Amon]
    time_periods: ['1850-1900']
";

    #[tokio::test]
    async fn test_one_fetch_many_subsets() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config(dir.path(), 3, ONE_DATASET);
        let orchestrator = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver)?;

        let summary = orchestrator.run().await?;
        assert_eq!(orchestrator.fetcher().count(), 1);
        assert_eq!(orchestrator.subsetter().count(), 3);
        assert_eq!(summary.subsets_written, 3);

        let outputs = orchestrator.subsetter().outputs.lock().unwrap().clone();
        assert_eq!(
            outputs[2],
            dir.path().join("R2").join("X").join("hist").join("temperature").join("tas_hist_X.nc")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_regions_abort_before_io() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("mirror");
        let config = config(&base, 0, ONE_DATASET);

        let result = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver);
        let err = result.err().expect("zero regions must be rejected");
        assert!(matches!(err, PipelineError::Config(ConfigError::NoRegions)));
        assert!(err.kind().is_fatal());
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_same_url_is_fetched_once_per_run() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        // the template ignores grid and member, so four candidates share one URL
        let extra = ONE_DATASET
            .replace("[r1]", "[r1, r2]")
            .replace("[gn]", "[gn, gr]");
        let config = config(dir.path(), 1, &extra);
        let orchestrator = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver)?;

        let summary = orchestrator.run().await?;
        assert_eq!(summary.candidates, 4);
        assert_eq!(summary.duplicates, 3);
        assert_eq!(orchestrator.fetcher().count(), 1);
        assert_eq!(orchestrator.subsetter().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_stop_siblings() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let extra = ONE_DATASET
            .replace("{variable}_{experiment}_{model}", "{variable}_{experiment}_{model}_{ensemble_member}")
            .replace("[r1]", "[fail, r2]");
        let config = config(dir.path(), 2, &extra);
        let orchestrator = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver)?;

        let summary = orchestrator.run().await?;
        assert_eq!(summary.fetch_failed, 1);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.subsets_written, 2);
        assert_eq!(orchestrator.fetcher().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_window_keeps_fan_out() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let extra = format!(
            "{}transport:\n  max_concurrent_downloads: 4\n",
            ONE_DATASET
                .replace("{variable}_{experiment}_{model}", "{variable}_{experiment}_{model}_{ensemble_member}")
                .replace("[r1]", "[r1, r2, r3, r4, r5]")
        );
        let config = config(dir.path(), 2, &extra);
        let orchestrator = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver)?;

        let summary = orchestrator.run().await?;
        assert_eq!(orchestrator.fetcher().count(), 5);
        assert_eq!(summary.subsets_written, 10);
        let mut outputs = orchestrator.subsetter().outputs.lock().unwrap().clone();
        outputs.sort();
        outputs.dedup();
        assert_eq!(outputs.len(), 10);
        Ok(())
    }

    #[test]
    fn test_uncategorized_variables_still_get_a_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let extra = ONE_DATASET.replace("[tas]", "[mrso]");
        let config = config(dir.path(), 1, &extra);
        let orchestrator = Orchestrator::new(&config, CountingFetch::default(), CountingSubset::default(), TemplateResolver)?;
        let layout = orchestrator.layout();
        let category = config.variable_categories.category_for("mrso");
        assert_eq!(
            layout.processed_path("R0", "X", "hist", category, "mrso_hist_X.nc"),
            dir.path().join("R0/X/hist/uncategorized/mrso_hist_X.nc")
        );
        Ok(())
    }
}
