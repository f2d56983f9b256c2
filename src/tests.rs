use crate::config::MirrorConfig;
use crate::fetch::mock::MockTransport;
use crate::fetch::{Fetcher, PART_SUFFIX};
use crate::pipeline::{Orchestrator, PipelineError, RunSummary};
use crate::resolve::TemplateResolver;
use crate::subset::fixtures::write_standard;
use crate::subset::NetcdfSubsetter;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FILENAME: &str = "tas_hist_X.nc";

const DATASET: &str = "datasets:
  - name: demo
    model: X
    experiment: hist
    url_template: 'http://example/{variable}_{experiment}_{model}.nc'
    ensemble_members: [r1i1p1f1]
    grids_to_try: [gn]
    variables_to_download: [tas]
    mip_tables_to_try: [Amon]
    time_periods:
      - { period_string: '185001-185003', start_year: 1850, end_year: 1850 }
";

/// Bytes of a small but real NetCDF file the mock transport can serve.
fn fixture_bytes(dir: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let source = dir.join("source.nc");
    write_standard(&source)?;
    Ok(std::fs::read(source)?)
}

fn region_yaml(name: &str, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> String {
    format!(
        "  - name: {name}\n    bounding_box: {{ min_lat: {min_lat}, max_lat: {max_lat}, min_lon: {min_lon}, max_lon: {max_lon} }}\n"
    )
}

fn mirror_config(base: &Path, regions: &[String]) -> MirrorConfig {
    let mut yaml = format!(
        "base_data_path: {}\nlog_file: pipeline.log\nraw_data_dir: raw\n\
         variable_categories:\n  temperature: [tas]\n",
        base.display()
    );
    if regions.is_empty() {
        yaml.push_str("processing_regions: []\n");
    } else {
        yaml.push_str("processing_regions:\n");
        for region in regions {
            yaml.push_str(region);
        }
    }
    yaml.push_str(DATASET);
    MirrorConfig::from_yaml(&yaml).unwrap()
}

fn test_region() -> String {
    region_yaml("TestRegion", -10.0, 10.0, 20.0, 40.0)
}

async fn run_once(config: &MirrorConfig, body: &[u8]) -> Result<(RunSummary, usize), PipelineError> {
    let orchestrator = Orchestrator::new(
        config,
        Fetcher::new(MockTransport::serving(body)),
        NetcdfSubsetter::default(),
        TemplateResolver,
    )?;
    let summary = orchestrator.run().await?;
    Ok((summary, orchestrator.fetcher().transport().calls()))
}

fn processed(base: &Path, region: &str) -> PathBuf {
    base.join(region).join("X").join("hist").join("temperature").join(FILENAME)
}

#[cfg(test)]
mod end_to_end_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_region_scenario() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[test_region()]);

        let (summary, calls) = run_once(&config, &body).await?;

        assert_eq!(calls, 1);
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.subsets_written, 1);
        assert_eq!(summary.failures(), 0);

        let raw = base.join("raw").join(FILENAME);
        assert_eq!(std::fs::read(&raw)?, body);

        let out = netcdf::open(processed(&base, "TestRegion"))?;
        let lat: Vec<f64> = out.variable("lat").unwrap().get_values(..)?;
        let lon: Vec<f64> = out.variable("lon").unwrap().get_values(..)?;
        assert_eq!(lat, vec![-10.0, 0.0, 10.0]);
        assert_eq!(lon, vec![20.0, 30.0, 40.0]);
        assert_eq!(out.dimension("time").unwrap().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_performs_no_work() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[test_region()]);

        run_once(&config, &body).await?;
        let out = processed(&base, "TestRegion");
        let first_write = std::fs::metadata(&out)?.modified()?;

        let (summary, calls) = run_once(&config, &body).await?;
        assert_eq!(calls, 0);
        assert_eq!(summary.fetch_skipped, 1);
        assert_eq!(summary.subsets_skipped, 1);
        assert_eq!(summary.fetched + summary.subsets_written, 0);
        assert_eq!(std::fs::metadata(&out)?.modified()?, first_write);
        Ok(())
    }

    #[tokio::test]
    async fn test_one_download_feeds_every_region() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let regions = [
            test_region(),
            region_yaml("South", -20.0, -10.0, 0.0, 350.0),
            region_yaml("Dateline", -5.0, 5.0, -20.0, 10.0),
        ];
        let config = mirror_config(&base, &regions);

        let (summary, calls) = run_once(&config, &body).await?;
        assert_eq!(calls, 1);
        assert_eq!(summary.subsets_written, 3);
        for name in ["TestRegion", "South", "Dateline"] {
            assert!(processed(&base, name).is_file(), "{name} missing");
        }

        // -20..10 on a 0..350 grid picks 340, 350, 0 and 10
        let dateline = netcdf::open(processed(&base, "Dateline"))?;
        assert_eq!(dateline.dimension("lon").unwrap().len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[test_region()]);

        let orchestrator = Orchestrator::new(
            &config,
            Fetcher::new(MockTransport::failing_after(&body, 100)),
            NetcdfSubsetter::default(),
            TemplateResolver,
        )?;
        let summary = orchestrator.run().await?;

        assert_eq!(summary.fetch_failed, 1);
        assert_eq!(summary.subsets_written + summary.subsets_failed, 0);
        let raw = base.join("raw").join(FILENAME);
        assert!(!raw.exists());
        assert!(!base.join("raw").join(format!("{FILENAME}{PART_SUFFIX}")).exists());
        assert!(!base.join("TestRegion").exists());

        // the next run starts from scratch and succeeds
        let (summary, calls) = run_once(&config, &body).await?;
        assert_eq!(calls, 1);
        assert_eq!(summary.subsets_written, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_regions_create_nothing() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[]);

        let result = run_once(&config, b"unused").await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_legacy_scope_writes_flat_layout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let yaml = format!(
            "base_data_path: {}\nlog_file: pipeline.log\nraw_data_dir: raw\n\
             variable_categories:\n  temperature: [tas]\n\
             geographical_scope: {{ min_lat: -10, max_lat: 10, min_lon: 20, max_lon: 40 }}\n{DATASET}",
            base.display()
        );
        let config = MirrorConfig::from_yaml(&yaml)?;

        let (summary, _) = run_once(&config, &body).await?;
        assert_eq!(summary.subsets_written, 1);
        assert!(base.join("X").join("hist").join("temperature").join(FILENAME).is_file());
        assert!(!base.join("default").exists());
        Ok(())
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;
    use crate::validate::Validator;

    #[tokio::test]
    async fn test_fresh_mirror_validates_clean() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[test_region()]);
        run_once(&config, &body).await?;

        let report = Validator::new(&config).run();
        assert_eq!(report.files_expected, 1);
        assert_eq!(report.files_checked, 1);
        assert!(report.is_clean(), "{report:?}");
        // raw format, time coverage, processed format, consistency
        assert_eq!(report.passed, 4);
        // no validation_rules, so the data range check is skipped
        assert_eq!(report.skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_processed_file_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let body = fixture_bytes(dir.path())?;
        let base = dir.path().join("mirror");
        let config = mirror_config(&base, &[test_region()]);
        run_once(&config, &body).await?;
        std::fs::remove_file(processed(&base, "TestRegion"))?;

        let report = Validator::new(&config).run();
        assert_eq!(report.processed_missing, 1);
        assert!(!report.is_clean());
        Ok(())
    }

    #[test]
    fn test_nothing_downloaded_checks_nothing() {
        let dir = TempDir::new().unwrap();
        let config = mirror_config(dir.path(), &[test_region()]);

        let report = Validator::new(&config).run();
        assert_eq!(report.files_expected, 1);
        assert_eq!(report.files_checked, 0);
        assert!(report.is_clean());
    }
}
