use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use ncmirror::catalog::{enumerate, SEARCH_ORDER, TEMPLATE_ORDER};
use ncmirror::cli::{generate_template, render_config, Cli, Commands, Overrides};
use ncmirror::config::{MirrorConfig, UrlSource};
use ncmirror::fetch::{Fetcher, HttpTransport};
use ncmirror::log::{
    config_echo, init, level_from_flags, show_farewell, show_greeting, show_summary, show_validation_report,
    LogHandle,
};
use ncmirror::pipeline::Orchestrator;
use ncmirror::resolve::{expand_template, TemplateResolver, UrlResolver};
use ncmirror::search::SearchResolver;
use ncmirror::subset::NetcdfSubsetter;
use ncmirror::validate::Validator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = init(level_from_flags(cli.verbose, cli.quiet, None));

    match cli.command {
        Commands::Template {
            template_type,
            ref output,
            format,
        } => {
            let rendered = render_config(&generate_template(template_type), format)?;
            write_or_print(output.as_deref(), rendered.as_bytes())
        }
        Commands::Completions { shell, ref output } => {
            let mut buf = Vec::new();
            clap_complete::generate(shell, &mut Cli::command(), "ncmirror", &mut buf);
            write_or_print(output.as_deref(), &buf)
        }
        Commands::Search {
            ref model,
            ref experiment,
            ref variable,
            ref member,
        } => {
            // an ad-hoc query works without a configuration file
            let settings = if cli.config.exists() {
                load_config(&cli.config)?.search_settings()
            } else {
                Default::default()
            };
            let resolver = SearchResolver::new(settings)?;
            let urls = resolver
                .find_download_urls(model, experiment, variable, member.as_deref())
                .await?;
            for url in &urls {
                println!("{url}");
            }
            Ok(())
        }
        _ => run_configured(&cli, &logger).await,
    }
}

async fn run_configured(cli: &Cli, logger: &LogHandle) -> Result<()> {
    let start = Instant::now();
    let config_path = cli.config.display().to_string();
    show_greeting(&config_path);

    let mut config = load_config(&cli.config)?;
    let overrides = match &cli.command {
        Commands::Run {
            insecure,
            concurrency,
            base_path,
            ..
        } => Overrides {
            base_path: base_path.clone(),
            insecure: *insecure,
            concurrency: *concurrency,
        },
        Commands::Validate { base_path } => Overrides {
            base_path: base_path.clone(),
            ..Overrides::default()
        },
        _ => Overrides::default(),
    };
    overrides.apply(&mut config);
    logger.set_level(level_from_flags(cli.verbose, cli.quiet, config.log_level.as_deref()));

    let warnings = match config.validate() {
        Ok(warnings) => warnings,
        Err(e) => {
            error!("[{}] {e}", ncmirror::error::Classify::kind(&e));
            bail!("configuration {config_path} rejected: {e}");
        }
    };
    config_echo(&config);

    match &cli.command {
        Commands::Run { dry_run: true, .. } => {
            for warning in &warnings {
                warn!("{warning}");
            }
            dry_run(&config)?;
        }
        Commands::Run { progress, .. } => {
            attach(logger, &config.log_path())?;
            run_pipeline(&config, *progress).await?;
        }
        Commands::Validate { .. } => {
            attach(logger, &config.validation_log_path())?;
            let report = Validator::new(&config).run();
            show_validation_report(&report);
            if !report.is_clean() {
                show_farewell(start.elapsed());
                bail!("validation found {} failed checks", report.failed);
            }
        }
        Commands::Check => {
            for warning in &warnings {
                warn!("{warning}");
            }
            let order = match config.url_source {
                UrlSource::Template => TEMPLATE_ORDER,
                UrlSource::Search => SEARCH_ORDER,
            };
            println!("\nEnumeration:");
            for dataset in &config.datasets {
                let count = enumerate(std::slice::from_ref(dataset), order).count();
                println!("  {}: {} candidates x {} regions", dataset.name, count, config.regions().len());
            }
            println!("Configuration OK");
        }
        Commands::Search { .. } | Commands::Template { .. } | Commands::Completions { .. } => {}
    }

    show_farewell(start.elapsed());
    Ok(())
}

async fn run_pipeline(config: &MirrorConfig, progress: bool) -> Result<()> {
    let fetcher = Fetcher::new(HttpTransport::new(&config.transport)?);
    let subsetter = NetcdfSubsetter::default();
    match config.url_source {
        UrlSource::Template => drive(config, fetcher, subsetter, TemplateResolver, progress).await,
        UrlSource::Search => {
            let resolver = SearchResolver::new(config.search_settings())?;
            drive(config, fetcher, subsetter, resolver, progress).await
        }
    }
}

async fn drive<R: UrlResolver>(
    config: &MirrorConfig,
    fetcher: Fetcher<HttpTransport>,
    subsetter: NetcdfSubsetter,
    resolver: R,
    progress: bool,
) -> Result<()> {
    let mut orchestrator = Orchestrator::new(config, fetcher, subsetter, resolver)?;
    if progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos} candidates {msg}")?);
        bar.enable_steady_tick(Duration::from_millis(120));
        orchestrator = orchestrator.with_progress(bar);
    }
    let summary = orchestrator.run().await?;
    show_summary(&summary);
    Ok(())
}

/// Lists candidates (and template URLs) without any network or disk access.
fn dry_run(config: &MirrorConfig) -> Result<()> {
    let regions = config.regions();
    let mut total = 0usize;
    for dataset in &config.datasets {
        println!("\n{} ({} / {})", dataset.name, dataset.model, dataset.experiment);
        let order = match config.url_source {
            UrlSource::Template => TEMPLATE_ORDER,
            UrlSource::Search => SEARCH_ORDER,
        };
        for candidate in enumerate(std::slice::from_ref(dataset), order) {
            total += 1;
            match config.url_source {
                UrlSource::Template => {
                    let url = expand_template(&dataset.url_template, &candidate)
                        .with_context(|| format!("expanding template for {candidate}"))?;
                    println!("  {url}");
                }
                UrlSource::Search => println!("  search: {candidate}"),
            }
        }
    }
    println!("\n{total} candidates, {} regions", regions.len());
    info!("Dry run finished; nothing was downloaded");
    Ok(())
}

fn load_config(path: &Path) -> Result<MirrorConfig> {
    MirrorConfig::from_file(path).with_context(|| format!("loading configuration {}", path.display()))
}

fn attach(logger: &LogHandle, path: &Path) -> Result<()> {
    logger
        .attach_file(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn write_or_print(output: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Written to {}", path.display());
        }
        None => std::io::stdout().write_all(bytes)?,
    }
    Ok(())
}
