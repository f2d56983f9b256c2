//! # CLI Integration Tests
//!
//! Argument parsing tests for the command-line interface: global flags,
//! subcommands, environment variables and value validation.

#[cfg(test)]
mod tests {
    use clap::Parser;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::cli::{Cli, Commands, ConfigFormat, TemplateType};

    // parsing reads NCMIRROR_* variables, so tests touching them run one at a time
    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    /// Test basic CLI argument parsing
    #[test]
    fn test_cli_help() {
        let result = Cli::try_parse_from(["ncmirror", "--help"]);
        assert!(result.is_err()); // --help causes early exit with "error"

        let error = result.unwrap_err();
        assert!(error.to_string().contains("Mirror climate model NetCDF files"));
    }

    #[test]
    fn test_cli_version() {
        let result = Cli::try_parse_from(["ncmirror", "--version"]);
        assert!(result.is_err());
    }

    /// Test global flags
    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["ncmirror", "-vv", "--config", "/path/to/mirror.json", "check"]);

        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
        assert_eq!(cli.config, PathBuf::from("/path/to/mirror.json"));
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_default_config_path() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let cli = Cli::parse_from(["ncmirror", "validate"]);
        if std::env::var_os("NCMIRROR_CONFIG").is_none() {
            assert_eq!(cli.config, PathBuf::from("config.yaml"));
        }
    }

    #[test]
    fn test_run_command_flags() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let cli = Cli::parse_from([
            "ncmirror",
            "run",
            "--dry-run",
            "--insecure",
            "--concurrency",
            "4",
            "--progress",
            "--base-path",
            "/scratch/mirror",
        ]);

        if let Commands::Run {
            dry_run,
            insecure,
            concurrency,
            progress,
            base_path,
        } = &cli.command
        {
            assert!(*dry_run);
            assert!(*insecure);
            assert_eq!(*concurrency, Some(4));
            assert!(*progress);
            assert_eq!(base_path, &Some(PathBuf::from("/scratch/mirror")));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_run_command_defaults() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let cli = Cli::parse_from(["ncmirror", "run"]);
        if let Commands::Run {
            dry_run,
            concurrency,
            base_path,
            ..
        } = &cli.command
        {
            assert!(!*dry_run);
            assert_eq!(*concurrency, None);
            assert_eq!(base_path, &None);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Cli::try_parse_from(["ncmirror", "run", "--concurrency", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_search_command() {
        let cli = Cli::parse_from([
            "ncmirror",
            "search",
            "-m",
            "MPI-ESM1-2-HR",
            "-e",
            "historical",
            "-n",
            "tas",
            "--member",
            "r1i1p1f1",
        ]);

        if let Commands::Search {
            model,
            experiment,
            variable,
            member,
        } = &cli.command
        {
            assert_eq!(model, "MPI-ESM1-2-HR");
            assert_eq!(experiment, "historical");
            assert_eq!(variable, "tas");
            assert_eq!(member.as_deref(), Some("r1i1p1f1"));
        } else {
            panic!("Expected Search command");
        }

        // the variable is required
        assert!(Cli::try_parse_from(["ncmirror", "search", "-m", "X", "-e", "hist"]).is_err());
    }

    #[test]
    fn test_template_command() {
        let cli = Cli::parse_from(["ncmirror", "template", "grouped", "--format", "json", "-o", "config.json"]);

        if let Commands::Template {
            template_type,
            output,
            format,
        } = &cli.command
        {
            assert_eq!(template_type, &TemplateType::Grouped);
            assert_eq!(output, &Some(PathBuf::from("config.json")));
            assert_eq!(format, &ConfigFormat::Json);
        } else {
            panic!("Expected Template command");
        }
    }

    #[test]
    fn test_template_types() {
        for (name, expected) in [
            ("basic", TemplateType::Basic),
            ("grouped", TemplateType::Grouped),
            ("search", TemplateType::Search),
        ] {
            let cli = Cli::parse_from(["ncmirror", "template", name]);
            match &cli.command {
                Commands::Template {
                    template_type, format, ..
                } => {
                    assert_eq!(template_type, &expected);
                    assert_eq!(format, &ConfigFormat::Yaml);
                }
                _ => panic!("Expected Template command"),
            }
        }
        assert!(Cli::try_parse_from(["ncmirror", "template", "ocean"]).is_err());
    }

    #[test]
    fn test_completions_command() {
        let cli = Cli::parse_from(["ncmirror", "completions", "zsh"]);
        assert!(matches!(cli.command, Commands::Completions { output: None, .. }));
    }

    /// Test conflicting verbose and quiet flags
    #[test]
    fn test_verbose_quiet_conflict() {
        let result = Cli::try_parse_from(["ncmirror", "--verbose", "--quiet", "check"]);
        assert!(result.is_err());

        let cli_quiet = Cli::parse_from(["ncmirror", "--quiet", "check"]);
        assert_eq!(cli_quiet.verbose, 0);
        assert!(cli_quiet.quiet);
    }

    /// Test environment variable handling
    #[test]
    fn test_environment_variables() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();

        let original_config = std::env::var("NCMIRROR_CONFIG").ok();
        let original_base = std::env::var("NCMIRROR_BASE_PATH").ok();
        unsafe {
            std::env::set_var("NCMIRROR_CONFIG", "/etc/ncmirror/cmip6.yaml");
            std::env::set_var("NCMIRROR_BASE_PATH", "/data/env_mirror");
        }

        let cli = Cli::parse_from(["ncmirror", "validate"]);
        assert_eq!(cli.config, PathBuf::from("/etc/ncmirror/cmip6.yaml"));
        if let Commands::Validate { base_path } = &cli.command {
            assert_eq!(base_path, &Some(PathBuf::from("/data/env_mirror")));
        } else {
            panic!("Expected Validate command");
        }

        // command line wins over the environment
        let cli = Cli::parse_from(["ncmirror", "--config", "local.json", "check"]);
        assert_eq!(cli.config, PathBuf::from("local.json"));

        unsafe {
            std::env::remove_var("NCMIRROR_CONFIG");
            std::env::remove_var("NCMIRROR_BASE_PATH");
            if let Some(val) = original_config {
                std::env::set_var("NCMIRROR_CONFIG", val);
            }
            if let Some(val) = original_base {
                std::env::set_var("NCMIRROR_BASE_PATH", val);
            }
        }
    }
}
