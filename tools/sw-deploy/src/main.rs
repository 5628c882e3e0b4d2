//! Deploy tooling for the Animart offline worker.
//!
//! Provides commands for:
//! - Validating a worker config before it ships
//! - Stamping a content-derived cache generation so manifest changes always
//!   bump it
//! - Simulating install/activate against a live origin and probing offline
//!
//! ## Usage
//!
//! ```bash
//! # Validate a config
//! sw-deploy check deploy/worker.json
//!
//! # Derive the generation name from the manifest and write it back
//! sw-deploy stamp deploy/worker.json --prefix animart --write
//!
//! # Install against the real origin, then replay navigations offline
//! sw-deploy simulate deploy/worker.json --probe /listing/1 --report report.json
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use animart_common::{init_logging, AnimartError, LogConfig, LogFormat};
use animart_net::{HttpFetcher, LoaderConfig};
use animart_sw::{CacheGeneration, WorkerConfig};
use tracing::{info, warn};

mod simulate;

#[derive(Parser)]
#[command(name = "sw-deploy")]
#[command(about = "Deploy tooling for the Animart offline worker")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a worker config
    Check {
        /// Worker config (JSON)
        config: PathBuf,
    },

    /// Derive the cache generation from the manifest digest
    Stamp {
        /// Worker config (JSON)
        config: PathBuf,
        /// Generation name prefix
        #[arg(short, long, default_value = "animart")]
        prefix: String,
        /// Rewrite the config file with the new generation
        #[arg(short, long)]
        write: bool,
    },

    /// Install against the live origin, then probe offline
    Simulate {
        /// Worker config (JSON)
        config: PathBuf,
        /// Extra root-relative paths to probe offline
        #[arg(long)]
        probe: Vec<String>,
        /// Output JSON report path
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format))?;

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(&config)?;
            println!("Config OK:");
            println!("  Origin:      {}", config.origin);
            println!("  Scope:       {}", config.scope);
            println!("  Generation:  {}", config.cache_name);
            println!("  Strategy:    {}", config.strategy);
            println!("  Skip wait:   {}", config.skip_waiting);
            println!("  Claim:       {}", config.clients_claim);
            println!("  Manifest:    {} entries", config.manifest.len());
            for entry in config.manifest.entries() {
                println!("    {}", entry);
            }
        }

        Commands::Stamp {
            config,
            prefix,
            write,
        } => {
            let (previous, generation) = stamp(&config, &prefix, write)?;
            if previous == generation {
                println!("Generation unchanged: {}", generation);
            } else {
                println!("Generation: {} -> {}", previous, generation);
                if write {
                    println!("Written to: {}", config.display());
                }
            }
        }

        Commands::Simulate {
            config,
            probe,
            report,
        } => {
            let config = load_config(&config)?;
            let fetcher = HttpFetcher::new(LoaderConfig::default())?;
            let result = simulate::simulate(config, fetcher, &probe).await?;

            for probe in &result.probes {
                match (&probe.error, probe.from_cache) {
                    (Some(error), _) => {
                        warn!(path = %probe.path, %error, "Offline probe failed")
                    }
                    (None, from_cache) => {
                        info!(path = %probe.path, from_cache, "Offline probe served")
                    }
                }
            }

            let json = serde_json::to_string_pretty(&result)?;
            match report {
                Some(report_path) => {
                    std::fs::write(&report_path, json)?;
                    println!("Report written to: {}", report_path.display());
                }
                None => println!("{}", json),
            }

            if !result.passed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<WorkerConfig, AnimartError> {
    WorkerConfig::from_file(path).map_err(|e| {
        warn!(
            path = %path.display(),
            category = e.category(),
            error = %e,
            "Cannot load worker config"
        );
        e
    })
}

/// Derive the content-based generation for the config at `path`, optionally
/// writing it back. Returns the previous and the derived generation.
fn stamp(
    path: &Path,
    prefix: &str,
    write: bool,
) -> Result<(CacheGeneration, CacheGeneration), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    let previous = config.cache_name.clone();
    let stamped = config.with_generation_from_manifest(prefix);
    let generation = stamped.cache_name.clone();

    if write && previous != generation {
        std::fs::write(path, stamped.to_json()?)?;
    }

    Ok((previous, generation))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "origin": "https://shop.test",
        "cache_name": "animart-v1",
        "manifest": ["/", "/index.html"]
    }"#;

    #[test]
    fn test_stamp_dry_run_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, CONFIG).unwrap();

        let (previous, generation) = stamp(&path, "animart", false).unwrap();
        assert_eq!(previous.as_str(), "animart-v1");
        assert_ne!(previous, generation);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[test]
    fn test_stamp_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, CONFIG).unwrap();

        let (_, generation) = stamp(&path, "animart", true).unwrap();
        let reloaded = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.cache_name, generation);

        let (previous, again) = stamp(&path, "animart", true).unwrap();
        assert_eq!(previous, again);
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "sw-deploy",
            "simulate",
            "worker.json",
            "--probe",
            "/listing/1",
            "--probe",
            "/cart",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Simulate { probe, report, .. } => {
                assert_eq!(probe, vec!["/listing/1", "/cart"]);
                assert!(report.is_none());
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_load_config_reports_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{"origin": "https://shop.test", "cache_name": "v1", "manifest": []}"#)
            .unwrap();

        let err = load_config(&path).unwrap_err();
        assert_eq!(err.category(), "config");

        let missing = load_config(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(missing.category(), "io");
    }
}
