use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use league_ingest::config::{Environment, PipelineConfig, load_dotenv};
use league_ingest::error::EXIT_FAILURE;
use league_ingest::league_rules::LeagueRules;
use league_ingest::pipeline;

#[derive(Parser)]
#[command(name = "league_ingest")]
#[command(about = "Validate scraped league results and import them atomically", long_about = None)]
struct Cli {
    /// League JSON files; combined with everything found in --data-dir.
    files: Vec<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Only import these league codes (repeatable).
    #[arg(long = "league")]
    leagues: Vec<String>,

    /// Run the pre-import validator only.
    #[arg(long)]
    dry_run: bool,

    /// Write corrected winners back into the source files.
    #[arg(long)]
    auto_fix: bool,

    #[arg(long, value_enum, default_value_t = Environment::Local)]
    environment: Environment,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    no_backup: bool,

    #[arg(long)]
    db: Option<PathBuf>,

    /// JSON file adding or overriding league rules.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Where to write the run report.
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long)]
    flag_threshold: Option<f64>,

    #[arg(long)]
    health_threshold: Option<f64>,

    #[arg(long)]
    lock_timeout_secs: Option<u64>,

    /// Permit tables to end up smaller than before the import.
    #[arg(long)]
    allow_shrink: bool,
}

impl Cli {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::from_env(self.environment)?;
        if let Some(path) = self.rules {
            config.rules = LeagueRules::from_file(&path)?;
        }
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if let Some(threshold) = self.flag_threshold {
            config.flag_threshold = threshold;
        }
        if let Some(threshold) = self.health_threshold {
            config.health_threshold = threshold;
        }
        if let Some(secs) = self.lock_timeout_secs {
            config.lock_timeout = Duration::from_secs(secs);
        }
        config.files = self.files;
        config.leagues = self.leagues;
        config.report_path = self.report;
        config.dry_run = self.dry_run;
        config.auto_fix = self.auto_fix;
        config.force = self.force;
        config.no_backup = self.no_backup;
        config.allow_shrink = self.allow_shrink;
        Ok(config)
    }
}

fn main() {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("league_ingest: {err:#}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let result = pipeline::run(&config);
    let report = &result.report;

    println!("League import {:?}", report.outcome);
    println!("Environment: {}", report.environment);
    println!("DB: {}", config.db_path.display());
    if let Some(precheck) = &report.precheck {
        println!(
            "Records: {} corrected={} flagged={}",
            precheck.total(),
            precheck.corrected(),
            precheck.flagged()
        );
        for league in &precheck.leagues {
            println!(
                "league {} ({}): total={} corrected={} flagged={} parse_errors={}",
                league.league,
                league.policy.as_str(),
                league.total,
                league.corrected,
                league.flagged,
                league.parse_errors
            );
        }
    }
    if let Some(load) = report.import.as_ref().and_then(|i| i.load.as_ref()) {
        println!(
            "Matches loaded: {} (merged {}, skipped {})",
            load.matches_loaded, load.duplicates_merged, load.skipped
        );
    }
    if let Some(health) = &report.health {
        println!("Health: {:.2} / threshold {:.2}", health.score, health.threshold);
        for issue in health.critical_issues.iter().take(8) {
            println!(" ! {issue}");
        }
    }
    if let Some(err) = &report.error {
        println!("Error: {err}");
    }
    match &result.report_path {
        Some(path) => println!("Report: {}", path.display()),
        None => println!("Report: not written"),
    }

    std::process::exit(result.exit_code());
}
