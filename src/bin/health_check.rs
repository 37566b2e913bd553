use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use league_ingest::config::{Environment, PipelineConfig, load_dotenv};
use league_ingest::error::EXIT_FAILURE;
use league_ingest::health;
use league_ingest::store;

fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = PipelineConfig::from_env(Environment::Local)?;
    let db_path = parse_db_path_arg().unwrap_or_else(|| config.db_path.clone());
    if !db_path.exists() {
        return Err(anyhow!("no store at {}", db_path.display()));
    }
    let threshold = parse_threshold_arg()?.unwrap_or(config.health_threshold);

    let conn = store::open_db(&db_path)?;
    let report = health::evaluate(&conn, threshold)?;
    let artifact = health::write_artifact(&report, &config.report_dir)
        .context("write health artifact")?;

    println!("Health check {}", if report.passed { "passed" } else { "FAILED" });
    println!("DB: {}", db_path.display());
    println!("Score: {:.2} / threshold {:.2}", report.score, report.threshold);
    for (check, ratio) in &report.coverage_ratios_by_check {
        println!("{check}: {:.3}", ratio);
    }
    for league in &report.per_league {
        println!(
            "league {}: resolved {}/{} contribution={:.2}",
            league.league, league.resolved, league.matches, league.contribution
        );
    }
    if !report.critical_issues.is_empty() {
        println!("Critical: {}", report.critical_issues.len());
        for issue in report.critical_issues.iter().take(8) {
            println!(" - {issue}");
        }
    }
    for warning in report.warnings.iter().take(8) {
        println!("warning: {warning}");
    }
    println!("Artifact: {}", artifact.display());

    if !report.passed {
        std::process::exit(EXIT_FAILURE);
    }
    Ok(())
}

fn parse_db_path_arg() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db" {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}

fn parse_threshold_arg() -> Result<Option<f64>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        let raw = if let Some(raw) = arg.strip_prefix("--threshold=") {
            raw
        } else if arg == "--threshold" {
            let Some(next) = args.get(idx + 1) else {
                return Err(anyhow!("--threshold needs a value"));
            };
            next.as_str()
        } else {
            continue;
        };
        let value = raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid --threshold {raw}"))?;
        return Ok(Some(value));
    }
    Ok(None)
}
