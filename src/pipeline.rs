use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::health;
use crate::import::{ImportOptions, run_import};
use crate::precheck::validate_batches;
use crate::records::{LeagueBatch, discover_league_files, load_league_file, write_league_file};
use crate::report::{BatchReport, RunOutcome};
use crate::store::open_db;

pub struct RunResult {
    pub report: BatchReport,
    /// Where the report landed; `None` only if writing it failed.
    pub report_path: Option<PathBuf>,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code
    }
}

/// Validate, gate, import, score. Always produces a report, whatever the outcome.
pub fn run(config: &PipelineConfig) -> RunResult {
    let mut report = BatchReport::new(config.environment.as_str(), config.dry_run);
    match execute(config, &mut report) {
        Ok(outcome) => report.succeed(outcome),
        Err(err) => {
            match err.severity() {
                crate::error::Severity::Critical => error!(error = %err, "CRITICAL: pipeline failed"),
                _ => warn!(error = %err, "pipeline stopped"),
            }
            report.fail(&err);
        }
    }

    let path = config
        .report_path
        .clone()
        .unwrap_or_else(|| BatchReport::default_path(&config.report_dir));
    let report_path = match report.write(&path) {
        Ok(()) => {
            info!(path = %path.display(), "wrote run report");
            Some(path)
        }
        Err(err) => {
            error!(error = %err, "failed to write run report");
            None
        }
    };
    RunResult {
        report,
        report_path,
    }
}

fn execute(config: &PipelineConfig, report: &mut BatchReport) -> Result<RunOutcome, PipelineError> {
    config.validate()?;

    let mut batches = load_batches(config).map_err(PipelineError::Input)?;
    report.files = batches.iter().filter_map(|b| b.path.clone()).collect();
    let records: usize = batches.iter().map(LeagueBatch::len).sum();
    info!(leagues = batches.len(), records, "loaded league files");

    let outcome = validate_batches(&mut batches, &config.rules, config.flag_threshold);
    let gate = outcome.report.gate_error();
    info!(
        total = outcome.report.total(),
        corrected = outcome.report.corrected(),
        flagged = outcome.report.flagged(),
        "pre-import validation complete"
    );
    report.precheck = Some(outcome.report);
    if let Some(err) = gate {
        return Err(err);
    }

    if config.auto_fix {
        for batch in batches.iter().filter(|b| b.path.is_some()) {
            let path = write_league_file(batch).map_err(PipelineError::Input)?;
            info!(path = %path.display(), "wrote corrections back to source");
            report.auto_fixed.push(path);
        }
    }

    if config.dry_run {
        info!("dry run, store left untouched");
        return Ok(RunOutcome::Validated);
    }

    let mut conn = open_db(&config.db_path).map_err(PipelineError::Store)?;
    let opts = ImportOptions {
        environment: config.environment.as_str().to_string(),
        lock_path: config.lock_path(),
        lock_timeout: config.lock_timeout,
        backup_dir: (!config.no_backup).then(|| config.backup_dir.clone()),
        allow_shrink: config.allow_shrink,
        discard_backup_on_success: false,
    };
    match run_import(&mut conn, &outcome.matches, &config.rules, &opts) {
        Ok(import) => report.import = Some(import),
        Err(failure) => {
            report.import = Some(failure.report);
            return Err(failure.error);
        }
    }

    let health = health::evaluate(&conn, config.health_threshold).map_err(PipelineError::Store)?;
    match health::write_artifact(&health, &config.report_dir) {
        Ok(path) => report.health_artifact = Some(path),
        Err(err) => warn!(error = %err, "could not write health artifact"),
    }
    let passed = health.passed;
    report.health = Some(health);
    if !passed {
        warn!("health score below deployment threshold");
        return Ok(RunOutcome::Unhealthy);
    }
    Ok(RunOutcome::Imported)
}

fn load_batches(config: &PipelineConfig) -> anyhow::Result<Vec<LeagueBatch>> {
    let mut found = Vec::new();
    if let Some(dir) = &config.data_dir {
        found.extend(discover_league_files(dir)?);
    }
    found.extend(config.files.iter().cloned());
    // A file named both explicitly and through the data dir is loaded once.
    let paths: BTreeSet<PathBuf> = found
        .into_iter()
        .map(|path| fs::canonicalize(&path).unwrap_or(path))
        .collect();

    let mut batches = Vec::new();
    for path in paths {
        let mut batch = load_league_file(&path)?;
        batch.records.retain(|r| config.wants_league(&r.league_code));
        if batch.is_empty() && !config.wants_league(&batch.league_code) {
            continue;
        }
        batches.push(batch);
    }
    Ok(batches)
}
