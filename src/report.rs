use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::error::{EXIT_FAILURE, EXIT_OK, PipelineError, Severity};
use crate::health::HealthReport;
use crate::import::ImportReport;
use crate::precheck::PrecheckReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Dry run finished; nothing was written to the store.
    Validated,
    Imported,
    /// Imported, but the health score is under the deployment threshold.
    Unhealthy,
    Refused,
    AlreadyRunning,
    RolledBack,
    Restored,
    /// The post-commit restore itself failed; the store needs manual recovery.
    RestoreFailed,
    Failed,
}

impl RunOutcome {
    fn for_error(err: &PipelineError) -> Self {
        match err {
            PipelineError::ImportPrecheckFailure(_) => RunOutcome::Refused,
            PipelineError::AlreadyRunning { .. } => RunOutcome::AlreadyRunning,
            PipelineError::TransactionFailure(_) | PipelineError::ConsistencyCheck(_) => {
                RunOutcome::RolledBack
            }
            PipelineError::RestoredFromBackup(_) => RunOutcome::Restored,
            PipelineError::RestoreFailure(_) => RunOutcome::RestoreFailed,
            _ => RunOutcome::Failed,
        }
    }
}

/// Machine-readable summary of one pipeline run. Written on success and on failure.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub environment: String,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub files: Vec<PathBuf>,
    pub auto_fixed: Vec<PathBuf>,
    pub precheck: Option<PrecheckReport>,
    pub import: Option<ImportReport>,
    pub health: Option<HealthReport>,
    pub health_artifact: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub severity: Severity,
    pub error: Option<String>,
    pub store_untouched: bool,
    pub exit_code: i32,
}

impl BatchReport {
    pub fn new(environment: &str, dry_run: bool) -> Self {
        Self {
            environment: environment.to_string(),
            dry_run,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            files: Vec::new(),
            auto_fixed: Vec::new(),
            precheck: None,
            import: None,
            health: None,
            health_artifact: None,
            outcome: RunOutcome::Failed,
            severity: Severity::Error,
            error: None,
            store_untouched: true,
            exit_code: EXIT_FAILURE,
        }
    }

    pub fn succeed(&mut self, outcome: RunOutcome) {
        let flagged = self
            .precheck
            .as_ref()
            .is_some_and(|p| p.flagged() > 0 || p.corrected() > 0);
        self.outcome = outcome;
        (self.severity, self.exit_code) = match outcome {
            RunOutcome::Unhealthy => (Severity::Error, EXIT_FAILURE),
            _ if flagged => (Severity::Warning, EXIT_OK),
            _ => (Severity::Info, EXIT_OK),
        };
        self.finished_at = Some(Utc::now().to_rfc3339());
    }

    pub fn fail(&mut self, err: &PipelineError) {
        self.outcome = RunOutcome::for_error(err);
        self.severity = err.severity();
        self.exit_code = err.exit_code();
        self.error = Some(err.to_string());
        self.store_untouched = err.store_untouched();
        self.finished_at = Some(Utc::now().to_rfc3339());
    }

    /// `import_<timestamp>.json` inside `dir`.
    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join(format!(
            "import_{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create report dir {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self).context("serialize batch report")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}
