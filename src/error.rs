use serde::Serialize;
use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_REFUSED: i32 = 2;
pub const EXIT_ROLLED_BACK: i32 = 3;
pub const EXIT_CRITICAL: i32 = 4;
pub const EXIT_ALREADY_RUNNING: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Failures that end a pipeline run. Parse and policy problems never show up here;
/// they are aggregated into the batch report instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("input error: {0:#}")]
    Input(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
    #[error("import step `{step}` is not valid from state `{from}`")]
    InvalidTransition { from: &'static str, step: &'static str },
    #[error("import refused before any write: {0}")]
    ImportPrecheckFailure(String),
    #[error("another import is already running for `{environment}` (waited {waited_ms} ms)")]
    AlreadyRunning { environment: String, waited_ms: u128 },
    #[error("backup failed, nothing was changed: {0:#}")]
    BackupFailure(anyhow::Error),
    #[error("import transaction rolled back: {0:#}")]
    TransactionFailure(anyhow::Error),
    #[error("post-load consistency check failed, transaction rolled back: {0}")]
    ConsistencyCheck(String),
    #[error("committed data failed verification and was restored from backup: {0}")]
    RestoredFromBackup(String),
    #[error("restore from backup failed, store state is unknown: {0:#}")]
    RestoreFailure(anyhow::Error),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_)
            | PipelineError::Input(_)
            | PipelineError::Store(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::BackupFailure(_) => EXIT_FAILURE,
            PipelineError::ImportPrecheckFailure(_) => EXIT_REFUSED,
            PipelineError::AlreadyRunning { .. } => EXIT_ALREADY_RUNNING,
            PipelineError::TransactionFailure(_) | PipelineError::ConsistencyCheck(_) => {
                EXIT_ROLLED_BACK
            }
            PipelineError::RestoredFromBackup(_) | PipelineError::RestoreFailure(_) => EXIT_CRITICAL,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::ImportPrecheckFailure(_) | PipelineError::AlreadyRunning { .. } => {
                Severity::Warning
            }
            PipelineError::Config(_)
            | PipelineError::Input(_)
            | PipelineError::Store(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::TransactionFailure(_)
            | PipelineError::ConsistencyCheck(_) => Severity::Error,
            PipelineError::BackupFailure(_)
            | PipelineError::RestoredFromBackup(_)
            | PipelineError::RestoreFailure(_) => Severity::Critical,
        }
    }

    /// Whether the store was left exactly as it was before the run.
    pub fn store_untouched(&self) -> bool {
        !matches!(
            self,
            PipelineError::RestoredFromBackup(_) | PipelineError::RestoreFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_refusal_from_rollback() {
        let refused = PipelineError::ImportPrecheckFailure("NSTF flagged 40%".to_string());
        let rolled = PipelineError::TransactionFailure(anyhow::anyhow!("constraint"));
        assert_eq!(refused.exit_code(), EXIT_REFUSED);
        assert_eq!(rolled.exit_code(), EXIT_ROLLED_BACK);
        assert_ne!(refused.exit_code(), rolled.exit_code());
    }

    #[test]
    fn restore_problems_are_critical() {
        let err = PipelineError::RestoreFailure(anyhow::anyhow!("checksum mismatch"));
        assert_eq!(err.severity(), Severity::Critical);
        assert_eq!(err.exit_code(), EXIT_CRITICAL);
        assert!(!err.store_untouched());
    }
}
