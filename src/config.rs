use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use crate::error::PipelineError;
use crate::league_rules::{LeagueRules, normalize_league_code};

const APP_DIR: &str = "league_ingest";
pub const DEFAULT_FLAG_THRESHOLD: f64 = 0.10;
pub const DEFAULT_HEALTH_THRESHOLD: f64 = 90.0;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Local,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    fn db_env_key(self) -> &'static str {
        match self {
            Environment::Local => "LEAGUE_DB_LOCAL",
            Environment::Staging => "LEAGUE_DB_STAGING",
            Environment::Production => "LEAGUE_DB_PRODUCTION",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: Environment,
    pub db_path: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub files: Vec<PathBuf>,
    /// Only import these league codes when non-empty.
    pub leagues: Vec<String>,
    pub backup_dir: PathBuf,
    pub report_dir: PathBuf,
    pub report_path: Option<PathBuf>,
    pub rules: LeagueRules,
    pub flag_threshold: f64,
    pub health_threshold: f64,
    pub lock_timeout: Duration,
    pub dry_run: bool,
    pub auto_fix: bool,
    pub no_backup: bool,
    pub force: bool,
    pub allow_shrink: bool,
}

impl PipelineConfig {
    /// Defaults for `environment`, taken from `LEAGUE_*` variables where set.
    pub fn from_env(environment: Environment) -> Result<Self> {
        let base = app_data_dir().unwrap_or_else(|| PathBuf::from(".league_ingest"));
        let db_path = env_path(environment.db_env_key())
            .unwrap_or_else(|| base.join(format!("league_{}.sqlite", environment.as_str())));
        let rules = match env_path("LEAGUE_RULES_FILE") {
            Some(path) => LeagueRules::from_file(&path)?,
            None => LeagueRules::builtin(),
        };

        Ok(Self {
            environment,
            db_path,
            data_dir: env_path("LEAGUE_DATA_DIR"),
            files: Vec::new(),
            leagues: Vec::new(),
            backup_dir: env_path("LEAGUE_BACKUP_DIR").unwrap_or_else(|| base.join("backups")),
            report_dir: env_path("LEAGUE_REPORT_DIR").unwrap_or_else(|| base.join("reports")),
            report_path: None,
            rules,
            flag_threshold: env_f64("LEAGUE_FLAG_THRESHOLD").unwrap_or(DEFAULT_FLAG_THRESHOLD),
            health_threshold: env_f64("LEAGUE_HEALTH_THRESHOLD")
                .unwrap_or(DEFAULT_HEALTH_THRESHOLD),
            lock_timeout: Duration::from_secs(
                std::env::var("LEAGUE_LOCK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|val| val.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            ),
            dry_run: false,
            auto_fix: false,
            no_backup: false,
            force: false,
            allow_shrink: false,
        })
    }

    /// Self-contained config rooted at `dir`; ignores the process environment.
    pub fn in_dir(environment: Environment, dir: &Path) -> Self {
        Self {
            environment,
            db_path: dir.join(format!("league_{}.sqlite", environment.as_str())),
            data_dir: None,
            files: Vec::new(),
            leagues: Vec::new(),
            backup_dir: dir.join("backups"),
            report_dir: dir.join("reports"),
            report_path: None,
            rules: LeagueRules::builtin(),
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            dry_run: false,
            auto_fix: false,
            no_backup: false,
            force: false,
            allow_shrink: false,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.environment == Environment::Production && !self.force && !self.dry_run {
            return Err(PipelineError::Config(
                "production imports require --force".to_string(),
            ));
        }
        if self.environment == Environment::Production && self.no_backup && !self.force {
            return Err(PipelineError::Config(
                "--no-backup against production requires --force".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.flag_threshold) {
            return Err(PipelineError::Config(format!(
                "flag threshold must be within 0..=1, got {}",
                self.flag_threshold
            )));
        }
        if !(0.0..=100.0).contains(&self.health_threshold) {
            return Err(PipelineError::Config(format!(
                "health threshold must be within 0..=100, got {}",
                self.health_threshold
            )));
        }
        if self.data_dir.is_none() && self.files.is_empty() {
            return Err(PipelineError::Config(
                "no input: pass --data-dir, input files, or set LEAGUE_DATA_DIR".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wants_league(&self, code: &str) -> bool {
        self.leagues.is_empty()
            || self
                .leagues
                .iter()
                .any(|wanted| normalize_league_code(wanted) == normalize_league_code(code))
    }

    /// Advisory lock file guarding imports into this environment's store.
    pub fn lock_path(&self) -> PathBuf {
        let dir = self
            .db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(format!(".import-{}.lock", self.environment.as_str()))
    }
}

pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

pub fn app_data_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_DATA_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".local").join("share").join(APP_DIR))
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<f64>().ok())
}
