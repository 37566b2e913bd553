use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, Transaction};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backup::{self, BackupHandle};
use crate::error::PipelineError;
use crate::league_rules::LeagueRules;
use crate::precheck::ValidatedMatch;
use crate::store::{
    self, IMPORT_TABLES, LookupCache, MatchRow, TeamTally, clear_tables, foreign_key_violations,
    row_counts,
};
use crate::winner::Winner;

const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    NotStarted,
    BackedUp,
    InProgress,
    Committed,
    RolledBack,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::NotStarted => "not_started",
            ImportStatus::BackedUp => "backed_up",
            ImportStatus::InProgress => "in_progress",
            ImportStatus::Committed => "committed",
            ImportStatus::RolledBack => "rolled_back",
        }
    }
}

/// Exclusive per-environment import lock, released on drop.
#[derive(Debug)]
pub struct ImportLock {
    path: PathBuf,
}

impl ImportLock {
    pub fn acquire(path: &Path, environment: &str, timeout: Duration) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))
                .map_err(PipelineError::Store)?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(
                        file,
                        "pid={} environment={} acquired_at={}",
                        std::process::id(),
                        environment,
                        Utc::now().to_rfc3339()
                    ) {
                        warn!(path = %path.display(), error = %err, "could not record lock owner");
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if let Some(pid) = stale_owner(path) {
                        let archived = archive_stale_lock(path).map_err(PipelineError::Store)?;
                        warn!(
                            path = %path.display(),
                            archived = %archived.display(),
                            pid,
                            "took over lock left by exited process"
                        );
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(PipelineError::AlreadyRunning {
                            environment: environment.to_string(),
                            waited_ms: waited.as_millis(),
                        });
                    }
                    thread::sleep(LOCK_POLL.min(timeout - waited));
                }
                Err(err) => {
                    return Err(PipelineError::Store(
                        anyhow!(err).context(format!("create lock file {}", path.display())),
                    ));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid recorded in a lock file whose process is no longer running.
fn stale_owner(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    let pid = contents
        .split_whitespace()
        .find_map(|field| field.strip_prefix("pid="))?
        .parse::<u32>()
        .ok()?;
    (pid != std::process::id() && !process_alive(pid)).then_some(pid)
}

/// Moves a stale lock aside so its owner line survives for inspection.
fn archive_stale_lock(path: &Path) -> anyhow::Result<PathBuf> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".stale.{}", Utc::now().timestamp_millis()));
    let archived = path.with_file_name(name);
    match fs::rename(path, &archived) {
        Ok(()) => Ok(archived),
        // Another waiter archived it first.
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(archived),
        Err(err) => Err(anyhow!(err).context(format!("archive stale lock {}", path.display()))),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a process table to consult, a recorded owner is always treated as live.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for ImportLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release import lock");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub leagues: usize,
    pub teams: usize,
    pub players: usize,
    pub matches_loaded: usize,
    pub duplicates_merged: usize,
    pub skipped: usize,
    pub team_stats: usize,
    pub row_counts: BTreeMap<String, i64>,
}

/// One batch import against one store: `NotStarted → BackedUp → InProgress →
/// Committed | RolledBack`.
pub struct ImportTransaction<'c> {
    conn: &'c mut Connection,
    status: ImportStatus,
    backup: Option<BackupHandle>,
    tables_touched: Vec<&'static str>,
    cache: LookupCache,
    pre_counts: BTreeMap<String, i64>,
    allow_shrink: bool,
}

impl<'c> ImportTransaction<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self {
            conn,
            status: ImportStatus::NotStarted,
            backup: None,
            tables_touched: Vec::new(),
            cache: LookupCache::default(),
            pre_counts: BTreeMap::new(),
            allow_shrink: false,
        }
    }

    /// Lets the load shrink tables relative to the pre-import state.
    pub fn allow_shrink(mut self, allow: bool) -> Self {
        self.allow_shrink = allow;
        self
    }

    pub fn status(&self) -> ImportStatus {
        self.status
    }

    pub fn backup(&self) -> Option<&BackupHandle> {
        self.backup.as_ref()
    }

    pub fn tables_touched(&self) -> &[&'static str] {
        &self.tables_touched
    }

    fn expect_status(&self, expected: ImportStatus, step: &'static str) -> Result<(), PipelineError> {
        if self.status != expected {
            return Err(PipelineError::InvalidTransition {
                from: self.status.as_str(),
                step,
            });
        }
        Ok(())
    }

    pub fn capture_backup(&mut self, dir: &Path, label: &str) -> Result<&BackupHandle, PipelineError> {
        self.expect_status(ImportStatus::NotStarted, "capture_backup")?;
        let handle = backup::capture(&*self.conn, dir, label).map_err(PipelineError::BackupFailure)?;
        self.tables_touched = IMPORT_TABLES.to_vec();
        self.status = ImportStatus::BackedUp;
        Ok(self.backup.insert(handle))
    }

    /// Explicit opt-out of the pre-import snapshot. A later failure after commit cannot
    /// be repaired.
    pub fn skip_backup(&mut self) -> Result<(), PipelineError> {
        self.expect_status(ImportStatus::NotStarted, "skip_backup")?;
        warn!("pre-import backup skipped at caller's request");
        self.tables_touched = IMPORT_TABLES.to_vec();
        self.status = ImportStatus::BackedUp;
        Ok(())
    }

    /// Clears and reloads every import table inside one transaction, committing only if
    /// every step and the consistency check succeed.
    pub fn load(
        &mut self,
        matches: &[ValidatedMatch],
        rules: &LeagueRules,
    ) -> Result<LoadSummary, PipelineError> {
        self.expect_status(ImportStatus::BackedUp, "load")?;
        self.pre_counts = row_counts(&*self.conn).map_err(PipelineError::Store)?;
        self.status = ImportStatus::InProgress;

        let tx = match self.conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                self.status = ImportStatus::RolledBack;
                return Err(PipelineError::TransactionFailure(
                    anyhow!(err).context("begin import transaction"),
                ));
            }
        };

        let loaded = load_all(&tx, matches, rules, &mut self.cache)
            .map_err(PipelineError::TransactionFailure)
            .and_then(|summary| {
                verify_consistency(&tx, &self.pre_counts, self.allow_shrink).map(|()| summary)
            });

        let summary = match loaded {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rb) = tx.rollback() {
                    error!(error = %rb, "explicit rollback failed; dropping transaction");
                }
                self.status = ImportStatus::RolledBack;
                warn!(error = %err, "import rolled back");
                return Err(err);
            }
        };

        if let Err(err) = tx.commit() {
            self.status = ImportStatus::RolledBack;
            return Err(PipelineError::TransactionFailure(
                anyhow!(err).context("commit import transaction"),
            ));
        }
        self.status = ImportStatus::Committed;
        info!(
            matches = summary.matches_loaded,
            teams = summary.teams,
            players = summary.players,
            "import committed"
        );
        Ok(summary)
    }

    /// Re-reads the committed store through a separate connection and compares it with
    /// the counts the load transaction wrote. Any difference means the commit did not land
    /// as believed; the backup is restored and the failure is critical.
    pub fn verify_committed(&mut self, summary: &LoadSummary) -> Result<(), PipelineError> {
        self.expect_status(ImportStatus::Committed, "verify_committed")?;
        let counts = self.committed_counts().map_err(PipelineError::Store)?;
        let matches = counts.get("matches").copied().unwrap_or_default();
        if matches == summary.matches_loaded as i64 && counts == summary.row_counts {
            return Ok(());
        }

        let detail = format!(
            "expected {} matches and counts {:?}, found {counts:?}",
            summary.matches_loaded, summary.row_counts
        );
        error!(%detail, "CRITICAL: committed import failed verification");
        self.status = ImportStatus::RolledBack;
        self.restore_from_backup()?;
        Err(PipelineError::RestoredFromBackup(detail))
    }

    fn committed_counts(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        match self.conn.path().filter(|path| !path.is_empty()) {
            Some(path) => {
                let reader = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .with_context(|| format!("reopen store {path} for verification"))?;
                row_counts(&reader)
            }
            // In-memory stores have no second view; read them in place.
            None => row_counts(&*self.conn),
        }
    }

    pub fn restore_from_backup(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.backup.as_ref() else {
            return Err(PipelineError::RestoreFailure(anyhow!(
                "no backup was captured for this import"
            )));
        };
        backup::restore(&mut *self.conn, handle).map_err(|err| {
            error!(error = %err, "CRITICAL: restore from backup failed");
            PipelineError::RestoreFailure(err)
        })
    }
}

fn load_all(
    tx: &Transaction<'_>,
    matches: &[ValidatedMatch],
    rules: &LeagueRules,
    cache: &mut LookupCache,
) -> anyhow::Result<LoadSummary> {
    clear_tables(tx)?;

    let mut summary = LoadSummary::default();
    let mut unique: Vec<&ValidatedMatch> = Vec::new();
    let mut by_key: HashMap<(String, String, String, String), usize> = HashMap::new();
    for m in matches {
        let (Some(date), Some(home), Some(away)) = (&m.date, &m.home_team, &m.away_team) else {
            summary.skipped += 1;
            continue;
        };
        let key = (m.league_code.clone(), date.clone(), home.clone(), away.clone());
        match by_key.get(&key) {
            // Later scrapes of the same fixture replace earlier ones.
            Some(idx) => {
                unique[*idx] = m;
                summary.duplicates_merged += 1;
            }
            None => {
                by_key.insert(key, unique.len());
                unique.push(m);
            }
        }
    }

    // Reference tables first so every match row resolves its keys.
    let mut resolved = Vec::with_capacity(unique.len());
    for m in &unique {
        let league_id = cache.league_id(tx, &m.league_code, &rules.display_name(&m.league_code))?;
        let home_id = cache.team_id(tx, league_id, m.home_team.as_deref().unwrap_or_default())?;
        let away_id = cache.team_id(tx, league_id, m.away_team.as_deref().unwrap_or_default())?;
        let mut player_ids = [None; 4];
        for (slot, player) in m.players.iter().enumerate() {
            if let Some(external_id) = player.external_id.as_deref() {
                player_ids[slot] = Some(cache.player_id(tx, external_id, player.name.as_deref())?);
            }
        }
        resolved.push((league_id, home_id, away_id, player_ids));
    }

    let mut tallies: BTreeMap<i64, TeamTally> = BTreeMap::new();
    for (m, (league_id, home_id, away_id, player_ids)) in unique.iter().zip(&resolved) {
        store::upsert_match(
            tx,
            &MatchRow {
                league_id: *league_id,
                date: m.date.as_deref().unwrap_or_default(),
                home_team_id: *home_id,
                away_team_id: *away_id,
                score_text: &m.score_text,
                winner: m.decision.winner.as_str(),
                winner_confidence: m.decision.confidence.as_str(),
                correction_reason: correction_reason(m),
                player_ids: *player_ids,
            },
        )
        .with_context(|| {
            format!(
                "load {} match {} {} vs {}",
                m.league_code,
                m.date.as_deref().unwrap_or_default(),
                m.home_team.as_deref().unwrap_or_default(),
                m.away_team.as_deref().unwrap_or_default()
            )
        })?;
        tally_match(&mut tallies, m, *league_id, *home_id, *away_id);
    }
    summary.matches_loaded = unique.len();

    for (team_id, tally) in &tallies {
        store::upsert_team_stats(tx, *team_id, tally)?;
    }
    summary.team_stats = tallies.len();

    let counts = row_counts(tx)?;
    summary.leagues = counts.get("leagues").copied().unwrap_or_default() as usize;
    summary.teams = counts.get("teams").copied().unwrap_or_default() as usize;
    summary.players = counts.get("players").copied().unwrap_or_default() as usize;
    summary.row_counts = counts;
    Ok(summary)
}

/// Definitive rows carry no reason; everything else records why.
fn correction_reason(m: &ValidatedMatch) -> Option<&str> {
    match m.decision.confidence {
        crate::winner::Confidence::Definitive => None,
        _ => Some(m.decision.reason.as_str()),
    }
}

fn tally_match(
    tallies: &mut BTreeMap<i64, TeamTally>,
    m: &ValidatedMatch,
    league_id: i64,
    home_id: i64,
    away_id: i64,
) {
    let (home_sets, away_sets) = m.sets_won;
    for (team_id, won, lost, side) in [
        (home_id, home_sets, away_sets, Winner::Home),
        (away_id, away_sets, home_sets, Winner::Away),
    ] {
        let tally = tallies.entry(team_id).or_default();
        tally.league_id = league_id;
        tally.matches_played += 1;
        tally.sets_won += i64::from(won);
        tally.sets_lost += i64::from(lost);
        match m.decision.winner {
            Winner::Indeterminate => {}
            w if w == side => tally.wins += 1,
            _ => tally.losses += 1,
        }
    }
}

fn verify_consistency(
    tx: &Transaction<'_>,
    pre_counts: &BTreeMap<String, i64>,
    allow_shrink: bool,
) -> Result<(), PipelineError> {
    let post = row_counts(tx).map_err(PipelineError::TransactionFailure)?;
    if !allow_shrink {
        for (table, before) in pre_counts {
            let after = post.get(table).copied().unwrap_or_default();
            if after < *before {
                return Err(PipelineError::ConsistencyCheck(format!(
                    "{table} would shrink from {before} to {after} rows"
                )));
            }
        }
    }
    let violations = foreign_key_violations(tx).map_err(PipelineError::TransactionFailure)?;
    if violations > 0 {
        return Err(PipelineError::ConsistencyCheck(format!(
            "{violations} foreign key violations after load"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub environment: String,
    pub lock_path: PathBuf,
    pub lock_timeout: Duration,
    /// `None` skips the pre-import snapshot.
    pub backup_dir: Option<PathBuf>,
    pub allow_shrink: bool,
    pub discard_backup_on_success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Option<i64>,
    pub status: ImportStatus,
    pub backup: Option<BackupHandle>,
    pub tables_touched: Vec<&'static str>,
    pub load: Option<LoadSummary>,
}

impl ImportReport {
    fn not_started() -> Self {
        Self {
            run_id: None,
            status: ImportStatus::NotStarted,
            backup: None,
            tables_touched: Vec::new(),
            load: None,
        }
    }
}

#[derive(Debug, Error)]
#[error("{error}")]
pub struct ImportFailure {
    pub error: PipelineError,
    pub report: ImportReport,
}

/// Lock, snapshot, load, verify. Blocks until the import reaches a terminal state.
pub fn run_import(
    conn: &mut Connection,
    matches: &[ValidatedMatch],
    rules: &LeagueRules,
    opts: &ImportOptions,
) -> Result<ImportReport, ImportFailure> {
    let _lock = ImportLock::acquire(&opts.lock_path, &opts.environment, opts.lock_timeout)
        .map_err(|error| ImportFailure {
            error,
            report: ImportReport::not_started(),
        })?;

    let run_id = match store::begin_import_run(conn, &opts.environment) {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(error = %err, "could not record import run start");
            None
        }
    };

    let (report, outcome) = {
        let mut import = ImportTransaction::new(conn).allow_shrink(opts.allow_shrink);
        let outcome = drive(&mut import, matches, rules, opts);
        let report = ImportReport {
            run_id,
            status: import.status(),
            backup: import.backup().cloned(),
            tables_touched: import.tables_touched().to_vec(),
            load: outcome.as_ref().ok().cloned(),
        };
        (report, outcome)
    };

    if let Some(run_id) = run_id {
        let loaded = report.load.as_ref().map(|l| l.matches_loaded).unwrap_or_default();
        let detail = match &outcome {
            Ok(_) => serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string()),
            Err(err) => serde_json::json!({ "error": err.to_string() }).to_string(),
        };
        if let Err(err) = store::finish_import_run(conn, run_id, report.status.as_str(), loaded, &detail) {
            warn!(error = %err, "could not record import run result");
        }
    }

    match outcome {
        Ok(_) => {
            if opts.discard_backup_on_success
                && let Some(handle) = &report.backup
                && let Err(err) = backup::discard(handle)
            {
                warn!(error = %err, "could not discard backup");
            }
            Ok(report)
        }
        Err(error) => Err(ImportFailure { error, report }),
    }
}

fn drive(
    import: &mut ImportTransaction<'_>,
    matches: &[ValidatedMatch],
    rules: &LeagueRules,
    opts: &ImportOptions,
) -> Result<LoadSummary, PipelineError> {
    match &opts.backup_dir {
        Some(dir) => {
            import.capture_backup(dir, &opts.environment)?;
        }
        None => import.skip_backup()?,
    }
    let summary = import.load(matches, rules)?;
    import.verify_committed(&summary)?;
    Ok(summary)
}
