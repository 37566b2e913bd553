use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;

use league_ingest::config::{Environment, PipelineConfig};
use league_ingest::error::{
    EXIT_ALREADY_RUNNING, EXIT_CRITICAL, EXIT_FAILURE, EXIT_OK, EXIT_REFUSED, EXIT_ROLLED_BACK,
    PipelineError,
};
use league_ingest::health;
use league_ingest::import::{ImportLock, ImportStatus, ImportTransaction};
use league_ingest::league_rules::LeagueRules;
use league_ingest::pipeline;
use league_ingest::precheck::validate_batches;
use league_ingest::records::load_league_file;
use league_ingest::report::{BatchReport, RunOutcome};
use league_ingest::store::{self, row_counts};

fn fixture_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

/// Scratch directory with the league fixtures copied into `data/`.
fn workspace() -> (TempDir, PipelineConfig) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).expect("data dir");
    for name in ["APTA_CHICAGO.json", "NSTF.json", "CITA.json"] {
        fs::copy(fixture_path(name), data.join(name)).expect("copy fixture");
    }
    let mut config = PipelineConfig::in_dir(Environment::Local, tmp.path());
    config.data_dir = Some(data);
    config.lock_timeout = Duration::from_millis(200);
    (tmp, config)
}

fn open(config: &PipelineConfig) -> Connection {
    store::open_db(&config.db_path).expect("open store")
}

/// Every match as natural key plus outcome, for whole-store comparisons.
fn match_dump(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare(
            "SELECT l.league_code, m.date, h.name, a.name, m.score_text, m.winner,
                    m.winner_confidence, COALESCE(m.correction_reason, '')
             FROM matches m
             JOIN leagues l ON l.id = m.league_id
             JOIN teams h ON h.id = m.home_team_id
             JOIN teams a ON a.id = m.away_team_id
             ORDER BY 1, 2, 3, 4",
        )
        .expect("prepare dump");
    let rows = stmt
        .query_map([], |row| {
            let cols = (0..8)
                .map(|i| row.get::<_, String>(i))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(cols.join("|"))
        })
        .expect("query dump")
        .collect::<Result<Vec<_>, _>>()
        .expect("read dump");
    rows
}

fn counts(config: &PipelineConfig) -> BTreeMap<String, i64> {
    row_counts(&open(config)).expect("row counts")
}

#[test]
fn full_import_loads_every_league() {
    let (_tmp, config) = workspace();
    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_OK, "{:?}", result.report.error);
    assert_eq!(result.report.outcome, RunOutcome::Imported);

    let counts = counts(&config);
    assert_eq!(counts["leagues"], 3);
    assert_eq!(counts["matches"], 11);
    assert_eq!(counts["teams"], 12);
    assert_eq!(counts["clubs"], 10);
    assert_eq!(counts["players"], 8);
    assert_eq!(counts["team_stats"], 12);

    let conn = open(&config);
    let dump = match_dump(&conn);
    assert!(dump.contains(
        &"APTA_CHICAGO|2024-09-25|Glenview - 22|Wilmette - 22|5-7, 6-3, 6-4|home|corrected|score_overrides_indicator:away"
            .to_string()
    ));
    assert!(dump.contains(
        &"CITA|2024-09-25|Midtown - A|Lakeshore - A|6-2, 6-2, 6-6|indeterminate|unresolved|live_pattern:final_set_margin_under_two"
            .to_string()
    ));
    assert_eq!(
        store::last_import_status(&conn).expect("import runs").as_deref(),
        Some("committed")
    );

    let import = result.report.import.as_ref().expect("import report");
    assert_eq!(import.status, ImportStatus::Committed);
    assert!(import.backup.as_ref().is_some_and(|b| b.path.exists()));

    let health = result.report.health.as_ref().expect("health report");
    assert!(health.passed);
    assert!(health.warnings.iter().any(|w| w.starts_with("CITA")));
    assert!(result.report.health_artifact.as_ref().is_some_and(|p| p.exists()));
    assert!(result.report_path.as_ref().is_some_and(|p| p.exists()));
    assert!(!config.lock_path().exists());
}

#[test]
fn importing_twice_converges() {
    let (_tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let first = match_dump(&open(&config));
    let first_counts = counts(&config);

    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    assert_eq!(match_dump(&open(&config)), first);
    assert_eq!(counts(&config), first_counts);
}

#[test]
fn injected_failure_rolls_back_to_previous_state() {
    let (_tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let before = match_dump(&open(&config));
    let before_counts = counts(&config);

    open(&config)
        .execute_batch(
            "CREATE TRIGGER fail_live_score BEFORE INSERT ON matches
             WHEN NEW.score_text = '4-3'
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .expect("create trigger");

    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_ROLLED_BACK);
    assert_eq!(result.report.outcome, RunOutcome::RolledBack);
    assert!(result.report.store_untouched);
    assert_eq!(
        result.report.import.as_ref().map(|i| i.status),
        Some(ImportStatus::RolledBack)
    );
    assert_eq!(counts(&config), before_counts);
    assert_eq!(match_dump(&open(&config)), before);
    assert_eq!(
        store::last_import_status(&open(&config)).expect("import runs").as_deref(),
        Some("rolled_back")
    );
    assert!(!config.lock_path().exists());
}

#[test]
fn injected_failure_on_empty_store_leaves_it_empty() {
    let (_tmp, config) = workspace();
    open(&config)
        .execute_batch(
            "CREATE TRIGGER fail_any BEFORE INSERT ON team_stats
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .expect("create trigger");

    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_ROLLED_BACK);
    assert!(counts(&config).values().all(|count| *count == 0));
}

#[test]
fn gate_refusal_touches_nothing() {
    let (tmp, mut config) = workspace();
    let data = tmp.path().join("bad");
    fs::create_dir_all(&data).expect("bad dir");
    fs::write(
        data.join("APTA_CHICAGO.json"),
        r#"[
            {"date": "2024-09-25", "home_team": "A - 1", "away_team": "B - 1", "score": "6-1, 6-1"},
            {"date": "2024-09-25", "home_team": "C - 1", "away_team": "D - 1", "score": "in progress"},
            {"date": "2024-09-25", "home_team": "E - 1", "away_team": "F - 1", "score": "6-3, 3-6"}
        ]"#,
    )
    .expect("write bad league");
    config.data_dir = Some(data);

    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_REFUSED);
    assert_eq!(result.report.outcome, RunOutcome::Refused);
    let precheck = result.report.precheck.as_ref().expect("precheck report");
    assert_eq!(precheck.gate_violations.len(), 1);
    assert_eq!(precheck.gate_violations[0].flagged, 2);

    assert!(!config.db_path.exists());
    assert!(!config.lock_path().exists());
    assert!(!config.backup_dir.exists());
    assert!(result.report_path.as_ref().is_some_and(|p| p.exists()));
}

#[test]
fn held_lock_fails_fast() {
    let (_tmp, config) = workspace();
    let _held = ImportLock::acquire(&config.lock_path(), "local", Duration::from_millis(10))
        .expect("first lock");

    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_ALREADY_RUNNING);
    assert_eq!(result.report.outcome, RunOutcome::AlreadyRunning);
    assert_eq!(counts(&config)["matches"], 0);
    assert!(!config.backup_dir.exists());
}

#[test]
fn dry_run_never_opens_the_store() {
    let (_tmp, mut config) = workspace();
    config.dry_run = true;
    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_OK);
    assert_eq!(result.report.outcome, RunOutcome::Validated);
    assert!(!config.db_path.exists());

    let precheck = result.report.precheck.as_ref().expect("precheck report");
    assert_eq!(precheck.total(), 11);
    assert_eq!(precheck.corrected(), 2);
    assert_eq!(precheck.flagged(), 2);
}

#[test]
fn file_named_twice_is_loaded_once() {
    let (_tmp, mut config) = workspace();
    let data = config.data_dir.clone().expect("data dir");
    config.files = vec![data.join("NSTF.json"), data.join(".").join("CITA.json")];
    config.dry_run = true;
    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_OK);
    assert_eq!(result.report.files.len(), 3);
    let precheck = result.report.precheck.as_ref().expect("precheck report");
    assert_eq!(precheck.total(), 11);
}

#[test]
fn auto_fix_rewrites_sources_and_keeps_unknown_keys() {
    let (_tmp, mut config) = workspace();
    config.dry_run = true;
    config.auto_fix = true;
    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_OK);
    assert_eq!(result.report.auto_fixed.len(), 3);

    let data = config.data_dir.clone().expect("data dir");
    let apta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(data.join("APTA_CHICAGO.json")).expect("read"))
            .expect("json");
    assert_eq!(apta[1]["Winner"], "home");
    assert_eq!(apta[1]["correction_reason"], "score_overrides_indicator:away");
    assert_eq!(apta[1]["Series"], "Chicago 22");
    assert_eq!(apta[0]["Home Player 1"], "Ann Lee");

    let cita: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(data.join("CITA.json")).expect("read"))
            .expect("json");
    let original: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fixture_path("CITA.json")).expect("read fixture"),
    )
    .expect("json");
    // Ambiguous lenient records are written back exactly as scraped.
    assert_eq!(cita[0], original[0]);
    assert_eq!(cita[1], original[1]);
    assert_eq!(cita[2]["scraped_from"], "cita-live");
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[test]
fn auto_fix_leaves_unchanged_records_verbatim() {
    let (_tmp, mut config) = workspace();
    let data = config.data_dir.clone().expect("data dir");
    fs::write(
        data.join("NSTF_EXTRA.json"),
        r#"[{"date": "2024-10-15", "home_team": "Tennaqua - 22", "away_team": "Winnetka - 22",
            "score": "6-1, 6-1", "Winner": "Tennaqua - 22"}]"#,
    )
    .expect("write extra league file");
    config.dry_run = true;
    config.auto_fix = true;
    let result = pipeline::run(&config);
    assert_eq!(result.exit_code(), EXIT_OK);

    let extra = read_json(&data.join("NSTF_EXTRA.json"));
    assert_eq!(extra[0]["Winner"], "Tennaqua - 22");
    assert!(extra[0].get("winner").is_none());
    assert!(extra[0].get("correction_reason").is_none());

    // Only the corrected record in each league differs from the scraped file.
    for (name, corrected) in [("APTA_CHICAGO.json", 1), ("NSTF.json", 0)] {
        let written = read_json(&data.join(name));
        let original = read_json(&fixture_path(name));
        let rows = original.as_array().expect("array").len();
        for i in (0..rows).filter(|i| *i != corrected) {
            assert_eq!(written[i], original[i], "{name} record {i}");
        }
        assert_ne!(written[corrected], original[corrected], "{name}");
    }
}

#[test]
fn production_requires_force() {
    let (tmp, config) = workspace();
    let mut prod = PipelineConfig::in_dir(Environment::Production, tmp.path());
    prod.data_dir = config.data_dir.clone();
    let result = pipeline::run(&prod);
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(result.report.outcome, RunOutcome::Failed);
    assert!(!prod.db_path.exists());
}

#[test]
fn partial_batch_cannot_shrink_store_without_opt_in() {
    let (_tmp, mut config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let before = counts(&config);

    config.leagues = vec!["nstf".to_string()];
    let refused = pipeline::run(&config);
    assert_eq!(refused.exit_code(), EXIT_ROLLED_BACK);
    assert!(
        refused
            .report
            .error
            .as_deref()
            .is_some_and(|e| e.contains("would shrink"))
    );
    assert_eq!(counts(&config), before);

    config.allow_shrink = true;
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    assert_eq!(counts(&config)["matches"], 4);
}

#[test]
fn restore_brings_back_pre_import_rows() {
    let (tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let before = counts(&config);

    let mut conn = open(&config);
    let mut import = ImportTransaction::new(&mut conn).allow_shrink(true);
    import
        .capture_backup(&tmp.path().join("manual"), "local")
        .expect("backup");
    let summary = import
        .load(&[], &LeagueRules::builtin())
        .expect("empty load");
    assert_eq!(summary.row_counts["matches"], 0);
    import.restore_from_backup().expect("restore");
    drop(import);

    assert_eq!(row_counts(&conn).expect("counts"), before);
}

#[test]
fn store_changed_between_commit_and_verify_is_restored_as_critical() {
    let (tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let before = counts(&config);
    let dump = match_dump(&open(&config));

    let rules = LeagueRules::builtin();
    let mut batches = vec![load_league_file(&fixture_path("NSTF.json")).expect("load fixture")];
    let validated = validate_batches(&mut batches, &rules, 0.5);

    let mut conn = open(&config);
    let mut import = ImportTransaction::new(&mut conn).allow_shrink(true);
    import
        .capture_backup(&tmp.path().join("manual"), "local")
        .expect("backup");
    let summary = import.load(&validated.matches, &rules).expect("load");
    assert_eq!(summary.row_counts["matches"], 4);

    // A concurrent writer drops rows after the commit.
    open(&config)
        .execute("DELETE FROM matches WHERE id IN (SELECT id FROM matches LIMIT 2)", [])
        .expect("tamper");

    let err = import.verify_committed(&summary).expect_err("verification must fail");
    assert!(matches!(err, PipelineError::RestoredFromBackup(_)), "{err}");
    assert_eq!(import.status(), ImportStatus::RolledBack);
    drop(import);

    assert_eq!(row_counts(&conn).expect("counts"), before);
    assert_eq!(match_dump(&conn), dump);

    let mut report = BatchReport::new("local", false);
    report.fail(&err);
    assert_eq!(report.outcome, RunOutcome::Restored);
    assert_eq!(report.exit_code, EXIT_CRITICAL);
}

#[test]
fn health_score_tracks_stats_coverage() {
    let (_tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let conn = open(&config);
    let full = health::evaluate(&conn, 90.0).expect("health");

    let saved: Vec<(i64, i64, i64, i64, i64, i64, i64)> = {
        let mut stmt = conn
            .prepare(
                "SELECT team_id, league_id, matches_played, wins, losses, sets_won, sets_lost
                 FROM team_stats ORDER BY team_id LIMIT 4",
            )
            .expect("prepare");
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
            })
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        rows
    };
    let ids = saved.iter().map(|row| row.0.to_string()).collect::<Vec<_>>();
    conn.execute(
        &format!("DELETE FROM team_stats WHERE team_id IN ({})", ids.join(",")),
        [],
    )
    .expect("delete stats");

    let mut previous = health::evaluate(&conn, 90.0).expect("health");
    assert!(previous.score < full.score);
    assert!(!previous.passed);
    assert!(previous.critical_issues.iter().any(|i| i.contains("team_stats")));

    for row in &saved {
        conn.execute(
            "INSERT INTO team_stats VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![row.0, row.1, row.2, row.3, row.4, row.5, row.6],
        )
        .expect("restore stats row");
        let next = health::evaluate(&conn, 90.0).expect("health");
        assert!(next.score > previous.score);
        previous = next;
    }
    assert_eq!(previous.score, full.score);
}

#[test]
fn dangling_team_reference_is_critical() {
    let (_tmp, config) = workspace();
    assert_eq!(pipeline::run(&config).exit_code(), EXIT_OK);
    let conn = open(&config);
    conn.execute_batch(
        "PRAGMA foreign_keys = OFF;
         DELETE FROM teams WHERE name = 'Midtown - A';",
    )
    .expect("break reference");

    let report = health::evaluate(&conn, 90.0).expect("health");
    assert!(!report.passed);
    assert!(report.ratio("team_refs").is_some_and(|r| r < 1.0));
    assert!(report.critical_issues.iter().any(|i| i.contains("missing home or away team")));
}

#[test]
fn health_artifact_is_written_per_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = store::open_db(&dir.path().join("h.sqlite")).expect("store");
    let report = health::evaluate(&conn, 90.0).expect("health");
    let path = health::write_artifact(&report, &dir.path().join("reports")).expect("artifact");
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with("health_") && name.ends_with(".json"));
    assert!(Path::new(&path).exists());
}
