use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

/// Tables written by an import, parents before children.
pub const IMPORT_TABLES: [&str; 7] = [
    "leagues",
    "clubs",
    "series",
    "teams",
    "players",
    "matches",
    "team_stats",
];

pub const DEFAULT_SERIES: &str = "default";

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS leagues (
            id INTEGER PRIMARY KEY,
            league_code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS clubs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS series (
            id INTEGER PRIMARY KEY,
            league_id INTEGER NOT NULL REFERENCES leagues(id),
            name TEXT NOT NULL,
            UNIQUE (league_id, name)
        );
        CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY,
            league_id INTEGER NOT NULL REFERENCES leagues(id),
            club_id INTEGER NOT NULL REFERENCES clubs(id),
            series_id INTEGER NOT NULL REFERENCES series(id),
            name TEXT NOT NULL,
            UNIQUE (league_id, name)
        );
        CREATE TABLE IF NOT EXISTS players (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS matches (
            id INTEGER PRIMARY KEY,
            league_id INTEGER NOT NULL REFERENCES leagues(id),
            date TEXT NOT NULL,
            home_team_id INTEGER NOT NULL REFERENCES teams(id),
            away_team_id INTEGER NOT NULL REFERENCES teams(id),
            score_text TEXT NOT NULL,
            winner TEXT NOT NULL,
            winner_confidence TEXT NOT NULL,
            correction_reason TEXT NULL,
            home_player_1_id INTEGER NULL REFERENCES players(id),
            home_player_2_id INTEGER NULL REFERENCES players(id),
            away_player_1_id INTEGER NULL REFERENCES players(id),
            away_player_2_id INTEGER NULL REFERENCES players(id),
            UNIQUE (league_id, date, home_team_id, away_team_id)
        );
        CREATE INDEX IF NOT EXISTS idx_matches_league ON matches(league_id);
        CREATE INDEX IF NOT EXISTS idx_matches_home ON matches(home_team_id);
        CREATE INDEX IF NOT EXISTS idx_matches_away ON matches(away_team_id);
        CREATE INDEX IF NOT EXISTS idx_teams_league ON teams(league_id);

        CREATE TABLE IF NOT EXISTS team_stats (
            team_id INTEGER PRIMARY KEY REFERENCES teams(id),
            league_id INTEGER NOT NULL REFERENCES leagues(id),
            matches_played INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            losses INTEGER NOT NULL,
            sets_won INTEGER NOT NULL,
            sets_lost INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS import_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            environment TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            status TEXT NOT NULL,
            matches_loaded INTEGER NOT NULL,
            detail_json TEXT NOT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn row_counts(conn: &Connection) -> Result<BTreeMap<String, i64>> {
    let mut out = BTreeMap::new();
    for table in IMPORT_TABLES {
        let count = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("count rows in {table}"))?;
        out.insert(table.to_string(), count);
    }
    Ok(out)
}

/// Empties every import table, children first.
pub fn clear_tables(tx: &Transaction<'_>) -> Result<()> {
    for table in IMPORT_TABLES.iter().rev() {
        tx.execute(&format!("DELETE FROM {table}"), [])
            .with_context(|| format!("clear {table}"))?;
    }
    Ok(())
}

pub fn foreign_key_violations(conn: &Connection) -> Result<usize> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .context("prepare foreign key check")?;
    let mut rows = stmt.query([]).context("run foreign key check")?;
    let mut count = 0usize;
    while rows.next().context("read foreign key check")?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Splits a scraped team name (`"Tennaqua - 22"`) into club and series.
pub fn split_team_name(name: &str) -> (String, String) {
    match name.rsplit_once(" - ") {
        Some((club, series)) if !club.trim().is_empty() && !series.trim().is_empty() => {
            (club.trim().to_string(), series.trim().to_string())
        }
        _ => (name.trim().to_string(), DEFAULT_SERIES.to_string()),
    }
}

fn split_player_name(name: Option<&str>) -> (String, String) {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (String::new(), String::new());
    };
    match name.split_once(char::is_whitespace) {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (name.to_string(), String::new()),
    }
}

#[derive(Debug, Clone)]
pub struct MatchRow<'a> {
    pub league_id: i64,
    pub date: &'a str,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub score_text: &'a str,
    pub winner: &'a str,
    pub winner_confidence: &'a str,
    pub correction_reason: Option<&'a str>,
    pub player_ids: [Option<i64>; 4],
}

pub fn upsert_match(tx: &Transaction<'_>, m: &MatchRow<'_>) -> Result<i64> {
    tx.query_row(
        r#"
        INSERT INTO matches (
            league_id, date, home_team_id, away_team_id,
            score_text, winner, winner_confidence, correction_reason,
            home_player_1_id, home_player_2_id, away_player_1_id, away_player_2_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(league_id, date, home_team_id, away_team_id) DO UPDATE SET
            score_text = excluded.score_text,
            winner = excluded.winner,
            winner_confidence = excluded.winner_confidence,
            correction_reason = excluded.correction_reason,
            home_player_1_id = excluded.home_player_1_id,
            home_player_2_id = excluded.home_player_2_id,
            away_player_1_id = excluded.away_player_1_id,
            away_player_2_id = excluded.away_player_2_id
        RETURNING id
        "#,
        params![
            m.league_id,
            m.date,
            m.home_team_id,
            m.away_team_id,
            m.score_text,
            m.winner,
            m.winner_confidence,
            m.correction_reason,
            m.player_ids[0],
            m.player_ids[1],
            m.player_ids[2],
            m.player_ids[3],
        ],
        |row| row.get(0),
    )
    .context("upsert match")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamTally {
    pub league_id: i64,
    pub matches_played: i64,
    pub wins: i64,
    pub losses: i64,
    pub sets_won: i64,
    pub sets_lost: i64,
}

pub fn upsert_team_stats(tx: &Transaction<'_>, team_id: i64, t: &TeamTally) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO team_stats (team_id, league_id, matches_played, wins, losses, sets_won, sets_lost)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(team_id) DO UPDATE SET
            league_id = excluded.league_id,
            matches_played = excluded.matches_played,
            wins = excluded.wins,
            losses = excluded.losses,
            sets_won = excluded.sets_won,
            sets_lost = excluded.sets_lost
        "#,
        params![
            team_id,
            t.league_id,
            t.matches_played,
            t.wins,
            t.losses,
            t.sets_won,
            t.sets_lost
        ],
    )
    .context("upsert team stats")?;
    Ok(())
}

/// Natural key → row id lookups for one import. Owned by the import transaction and
/// dropped with it.
#[derive(Debug, Default)]
pub struct LookupCache {
    leagues: HashMap<String, i64>,
    clubs: HashMap<String, i64>,
    series: HashMap<(i64, String), i64>,
    teams: HashMap<(i64, String), i64>,
    players: HashMap<String, i64>,
}

impl LookupCache {
    pub fn league_id(&mut self, tx: &Transaction<'_>, code: &str, name: &str) -> Result<i64> {
        if let Some(id) = self.leagues.get(code) {
            return Ok(*id);
        }
        let id = tx
            .query_row(
                "INSERT INTO leagues (league_code, name) VALUES (?1, ?2)
                 ON CONFLICT(league_code) DO UPDATE SET name = excluded.name
                 RETURNING id",
                params![code, name],
                |row| row.get(0),
            )
            .with_context(|| format!("upsert league {code}"))?;
        self.leagues.insert(code.to_string(), id);
        Ok(id)
    }

    fn club_id(&mut self, tx: &Transaction<'_>, name: &str) -> Result<i64> {
        if let Some(id) = self.clubs.get(name) {
            return Ok(*id);
        }
        let id = tx
            .query_row(
                "INSERT INTO clubs (name) VALUES (?1)
                 ON CONFLICT(name) DO UPDATE SET name = excluded.name
                 RETURNING id",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("upsert club {name}"))?;
        self.clubs.insert(name.to_string(), id);
        Ok(id)
    }

    fn series_id(&mut self, tx: &Transaction<'_>, league_id: i64, name: &str) -> Result<i64> {
        let key = (league_id, name.to_string());
        if let Some(id) = self.series.get(&key) {
            return Ok(*id);
        }
        let id = tx
            .query_row(
                "INSERT INTO series (league_id, name) VALUES (?1, ?2)
                 ON CONFLICT(league_id, name) DO UPDATE SET name = excluded.name
                 RETURNING id",
                params![league_id, name],
                |row| row.get(0),
            )
            .with_context(|| format!("upsert series {name}"))?;
        self.series.insert(key, id);
        Ok(id)
    }

    pub fn team_id(&mut self, tx: &Transaction<'_>, league_id: i64, name: &str) -> Result<i64> {
        let key = (league_id, name.to_string());
        if let Some(id) = self.teams.get(&key) {
            return Ok(*id);
        }
        let (club, series) = split_team_name(name);
        let club_id = self.club_id(tx, &club)?;
        let series_id = self.series_id(tx, league_id, &series)?;
        let id = tx
            .query_row(
                "INSERT INTO teams (league_id, club_id, series_id, name) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(league_id, name) DO UPDATE SET
                    club_id = excluded.club_id,
                    series_id = excluded.series_id
                 RETURNING id",
                params![league_id, club_id, series_id, name],
                |row| row.get(0),
            )
            .with_context(|| format!("upsert team {name}"))?;
        self.teams.insert(key, id);
        Ok(id)
    }

    /// Players are keyed by the scraper's external id; names only ever fill blanks.
    pub fn player_id(
        &mut self,
        tx: &Transaction<'_>,
        external_id: &str,
        name: Option<&str>,
    ) -> Result<i64> {
        if let Some(id) = self.players.get(external_id)
            && name.is_none()
        {
            return Ok(*id);
        }
        let (first, last) = split_player_name(name);
        let id = tx
            .query_row(
                "INSERT INTO players (external_id, first_name, last_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(external_id) DO UPDATE SET
                    first_name = CASE WHEN excluded.first_name <> '' THEN excluded.first_name ELSE players.first_name END,
                    last_name = CASE WHEN excluded.last_name <> '' THEN excluded.last_name ELSE players.last_name END
                 RETURNING id",
                params![external_id, first, last],
                |row| row.get(0),
            )
            .with_context(|| format!("upsert player {external_id}"))?;
        self.players.insert(external_id.to_string(), id);
        Ok(id)
    }
}

pub fn begin_import_run(conn: &Connection, environment: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO import_runs (environment, started_at, finished_at, status, matches_loaded, detail_json)
         VALUES (?1, ?2, NULL, 'running', 0, '{}')",
        params![environment, Utc::now().to_rfc3339()],
    )
    .context("insert import run")?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_import_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    matches_loaded: usize,
    detail_json: &str,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE import_runs
             SET finished_at = ?1, status = ?2, matches_loaded = ?3, detail_json = ?4
             WHERE run_id = ?5",
            params![
                Utc::now().to_rfc3339(),
                status,
                matches_loaded as i64,
                detail_json,
                run_id
            ],
        )
        .context("update import run")?;
    if updated == 0 {
        return Err(anyhow!("import run {run_id} not found"));
    }
    Ok(())
}

pub fn last_import_status(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT status FROM import_runs ORDER BY run_id DESC LIMIT 1",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("query last import run")
}
