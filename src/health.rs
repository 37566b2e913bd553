use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

pub const WEIGHT_LEAGUE_REFS: f64 = 0.15;
pub const WEIGHT_TEAM_REFS: f64 = 0.15;
pub const WEIGHT_STATS_COVERAGE: f64 = 0.35;
pub const WEIGHT_WINNER_RESOLUTION: f64 = 0.35;

/// Per-league resolution below this is worth a warning but not a critical issue.
pub const RESOLUTION_WARN_BELOW: f64 = 0.95;

#[derive(Debug, Clone, Serialize)]
pub struct LeagueHealth {
    pub league: String,
    pub matches: i64,
    pub resolved: i64,
    pub resolution_ratio: f64,
    /// Points this league adds to the overall score through winner resolution.
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub score: f64,
    pub coverage_ratios_by_check: BTreeMap<String, f64>,
    pub critical_issues: Vec<String>,
    pub warnings: Vec<String>,
    pub per_league: Vec<LeagueHealth>,
    pub threshold: f64,
    pub passed: bool,
    pub generated_at: String,
}

impl HealthReport {
    pub fn ratio(&self, check: &str) -> Option<f64> {
        self.coverage_ratios_by_check.get(check).copied()
    }
}

/// `good / total`, or 1.0 with a warning when there is nothing to measure.
fn ratio(check: &str, good: i64, total: i64, warnings: &mut Vec<String>) -> f64 {
    if total <= 0 {
        warnings.push(format!("{check}: no rows to measure, counted as 1.0"));
        return 1.0;
    }
    good.clamp(0, total) as f64 / total as f64
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("health query: {sql}"))
}

/// Scores the persisted store. Reads only; safe to run against a live database.
pub fn evaluate(conn: &Connection, threshold: f64) -> Result<HealthReport> {
    let mut critical_issues = Vec::new();
    let mut warnings = Vec::new();

    let total_matches = count(conn, "SELECT COUNT(*) FROM matches")?;
    if total_matches == 0 {
        warnings.push("store holds no matches".to_string());
    }

    let dangling_leagues = count(
        conn,
        "SELECT COUNT(*) FROM matches m LEFT JOIN leagues l ON l.id = m.league_id WHERE l.id IS NULL",
    )?;
    if dangling_leagues > 0 {
        critical_issues.push(format!(
            "{dangling_leagues} matches reference a missing league"
        ));
    }

    let dangling_teams = count(
        conn,
        "SELECT COUNT(*) FROM matches m
         LEFT JOIN teams h ON h.id = m.home_team_id
         LEFT JOIN teams a ON a.id = m.away_team_id
         WHERE h.id IS NULL OR a.id IS NULL",
    )?;
    if dangling_teams > 0 {
        critical_issues.push(format!(
            "{dangling_teams} matches reference a missing home or away team"
        ));
    }

    let teams_with_matches = count(
        conn,
        "SELECT COUNT(*) FROM (
            SELECT home_team_id AS team_id FROM matches
            UNION SELECT away_team_id FROM matches
         )",
    )?;
    let missing_stats = teams_missing_stats(conn)?;
    if !missing_stats.is_empty() {
        critical_issues.push(format!(
            "{} teams with matches have no team_stats row: {}",
            missing_stats.len(),
            missing_stats.join(", ")
        ));
    }

    let per_league_rows = league_resolution(conn)?;
    let resolved_total: i64 = per_league_rows.iter().map(|(_, _, resolved)| resolved).sum();

    let mut ratios = BTreeMap::new();
    ratios.insert(
        "league_refs".to_string(),
        ratio("league_refs", total_matches - dangling_leagues, total_matches, &mut warnings),
    );
    ratios.insert(
        "team_refs".to_string(),
        ratio("team_refs", total_matches - dangling_teams, total_matches, &mut warnings),
    );
    ratios.insert(
        "stats_coverage".to_string(),
        ratio(
            "stats_coverage",
            teams_with_matches - missing_stats.len() as i64,
            teams_with_matches,
            &mut warnings,
        ),
    );
    ratios.insert(
        "winner_resolution".to_string(),
        ratio("winner_resolution", resolved_total, total_matches, &mut warnings),
    );

    let per_league = per_league_rows
        .into_iter()
        .map(|(league, matches, resolved)| {
            let resolution_ratio = if matches > 0 {
                resolved as f64 / matches as f64
            } else {
                1.0
            };
            if resolution_ratio < RESOLUTION_WARN_BELOW {
                warnings.push(format!(
                    "{league}: winner resolution {:.1}% ({resolved}/{matches})",
                    resolution_ratio * 100.0
                ));
            }
            let share = if total_matches > 0 {
                matches as f64 / total_matches as f64
            } else {
                0.0
            };
            LeagueHealth {
                contribution: 100.0 * WEIGHT_WINNER_RESOLUTION * share * resolution_ratio,
                league,
                matches,
                resolved,
                resolution_ratio,
            }
        })
        .collect::<Vec<_>>();

    let score = 100.0
        * (WEIGHT_LEAGUE_REFS * ratios["league_refs"]
            + WEIGHT_TEAM_REFS * ratios["team_refs"]
            + WEIGHT_STATS_COVERAGE * ratios["stats_coverage"]
            + WEIGHT_WINNER_RESOLUTION * ratios["winner_resolution"]);
    let score = (score * 100.0).round() / 100.0;
    let passed = score >= threshold && critical_issues.is_empty();

    for issue in &critical_issues {
        warn!(%issue, "CRITICAL health issue");
    }
    info!(score, threshold, passed, "health check complete");

    Ok(HealthReport {
        score,
        coverage_ratios_by_check: ratios,
        critical_issues,
        warnings,
        per_league,
        threshold,
        passed,
        generated_at: Utc::now().to_rfc3339(),
    })
}

fn teams_missing_stats(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT ids.team_id, t.name FROM (
                SELECT home_team_id AS team_id FROM matches
                UNION SELECT away_team_id FROM matches
             ) ids
             LEFT JOIN teams t ON t.id = ids.team_id
             LEFT JOIN team_stats s ON s.team_id = ids.team_id
             WHERE s.team_id IS NULL
             ORDER BY ids.team_id",
        )
        .context("prepare team stats coverage")?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let name: Option<String> = row.get(1)?;
            Ok(name.unwrap_or_else(|| format!("#{id}")))
        })
        .context("query team stats coverage")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read team stats coverage")?);
    }
    Ok(out)
}

/// `(league, matches, resolved)` per league, resolved meaning definitive or corrected.
fn league_resolution(conn: &Connection) -> Result<Vec<(String, i64, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(l.league_code, '#' || m.league_id),
                    COUNT(*),
                    SUM(CASE WHEN m.winner_confidence IN ('definitive', 'corrected') THEN 1 ELSE 0 END)
             FROM matches m
             LEFT JOIN leagues l ON l.id = m.league_id
             GROUP BY m.league_id
             ORDER BY 1",
        )
        .context("prepare winner resolution")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .context("query winner resolution")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read winner resolution")?);
    }
    Ok(out)
}

/// Writes `health_<timestamp>.json` into `dir`. Artifacts are never overwritten.
pub fn write_artifact(report: &HealthReport, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create report dir {}", dir.display()))?;
    let path = dir.join(format!(
        "health_{}.json",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    let json = serde_json::to_vec_pretty(report).context("serialize health report")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(path)
}
