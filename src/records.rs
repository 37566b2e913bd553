use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::league_rules::normalize_league_code;
use crate::score::Side;
use crate::winner::parse_indicator;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%b-%y", "%d-%b-%Y", "%m/%d/%Y", "%m/%d/%y"];
const CHECK_MARKS: &[&str] = &["\u{2713}", "\u{2714}", "x", "true", "yes", "w"];
const INDICATOR_KEYS: &[&str] = &["recorded_winner_indicator", "winner", "Winner"];

/// (snake_case prefix, scraper column prefix) for the four player slots.
pub const PLAYER_SLOTS: [(&str, &str); 4] = [
    ("home_player_1", "Home Player 1"),
    ("home_player_2", "Home Player 2"),
    ("away_player_1", "Away Player 1"),
    ("away_player_2", "Away Player 2"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerRef {
    pub external_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatchRecord {
    /// Position in the source array.
    pub index: usize,
    pub league_code: String,
    pub date: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub score: Option<String>,
    pub recorded_winner: Option<Side>,
    pub players: [PlayerRef; 4],
    /// Written by the pre-import validator.
    pub winner: Option<String>,
    pub correction_reason: Option<String>,
    indicator_key: Option<&'static str>,
}

impl RawMatchRecord {
    pub fn score_text(&self) -> &str {
        self.score.as_deref().unwrap_or_default()
    }

    /// ISO date, or `None` when absent or in an unknown format.
    pub fn normalized_date(&self) -> Option<String> {
        self.date.as_deref().and_then(normalize_date)
    }

    /// First natural-key field that is missing, if any.
    pub fn missing_key_field(&self) -> Option<&'static str> {
        if self.date.is_none() {
            return Some("date");
        }
        if self.home_team.is_none() {
            return Some("home_team");
        }
        if self.away_team.is_none() {
            return Some("away_team");
        }
        None
    }

    fn apply_to(&self, doc: &mut Value) {
        // Records without a correction are written back untouched.
        let Some(reason) = &self.correction_reason else {
            return;
        };
        let Some(obj) = doc.as_object_mut() else {
            return;
        };
        if let Some(winner) = &self.winner {
            let key = self.indicator_key.unwrap_or("winner");
            obj.insert(key.to_string(), Value::String(winner.clone()));
        }
        obj.insert("correction_reason".to_string(), Value::String(reason.clone()));
    }
}

#[derive(Debug, Clone)]
pub struct LeagueBatch {
    pub league_code: String,
    pub path: Option<PathBuf>,
    pub records: Vec<RawMatchRecord>,
    documents: Vec<Value>,
}

impl LeagueBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source JSON with the validator's corrections folded in; unknown keys are kept.
    pub fn corrected_documents(&self) -> Vec<Value> {
        let mut docs = self.documents.clone();
        for record in &self.records {
            if let Some(doc) = docs.get_mut(record.index) {
                record.apply_to(doc);
            }
        }
        docs
    }
}

pub fn discover_league_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("read data dir {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.context("read data dir entry")?.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_league_file(path: &Path) -> Result<LeagueBatch> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("league file name is not valid utf-8: {}", path.display()))?;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read league file {}", path.display()))?;
    let mut batch = parse_league_json(stem, &raw)
        .with_context(|| format!("decode league file {}", path.display()))?;
    batch.path = Some(path.to_path_buf());
    Ok(batch)
}

pub fn parse_league_json(league_code: &str, raw: &str) -> Result<LeagueBatch> {
    let league_code = normalize_league_code(league_code);
    let value = serde_json::from_str::<Value>(raw.trim()).context("invalid league json")?;
    let documents = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => return Err(anyhow!("expected a json array of matches, got {}", kind_of(&other))),
    };
    let records = documents
        .iter()
        .enumerate()
        .map(|(index, doc)| parse_record(index, doc, &league_code))
        .collect();
    Ok(LeagueBatch {
        league_code,
        path: None,
        records,
        documents,
    })
}

/// Writes corrections back over the source file (temp file + rename).
pub fn write_league_file(batch: &LeagueBatch) -> Result<PathBuf> {
    let path = batch
        .path
        .clone()
        .ok_or_else(|| anyhow!("league {} was not loaded from a file", batch.league_code))?;
    let docs = Value::Array(batch.corrected_documents());
    let json = serde_json::to_string_pretty(&docs).context("serialize corrected league json")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).context("write corrected league json")?;
    fs::rename(&tmp, &path).context("swap corrected league json")?;
    Ok(path)
}

fn parse_record(index: usize, doc: &Value, fallback_league: &str) -> RawMatchRecord {
    let league_code = text_field(doc, &["league_id", "League", "league"])
        .map(|code| normalize_league_code(&code))
        .unwrap_or_else(|| fallback_league.to_string());
    let home_team = text_field(doc, &["home_team", "Home Team"]);
    let away_team = text_field(doc, &["away_team", "Away Team"]);

    let (indicator_key, recorded_winner) = read_indicator(doc, home_team.as_deref(), away_team.as_deref());

    let players = PLAYER_SLOTS.map(|(slot, column)| {
        let id_key = format!("{slot}_id");
        let column_id_key = format!("{column} ID");
        let name_key = format!("{slot}_name");
        PlayerRef {
            external_id: text_field(doc, &[id_key.as_str(), column_id_key.as_str()]),
            name: text_field(doc, &[name_key.as_str(), column]),
        }
    });

    RawMatchRecord {
        index,
        league_code,
        date: text_field(doc, &["date", "Date"]),
        home_team,
        away_team,
        score: text_field(doc, &["score", "score_string", "Scores", "scores"]),
        recorded_winner,
        players,
        winner: None,
        correction_reason: None,
        indicator_key,
    }
}

fn read_indicator(
    doc: &Value,
    home_team: Option<&str>,
    away_team: Option<&str>,
) -> (Option<&'static str>, Option<Side>) {
    for key in INDICATOR_KEYS {
        if let Some(raw) = text_field(doc, &[*key]) {
            return (Some(*key), parse_indicator(&raw, home_team, away_team));
        }
    }
    let home_mark = is_checked(doc, &["home_winner_mark", "Home Check"]);
    let away_mark = is_checked(doc, &["away_winner_mark", "Away Check"]);
    match (home_mark, away_mark) {
        (true, false) => (None, Some(Side::Home)),
        (false, true) => (None, Some(Side::Away)),
        _ => (None, None),
    }
}

fn is_checked(doc: &Value, keys: &[&str]) -> bool {
    for key in keys {
        match doc.get(*key) {
            Some(Value::Bool(flag)) => return *flag,
            Some(Value::String(s)) => {
                let lowered = s.trim().to_lowercase();
                return CHECK_MARKS.contains(&lowered.as_str());
            }
            _ => {}
        }
    }
    false
}

fn text_field(doc: &Value, keys: &[&str]) -> Option<String> {
    let obj: &Map<String, Value> = doc.as_object()?;
    for key in keys {
        let text = match obj.get(*key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    // Scrapers sometimes append a time component.
    let mut date_part = trimmed.split_whitespace().next().unwrap_or(trimmed);
    if date_part.len() > 10 && date_part.as_bytes()[10] == b'T' {
        date_part = &date_part[..10];
    }
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(date_part, fmt)
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_date_accepts_scraper_formats() {
        assert_eq!(normalize_date("2024-09-25").as_deref(), Some("2024-09-25"));
        assert_eq!(normalize_date("25-Sep-24").as_deref(), Some("2024-09-25"));
        assert_eq!(normalize_date("25-Sep-2024").as_deref(), Some("2024-09-25"));
        assert_eq!(normalize_date("09/25/2024").as_deref(), Some("2024-09-25"));
        assert_eq!(normalize_date("2024-09-25T19:00:00").as_deref(), Some("2024-09-25"));
        assert_eq!(normalize_date("yesterday"), None);
    }

    #[test]
    fn reads_capitalised_scraper_keys() {
        let raw = r#"[{
            "Date": "25-Sep-24", "Home Team": "Tennaqua - 22", "Away Team": "Birchwood - 22",
            "Scores": "6-3, 6-2", "Winner": "home",
            "Home Player 1": "Ann Lee", "Home Player 1 ID": "nndz-1"
        }]"#;
        let batch = parse_league_json("apta_chicago", raw).unwrap();
        let rec = &batch.records[0];
        assert_eq!(rec.league_code, "APTA_CHICAGO");
        assert_eq!(rec.score.as_deref(), Some("6-3, 6-2"));
        assert_eq!(rec.recorded_winner, Some(Side::Home));
        assert_eq!(rec.players[0].external_id.as_deref(), Some("nndz-1"));
        assert_eq!(rec.players[0].name.as_deref(), Some("Ann Lee"));
        assert_eq!(rec.players[3], PlayerRef::default());
    }

    #[test]
    fn check_marks_become_indicator() {
        let raw = r#"[{ "home_team": "A - 1", "away_team": "B - 1", "away_winner_mark": "✓" }]"#;
        let batch = parse_league_json("nstf", raw).unwrap();
        assert_eq!(batch.records[0].recorded_winner, Some(Side::Away));
    }

    #[test]
    fn odd_elements_degrade_instead_of_failing() {
        let batch = parse_league_json("cita", r#"[42, {"date": null}, {}]"#).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.records.iter().all(|r| r.missing_key_field() == Some("date")));
        assert!(parse_league_json("cita", r#"{"not": "an array"}"#).is_err());
        assert!(parse_league_json("cita", "null").unwrap().is_empty());
    }

    #[test]
    fn corrected_documents_keep_unknown_keys() {
        let raw = r#"[{ "date": "2024-01-01", "Winner": "away", "extra": 7 }]"#;
        let mut batch = parse_league_json("nstf", raw).unwrap();
        batch.records[0].winner = Some("home".to_string());
        batch.records[0].correction_reason = Some("score_overrides_indicator:away".to_string());
        let docs = batch.corrected_documents();
        assert_eq!(docs[0]["Winner"], "home");
        assert_eq!(docs[0]["extra"], 7);
        assert_eq!(docs[0]["correction_reason"], "score_overrides_indicator:away");
    }

    #[test]
    fn uncorrected_documents_are_written_back_verbatim() {
        let raw = r#"[{ "date": "2024-01-01", "Winner": "Tennaqua - 22", "score": "6-1, 6-1" }]"#;
        let mut batch = parse_league_json("nstf", raw).unwrap();
        let original = batch.corrected_documents();
        batch.records[0].winner = Some("home".to_string());
        assert_eq!(batch.corrected_documents(), original);
        assert_eq!(original[0]["Winner"], "Tennaqua - 22");
        assert!(original[0].get("correction_reason").is_none());
    }
}
