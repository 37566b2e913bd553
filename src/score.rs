use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Games needed to take a regular set (with a two game margin).
pub const SET_GAMES: u32 = 6;
/// Highest game count a regular set can reach (7-5, or 7-6 after a tiebreak).
pub const MAX_SET_GAMES: u32 = 7;
/// Points needed to take a match tiebreak played in place of a third set.
pub const SUPER_TIEBREAK_POINTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }

    pub fn opponent(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetResult {
    pub home_games: u32,
    pub away_games: u32,
    pub tiebreak_detail: Option<String>,
    pub incomplete: bool,
}

impl SetResult {
    /// Side ahead in this set, finished or not.
    pub fn leader(&self) -> Option<Side> {
        if self.home_games > self.away_games {
            Some(Side::Home)
        } else if self.away_games > self.home_games {
            Some(Side::Away)
        } else {
            None
        }
    }

    /// Side that took the set; `None` while the set is unfinished.
    pub fn winner(&self) -> Option<Side> {
        if self.incomplete { None } else { self.leader() }
    }

    pub fn margin(&self) -> u32 {
        self.home_games.abs_diff(self.away_games)
    }

    pub fn max_games(&self) -> u32 {
        self.home_games.max(self.away_games)
    }
}

impl fmt::Display for SetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home_games, self.away_games)?;
        if let Some(detail) = &self.tiebreak_detail {
            write!(f, " [{detail}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedScore {
    pub sets: Vec<SetResult>,
    pub is_super_tiebreak_finish: bool,
    pub is_incomplete: bool,
}

impl ParsedScore {
    pub fn final_set(&self) -> Option<&SetResult> {
        self.sets.last()
    }

    /// Completed sets won by (home, away) among the first `count` sets.
    pub fn sets_won(&self, count: usize) -> (u32, u32) {
        let mut home = 0;
        let mut away = 0;
        for set in self.sets.iter().take(count) {
            match set.winner() {
                Some(Side::Home) => home += 1,
                Some(Side::Away) => away += 1,
                None => {}
            }
        }
        (home, away)
    }
}

impl fmt::Display for ParsedScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, set) in self.sets.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{set}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("score is empty")]
    Empty,
    #[error("set `{token}` has no game separator")]
    MissingSeparator { token: String },
    #[error("set `{token}` has a non-numeric game count")]
    NonNumeric { token: String },
    #[error("set `{token}` has a malformed tiebreak annotation")]
    MalformedTiebreak { token: String },
    #[error("set {home}-{away} is not a possible set score")]
    ImpossibleSet { home: u32, away: u32 },
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Empty => "empty",
            ParseError::MissingSeparator { .. } => "missing_separator",
            ParseError::NonNumeric { .. } => "non_numeric",
            ParseError::MalformedTiebreak { .. } => "malformed_tiebreak",
            ParseError::ImpossibleSet { .. } => "impossible_set",
        }
    }
}

pub fn parse_score(raw: &str) -> Result<ParsedScore, ParseError> {
    let normalized = raw.replace(['\u{2013}', '\u{2014}'], "-");
    let tokens = normalized
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>();
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let last = tokens.len() - 1;
    let mut sets = Vec::with_capacity(tokens.len());
    for (idx, token) in tokens.iter().enumerate() {
        sets.push(parse_set(token, idx == last)?);
    }

    let is_super_tiebreak_finish = sets
        .last()
        .is_some_and(|set| set.tiebreak_detail.is_none() && set.max_games() >= SUPER_TIEBREAK_POINTS);
    let is_incomplete = sets.iter().any(|set| set.incomplete);

    Ok(ParsedScore {
        sets,
        is_super_tiebreak_finish,
        is_incomplete,
    })
}

fn parse_set(token: &str, trailing: bool) -> Result<SetResult, ParseError> {
    let (games, tiebreak_detail) = split_tiebreak(token)?;
    let Some((home_raw, away_raw)) = games.split_once('-') else {
        return Err(ParseError::MissingSeparator {
            token: token.to_string(),
        });
    };
    let home_games = parse_games(home_raw, token)?;
    let away_games = parse_games(away_raw, token)?;
    let incomplete = classify_set(home_games, away_games, tiebreak_detail.is_some(), trailing)?;

    Ok(SetResult {
        home_games,
        away_games,
        tiebreak_detail,
        incomplete,
    })
}

/// Returns whether the set is unfinished, or an error for scores no set can end on.
fn classify_set(home: u32, away: u32, marked: bool, trailing: bool) -> Result<bool, ParseError> {
    let hi = home.max(away);
    let lo = home.min(away);
    let margin = hi - lo;

    if marked {
        return Ok(margin == 0);
    }
    if trailing && hi > MAX_SET_GAMES {
        // Match tiebreak: unfinished until someone reaches 10 with a two point lead.
        return Ok(hi < SUPER_TIEBREAK_POINTS || margin < 2);
    }
    if hi > MAX_SET_GAMES {
        return Err(ParseError::ImpossibleSet { home, away });
    }
    if lo >= SET_GAMES && margin < 2 && !(hi == SET_GAMES && lo == SET_GAMES) {
        return Err(ParseError::ImpossibleSet { home, away });
    }
    Ok(!(hi >= SET_GAMES && margin >= 2))
}

fn split_tiebreak(token: &str) -> Result<(&str, Option<String>), ParseError> {
    let malformed = || ParseError::MalformedTiebreak {
        token: token.to_string(),
    };
    let Some(open) = token.find(['[', '(']) else {
        if token.contains([']', ')']) {
            return Err(malformed());
        }
        return Ok((token.trim(), None));
    };
    let close_ch = if token[open..].starts_with('[') { ']' } else { ')' };
    let Some(close_rel) = token[open..].find(close_ch) else {
        return Err(malformed());
    };
    let close = open + close_rel;
    if !token[close + 1..].trim().is_empty() {
        return Err(malformed());
    }

    let detail = token[open + 1..close].trim();
    let valid = !detail.is_empty()
        && detail.chars().any(|ch| ch.is_ascii_digit())
        && detail
            .chars()
            .all(|ch| ch.is_ascii_digit() || ch == '-' || ch == ' ');
    if !valid {
        return Err(malformed());
    }
    Ok((token[..open].trim(), Some(detail.to_string())))
}

fn parse_games(raw: &str, token: &str) -> Result<u32, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ParseError::NonNumeric {
            token: token.to_string(),
        });
    }
    trimmed.parse::<u32>().map_err(|_| ParseError::NonNumeric {
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_sets_with_match_tiebreak() {
        let parsed = parse_score("6-3, 4-6, 10-6").unwrap();
        assert_eq!(parsed.sets.len(), 3);
        assert!(parsed.is_super_tiebreak_finish);
        assert!(!parsed.is_incomplete);
        assert_eq!(parsed.sets[2].winner(), Some(Side::Home));
    }

    #[test]
    fn keeps_tiebreak_detail() {
        let parsed = parse_score("7-6 [7-5], 6-3").unwrap();
        assert_eq!(parsed.sets[0].tiebreak_detail.as_deref(), Some("7-5"));
        assert_eq!(parsed.sets[0].winner(), Some(Side::Home));
        assert_eq!(parsed.to_string(), "7-6 [7-5], 6-3");
    }

    #[test]
    fn low_scores_are_incomplete_not_errors() {
        let parsed = parse_score("4-3").unwrap();
        assert!(parsed.is_incomplete);
        assert!(!parsed.is_super_tiebreak_finish);

        let parsed = parse_score("6-2, 6-2, 6-6").unwrap();
        assert!(parsed.is_incomplete);
        assert!(parsed.sets[2].incomplete);
        assert!(!parsed.sets[0].incomplete);
    }

    #[test]
    fn unmarked_seven_six_is_impossible() {
        assert_eq!(
            parse_score("7-6, 6-3"),
            Err(ParseError::ImpossibleSet { home: 7, away: 6 })
        );
        assert_eq!(
            parse_score("9-2, 6-3"),
            Err(ParseError::ImpossibleSet { home: 9, away: 2 })
        );
    }

    #[test]
    fn malformed_tokens_map_to_stable_errors() {
        assert_eq!(parse_score(""), Err(ParseError::Empty));
        assert_eq!(parse_score(" , "), Err(ParseError::Empty));
        assert_eq!(parse_score("63").unwrap_err().kind(), "missing_separator");
        assert_eq!(parse_score("6-x").unwrap_err().kind(), "non_numeric");
        assert_eq!(parse_score("7-6 [7-").unwrap_err().kind(), "malformed_tiebreak");
        assert_eq!(parse_score("7-6 [a-b]").unwrap_err().kind(), "malformed_tiebreak");
    }

    #[test]
    fn match_tiebreak_in_progress_is_incomplete() {
        let parsed = parse_score("6-3, 4-6, 8-6").unwrap();
        assert!(parsed.is_incomplete);
        assert!(!parsed.is_super_tiebreak_finish);

        let parsed = parse_score("6-3, 4-6, 10-9").unwrap();
        assert!(parsed.is_incomplete);
        assert!(parsed.is_super_tiebreak_finish);
    }

    #[test]
    fn en_dash_separator_is_accepted() {
        let parsed = parse_score("6\u{2013}1, 6\u{2013}2").unwrap();
        assert_eq!(parsed.to_string(), "6-1, 6-2");
    }

    #[test]
    fn parsing_is_deterministic() {
        for raw in ["6-3, 4-6, 10-6", "4-3", "7-6, 1-1", "x-1", ""] {
            assert_eq!(parse_score(raw), parse_score(raw));
        }
    }
}
