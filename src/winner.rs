use std::fmt;

use serde::Serialize;

use crate::league_rules::{LeaguePolicy, LeagueRules, LivePattern};
use crate::score::{ParseError, ParsedScore, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Home,
    Away,
    Indeterminate,
}

impl Winner {
    pub fn as_str(self) -> &'static str {
        match self {
            Winner::Home => "home",
            Winner::Away => "away",
            Winner::Indeterminate => "indeterminate",
        }
    }

    pub fn side(self) -> Option<Side> {
        match self {
            Winner::Home => Some(Side::Home),
            Winner::Away => Some(Side::Away),
            Winner::Indeterminate => None,
        }
    }
}

impl From<Side> for Winner {
    fn from(side: Side) -> Self {
        match side {
            Side::Home => Winner::Home,
            Side::Away => Winner::Away,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Definitive,
    Corrected,
    Unresolved,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Definitive => "definitive",
            Confidence::Corrected => "corrected",
            Confidence::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WinnerDecision {
    pub winner: Winner,
    pub confidence: Confidence,
    pub reason: String,
}

impl WinnerDecision {
    pub fn indeterminate(reason: impl Into<String>) -> Self {
        Self {
            winner: Winner::Indeterminate,
            confidence: Confidence::Unresolved,
            reason: reason.into(),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.winner == Winner::Indeterminate
    }
}

/// Outcome of applying one policy to a parsed score, before the indicator is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided { side: Side, reason: &'static str },
    Unresolved { reason: String },
}

type Resolver = fn(&str, &ParsedScore, &[LivePattern]) -> Resolution;

fn resolver_for(policy: LeaguePolicy) -> Resolver {
    match policy {
        LeaguePolicy::Standard => resolve_standard,
        LeaguePolicy::SuperTiebreak => resolve_super_tiebreak,
        LeaguePolicy::LenientIncomplete => resolve_lenient,
    }
}

/// Decides a match for `league` from its score and scraped winner indicator.
pub fn determine(
    raw_score: &str,
    parsed: &Result<ParsedScore, ParseError>,
    league: &str,
    rules: &LeagueRules,
    indicator: Option<Side>,
) -> WinnerDecision {
    determine_with_policy(
        raw_score,
        parsed,
        rules.policy_for(league),
        rules.live_patterns(),
        indicator,
    )
}

pub fn determine_with_policy(
    raw_score: &str,
    parsed: &Result<ParsedScore, ParseError>,
    policy: LeaguePolicy,
    live_patterns: &[LivePattern],
    indicator: Option<Side>,
) -> WinnerDecision {
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            return match indicator {
                Some(side) => WinnerDecision {
                    winner: side.into(),
                    confidence: Confidence::Unresolved,
                    reason: format!("indicator_fallback:{}", err.kind()),
                },
                None => WinnerDecision::indeterminate(format!("unparseable_score:{}", err.kind())),
            };
        }
    };

    match resolver_for(policy)(raw_score, parsed, live_patterns) {
        Resolution::Decided { side, reason } => match indicator {
            Some(recorded) if recorded != side => WinnerDecision {
                winner: side.into(),
                confidence: Confidence::Corrected,
                reason: format!("score_overrides_indicator:{}", recorded.as_str()),
            },
            _ => WinnerDecision {
                winner: side.into(),
                confidence: Confidence::Definitive,
                reason: reason.to_string(),
            },
        },
        Resolution::Unresolved { reason } => WinnerDecision::indeterminate(reason),
    }
}

fn resolve_standard(_raw: &str, parsed: &ParsedScore, _patterns: &[LivePattern]) -> Resolution {
    let count = parsed.sets.len();
    if let Some(pos) = parsed.sets.iter().position(|set| set.incomplete)
        && pos + 1 < count
    {
        return Resolution::Unresolved {
            reason: "incomplete_set".to_string(),
        };
    }

    let final_incomplete = parsed.final_set().is_some_and(|set| set.incomplete);
    if final_incomplete {
        let (home, away) = parsed.sets_won(count - 1);
        return match (home, away) {
            (h, a) if h >= 2 && h > a => Resolution::Decided {
                side: Side::Home,
                reason: "decided_before_incomplete_final_set",
            },
            (h, a) if a >= 2 && a > h => Resolution::Decided {
                side: Side::Away,
                reason: "decided_before_incomplete_final_set",
            },
            _ => Resolution::Unresolved {
                reason: "incomplete_final_set".to_string(),
            },
        };
    }

    majority(parsed, count, "set_majority")
}

fn resolve_super_tiebreak(raw: &str, parsed: &ParsedScore, patterns: &[LivePattern]) -> Resolution {
    if parsed.sets.len() != 3 || parsed.sets_won(2) != (1, 1) {
        return resolve_standard(raw, parsed, patterns);
    }
    // At one set all, the third entry is a match tiebreak; it decides only once it is finished.
    match parsed.sets[2].winner() {
        Some(side) => Resolution::Decided {
            side,
            reason: "super_tiebreak",
        },
        None => Resolution::Unresolved {
            reason: "incomplete_final_set".to_string(),
        },
    }
}

fn resolve_lenient(raw: &str, parsed: &ParsedScore, patterns: &[LivePattern]) -> Resolution {
    if let Some(pattern) = patterns.iter().find(|p| p.matches(raw, parsed)) {
        return Resolution::Unresolved {
            reason: format!("live_pattern:{pattern}"),
        };
    }
    resolve_standard(raw, parsed, patterns)
}

fn majority(parsed: &ParsedScore, count: usize, reason: &'static str) -> Resolution {
    let (home, away) = parsed.sets_won(count);
    if home > away {
        Resolution::Decided {
            side: Side::Home,
            reason,
        }
    } else if away > home {
        Resolution::Decided {
            side: Side::Away,
            reason,
        }
    } else {
        Resolution::Unresolved {
            reason: "no_decider".to_string(),
        }
    }
}

/// Reads a scraped winner field holding a side name or one of the team names.
pub fn parse_indicator(raw: &str, home_team: Option<&str>, away_team: Option<&str>) -> Option<Side> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    match lowered.as_str() {
        "home" | "h" | "home_team" => return Some(Side::Home),
        "away" | "a" | "away_team" => return Some(Side::Away),
        _ => {}
    }
    if home_team.is_some_and(|team| team.trim().eq_ignore_ascii_case(trimmed)) {
        return Some(Side::Home);
    }
    if away_team.is_some_and(|team| team.trim().eq_ignore_ascii_case(trimmed)) {
        return Some(Side::Away);
    }
    None
}
