use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::score::{MAX_SET_GAMES, ParsedScore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaguePolicy {
    Standard,
    SuperTiebreak,
    LenientIncomplete,
}

impl LeaguePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaguePolicy::Standard => "standard",
            LeaguePolicy::SuperTiebreak => "super_tiebreak",
            LeaguePolicy::LenientIncomplete => "lenient_incomplete",
        }
    }

    /// Leagues whose flagged ratio feeds the pre-import gate.
    pub fn is_gated(self) -> bool {
        !matches!(self, LeaguePolicy::LenientIncomplete)
    }
}

/// Score shapes the lenient policy refuses to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LivePattern {
    /// Final set separated by 0 or 1 games with no tiebreak marker.
    FinalSetMarginUnderTwo,
    /// Any set reaching 7 games without a tiebreak marker.
    UnmarkedLongSet,
    SingleSet,
    /// Final set token equal to the given text, e.g. `1-1`.
    TrailingSet(String),
}

impl LivePattern {
    pub fn matches(&self, raw: &str, parsed: &ParsedScore) -> bool {
        match self {
            LivePattern::FinalSetMarginUnderTwo => parsed
                .final_set()
                .is_some_and(|set| set.tiebreak_detail.is_none() && set.margin() <= 1),
            LivePattern::UnmarkedLongSet => parsed
                .sets
                .iter()
                .any(|set| set.tiebreak_detail.is_none() && set.max_games() >= MAX_SET_GAMES),
            LivePattern::SingleSet => parsed.sets.len() == 1,
            LivePattern::TrailingSet(text) => raw
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim() == text.trim()),
        }
    }
}

impl fmt::Display for LivePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivePattern::FinalSetMarginUnderTwo => f.write_str("final_set_margin_under_two"),
            LivePattern::UnmarkedLongSet => f.write_str("unmarked_long_set"),
            LivePattern::SingleSet => f.write_str("single_set"),
            LivePattern::TrailingSet(text) => write!(f, "trailing_set:{text}"),
        }
    }
}

impl FromStr for LivePattern {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Some(text) = trimmed.strip_prefix("trailing_set:") {
            if text.trim().is_empty() {
                return Err("trailing_set pattern needs a set score".to_string());
            }
            return Ok(LivePattern::TrailingSet(text.trim().to_string()));
        }
        match trimmed {
            "final_set_margin_under_two" => Ok(LivePattern::FinalSetMarginUnderTwo),
            "unmarked_long_set" => Ok(LivePattern::UnmarkedLongSet),
            "single_set" => Ok(LivePattern::SingleSet),
            other => Err(format!("unknown live pattern `{other}`")),
        }
    }
}

impl TryFrom<String> for LivePattern {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<LivePattern> for String {
    fn from(pattern: LivePattern) -> Self {
        pattern.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeagueRule {
    pub code: String,
    pub name: String,
    pub policy: LeaguePolicy,
}

#[derive(Debug, Clone)]
pub struct LeagueRules {
    leagues: HashMap<String, LeagueRule>,
    live_patterns: Vec<LivePattern>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    leagues: HashMap<String, RuleEntry>,
    #[serde(default)]
    live_patterns: Option<Vec<LivePattern>>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    policy: LeaguePolicy,
    #[serde(default)]
    name: Option<String>,
}

static BUILTIN: Lazy<LeagueRules> = Lazy::new(|| {
    let mut rules = LeagueRules {
        leagues: HashMap::new(),
        live_patterns: vec![
            LivePattern::FinalSetMarginUnderTwo,
            LivePattern::UnmarkedLongSet,
            LivePattern::TrailingSet("1-1".to_string()),
        ],
    };
    rules.insert("APTA_CHICAGO", "APTA Chicago", LeaguePolicy::Standard);
    rules.insert("NSTF", "North Shore Tennis Foundation", LeaguePolicy::SuperTiebreak);
    rules.insert("CNSWPL", "Chicago North Shore Women's Paddle League", LeaguePolicy::SuperTiebreak);
    rules.insert("CITA", "CITA", LeaguePolicy::LenientIncomplete);
    rules
});

impl LeagueRules {
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Built-in rules overlaid with a JSON rules file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read league rules {}", path.display()))?;
        Self::builtin().merged_with_json(&raw)
    }

    pub fn merged_with_json(mut self, raw: &str) -> Result<Self> {
        let file = serde_json::from_str::<RulesFile>(raw).context("invalid league rules json")?;
        for (code, entry) in file.leagues {
            let key = normalize_league_code(&code);
            let name = entry.name.unwrap_or_else(|| key.clone());
            self.insert(&key, &name, entry.policy);
        }
        if let Some(patterns) = file.live_patterns {
            self.live_patterns = patterns;
        }
        Ok(self)
    }

    pub fn insert(&mut self, code: &str, name: &str, policy: LeaguePolicy) {
        let code = normalize_league_code(code);
        self.leagues.insert(
            code.clone(),
            LeagueRule {
                code,
                name: name.to_string(),
                policy,
            },
        );
    }

    pub fn rule(&self, code: &str) -> Option<&LeagueRule> {
        self.leagues.get(&normalize_league_code(code))
    }

    /// Unknown leagues are scored as `Standard`.
    pub fn policy_for(&self, code: &str) -> LeaguePolicy {
        self.rule(code)
            .map(|rule| rule.policy)
            .unwrap_or(LeaguePolicy::Standard)
    }

    pub fn display_name(&self, code: &str) -> String {
        self.rule(code)
            .map(|rule| rule.name.clone())
            .unwrap_or_else(|| normalize_league_code(code))
    }

    pub fn live_patterns(&self) -> &[LivePattern] {
        &self.live_patterns
    }

    pub fn set_live_patterns(&mut self, patterns: Vec<LivePattern>) {
        self.live_patterns = patterns;
    }
}

impl Default for LeagueRules {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Canonical league code: upper case, `-` and spaces folded to `_`.
pub fn normalize_league_code(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| match ch {
            '-' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}
